//! Namespace descriptors and scoped namespace entry

use std::fs::File;
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;

use log::error;
use nix::sched::{setns, unshare, CloneFlags};
use nix::sys::stat::fstat;

use crate::errors::{Error, ErrorKind, Result};
use crate::utils::get_tid;

/// The namespace kinds the launcher can join
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    Net,
    Ipc,
    Uts,
    Pid,
    Mnt,
}

impl NsKind {
    pub fn name(self) -> &'static str {
        match self {
            NsKind::Net => "net",
            NsKind::Ipc => "ipc",
            NsKind::Uts => "uts",
            NsKind::Pid => "pid",
            NsKind::Mnt => "mnt",
        }
    }

    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Net => CloneFlags::CLONE_NEWNET,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Mnt => CloneFlags::CLONE_NEWNS,
        }
    }
}

/// An open `/proc/<tid>/ns/<kind>` descriptor
#[derive(Debug)]
pub struct NamespaceHandle {
    fd: OwnedFd,
}

impl NamespaceHandle {
    /// Open the namespace of a live thread
    pub fn open(tid: i32, kind: NsKind) -> Result<Self> {
        Self::open_path(format!("/proc/{}/ns/{}", tid, kind.name()).as_ref())
    }

    /// Open the calling thread's namespace
    pub fn open_self(kind: NsKind) -> Result<Self> {
        Self::open(get_tid(), kind)
    }

    /// Open a bound namespace file, e.g. `/var/run/netns/<name>`
    pub fn open_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            Error::from_errno(
                ErrorKind::Unknown,
                e.raw_os_error().unwrap_or(0),
                format!("open {}", path.display()),
            )
        })?;
        Ok(Self { fd: file.into() })
    }

    /// Enter the namespace; `flags` guards against joining the wrong kind
    pub fn set_ns(&self, flags: CloneFlags) -> Result<()> {
        setns(&self.fd, flags)
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, format!("setns({:?})", flags)))
    }

    /// Namespace identity: the inode of the descriptor
    pub fn inode(&self) -> Result<u64> {
        let stat = fstat(self.fd.as_raw_fd())
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "fstat(nsfd)"))?;
        Ok(stat.st_ino)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Scoped network-namespace entry: opens the current netns, enters the
/// target, and restores the original on drop no matter how the scope ends.
pub struct NetnsGuard {
    original: NamespaceHandle,
}

impl NetnsGuard {
    /// Enter `target`'s network namespace
    pub fn enter(target: &NamespaceHandle) -> Result<Self> {
        let original = NamespaceHandle::open_self(NsKind::Net)?;
        target.set_ns(CloneFlags::CLONE_NEWNET)?;
        Ok(Self { original })
    }

    /// Unshare into a brand-new network namespace
    pub fn enter_new() -> Result<(Self, NamespaceHandle)> {
        let original = NamespaceHandle::open_self(NsKind::Net)?;
        unshare(CloneFlags::CLONE_NEWNET).map_err(|e| {
            Error::from_errno(ErrorKind::Unknown, e as i32, "unshare(CLONE_NEWNET)")
        })?;
        let new_ns = NamespaceHandle::open_self(NsKind::Net)?;
        Ok((Self { original }, new_ns))
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = self.original.set_ns(CloneFlags::CLONE_NEWNET) {
            // Losing the original namespace would poison the whole thread.
            error!("cannot restore network namespace: {}", e);
        }
    }
}

/// The set of namespace descriptors a task joins before exec
#[derive(Debug, Default)]
pub struct NamespaceSet {
    pub ipc: Option<NamespaceHandle>,
    pub uts: Option<NamespaceHandle>,
    pub net: Option<NamespaceHandle>,
    pub pid: Option<NamespaceHandle>,
    pub mnt: Option<NamespaceHandle>,
}

impl NamespaceSet {
    /// Join every configured namespace, IPC first, mount last
    pub fn enter_all(&self) -> Result<()> {
        for (handle, kind) in [
            (&self.ipc, NsKind::Ipc),
            (&self.uts, NsKind::Uts),
            (&self.net, NsKind::Net),
            (&self.pid, NsKind::Pid),
            (&self.mnt, NsKind::Mnt),
        ] {
            if let Some(ns) = handle {
                ns.set_ns(kind.clone_flag()).map_err(|e| Error {
                    text: format!("setns({}): {}", kind.name(), e.text),
                    ..e
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_match_procfs() {
        assert_eq!(NsKind::Net.name(), "net");
        assert_eq!(NsKind::Mnt.name(), "mnt");
        assert_eq!(NsKind::Pid.clone_flag(), CloneFlags::CLONE_NEWPID);
    }

    #[test]
    fn open_self_netns_and_inode() {
        let ns = NamespaceHandle::open_self(NsKind::Net).unwrap();
        let inode = ns.inode().unwrap();
        assert!(inode > 0);

        // the same namespace opened twice has the same identity
        let again = NamespaceHandle::open_self(NsKind::Net).unwrap();
        assert_eq!(inode, again.inode().unwrap());
    }

    #[test]
    fn open_missing_path_fails() {
        let err = NamespaceHandle::open_path(Path::new("/var/run/netns/no-such-ns")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn empty_namespace_set_enters_nothing() {
        NamespaceSet::default().enter_all().unwrap();
    }
}
