//! Cgroup membership for launched tasks
//!
//! Controller logic (limits, accounting) lives outside this core; the
//! launcher only needs to move the intermediary into the container's
//! cgroups before it clones the task.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::errors::{Error, ErrorKind, Result};

/// A handle to an existing cgroup directory
#[derive(Debug, Clone)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    /// Wrap an existing cgroup path
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.join("cgroup.procs").exists() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("not a cgroup: {}", path.display()),
            ));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move `pid` into this cgroup
    pub fn attach(&self, pid: i32) -> Result<()> {
        let procs = self.path.join("cgroup.procs");
        let mut file = fs::OpenOptions::new().write(true).open(&procs).map_err(|e| {
            Error::from_errno(
                ErrorKind::Unknown,
                e.raw_os_error().unwrap_or(0),
                format!("open {}", procs.display()),
            )
        })?;
        write!(file, "{}", pid).map_err(|e| {
            Error::from_errno(
                ErrorKind::Unknown,
                e.raw_os_error().unwrap_or(0),
                format!("attach pid {} to {}", pid, self.path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;

    #[test]
    fn open_rejects_plain_directories() {
        let dir = tempfile::tempdir().unwrap();
        let err = Cgroup::open(dir.path()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn open_accepts_cgroup_shaped_directories() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("cgroup.procs")).unwrap();
        let cg = Cgroup::open(dir.path()).unwrap();
        assert_eq!(cg.path(), dir.path());
    }

    #[test]
    fn attach_writes_the_pid() {
        let dir = tempfile::tempdir().unwrap();
        File::create(dir.path().join("cgroup.procs")).unwrap();
        let cg = Cgroup::open(dir.path()).unwrap();
        cg.attach(1234).unwrap();
        let content = fs::read_to_string(dir.path().join("cgroup.procs")).unwrap();
        assert_eq!(content, "1234");
    }
}
