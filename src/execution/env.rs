//! Per-launch task environment
//!
//! [`TaskEnv`] bundles everything the fork/clone choreography needs:
//! control sockets, namespace descriptors, credentials, capability sets,
//! resource limits, scheduling knobs, mounts, devices and stdio. It lives
//! only for the duration of one start sequence.

use std::ffi::CString;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chown, setgid, setgroups, setuid, Gid, Uid};

use crate::config::SysctlPair;
use crate::errors::{Error, ErrorKind, Result};
use crate::execution::control::ControlSocket;
use crate::isolation::namespace::NamespaceSet;
use crate::resources::cgroup::Cgroup;

/// Uid/gid plus supplementary groups applied inside the container
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Credentials {
    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// Drop to the configured identity: groups first, then gid, then uid
    pub fn apply(&self) -> Result<()> {
        let groups: Vec<Gid> = self.groups.iter().map(|&g| Gid::from_raw(g)).collect();
        setgroups(&groups)
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "setgroups"))?;
        setgid(Gid::from_raw(self.gid))
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "setgid"))?;
        setuid(Uid::from_raw(self.uid))
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "setuid"))?;
        Ok(())
    }
}

const PR_CAP_AMBIENT: libc::c_int = 47;
const PR_CAP_AMBIENT_RAISE: libc::c_ulong = 2;
const PR_CAPBSET_READ: libc::c_int = 23;
const PR_CAPBSET_DROP: libc::c_int = 24;

const LINUX_CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapUserHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct CapUserData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// A capability mask with the three application modes the launcher uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapSet {
    pub bits: u64,
}

impl CapSet {
    pub fn new(bits: u64) -> Self {
        Self { bits }
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    fn last_cap() -> u32 {
        std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(40)
    }

    fn capset(data: &[CapUserData; 2]) -> Result<()> {
        let header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let ret = unsafe { libc::syscall(libc::SYS_capset, &header, data.as_ptr()) };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, "capset"));
        }
        Ok(())
    }

    fn capget() -> Result<[CapUserData; 2]> {
        let header = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let mut data = [CapUserData::default(); 2];
        let ret = unsafe { libc::syscall(libc::SYS_capget, &header, data.as_mut_ptr()) };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, "capget"));
        }
        Ok(data)
    }

    fn split(bits: u64) -> (u32, u32) {
        (bits as u32, (bits >> 32) as u32)
    }

    /// Drop every capability outside the mask from the bounding set
    pub fn apply_limit(&self) -> Result<()> {
        for cap in 0..=Self::last_cap() {
            if self.bits & (1u64 << cap) != 0 {
                continue;
            }
            let supported =
                unsafe { libc::prctl(PR_CAPBSET_READ, cap as libc::c_ulong, 0, 0, 0) } >= 0;
            if !supported {
                continue;
            }
            let ret = unsafe { libc::prctl(PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) };
            if ret < 0 {
                return Err(Error::os(ErrorKind::Unknown, format!("capbset drop {}", cap)));
            }
        }
        Ok(())
    }

    /// Raise the mask into the ambient set (inheritable must hold it first)
    pub fn apply_ambient(&self) -> Result<()> {
        let mut data = Self::capget()?;
        let (low, high) = Self::split(self.bits);
        data[0].inheritable = low & data[0].permitted;
        data[1].inheritable = high & data[1].permitted;
        Self::capset(&data)?;

        for cap in 0..=Self::last_cap() {
            if self.bits & (1u64 << cap) == 0 {
                continue;
            }
            let ret = unsafe {
                libc::prctl(PR_CAP_AMBIENT, PR_CAP_AMBIENT_RAISE, cap as libc::c_ulong, 0, 0)
            };
            if ret < 0 {
                return Err(Error::os(ErrorKind::Unknown, format!("ambient raise {}", cap)));
            }
        }
        Ok(())
    }

    /// Capabilities portoinit keeps: enough to supervise and reap
    pub const PORTOINIT: CapSet = CapSet {
        bits: 1 << 5, // CAP_KILL
    };

    /// Set the effective and permitted sets to exactly the mask
    pub fn apply_effective(&self) -> Result<()> {
        let (low, high) = Self::split(self.bits);
        let data = [
            CapUserData {
                effective: low,
                permitted: low,
                inheritable: low,
            },
            CapUserData {
                effective: high,
                permitted: high,
                inheritable: high,
            },
        ];
        Self::capset(&data)
    }
}

/// One resource limit in `setrlimit` terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ulimit {
    pub resource: u32,
    pub soft: libc::rlim_t,
    pub hard: libc::rlim_t,
}

impl Ulimit {
    /// Parse `name` (the `ulimit` spelling) and `soft [hard]` values;
    /// `unlimited` maps to `RLIM_INFINITY`.
    pub fn parse(name: &str, value: &str) -> Result<Self> {
        let resource = match name {
            "as" => libc::RLIMIT_AS as u32,
            "core" => libc::RLIMIT_CORE as u32,
            "cpu" => libc::RLIMIT_CPU as u32,
            "data" => libc::RLIMIT_DATA as u32,
            "fsize" => libc::RLIMIT_FSIZE as u32,
            "locks" => libc::RLIMIT_LOCKS as u32,
            "memlock" => libc::RLIMIT_MEMLOCK as u32,
            "msgqueue" => libc::RLIMIT_MSGQUEUE as u32,
            "nice" => libc::RLIMIT_NICE as u32,
            "nofile" => libc::RLIMIT_NOFILE as u32,
            "nproc" => libc::RLIMIT_NPROC as u32,
            "rss" => libc::RLIMIT_RSS as u32,
            "rtprio" => libc::RLIMIT_RTPRIO as u32,
            "rttime" => libc::RLIMIT_RTTIME as u32,
            "sigpending" => libc::RLIMIT_SIGPENDING as u32,
            "stack" => libc::RLIMIT_STACK as u32,
            _ => {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("unknown ulimit {}", name),
                ))
            }
        };

        let parse_one = |s: &str| -> Result<libc::rlim_t> {
            if s == "unlimited" || s == "unlim" {
                Ok(libc::RLIM_INFINITY)
            } else {
                s.parse().map_err(|_| {
                    Error::new(
                        ErrorKind::InvalidValue,
                        format!("invalid ulimit {} value {}", name, s),
                    )
                })
            }
        };

        let mut fields = value.split_whitespace();
        let soft = parse_one(fields.next().ok_or_else(|| {
            Error::new(ErrorKind::InvalidValue, format!("empty ulimit {}", name))
        })?)?;
        let hard = match fields.next() {
            Some(s) => parse_one(s)?,
            None => soft,
        };
        Ok(Self {
            resource,
            soft,
            hard,
        })
    }

    pub fn apply(&self) -> Result<()> {
        let lim = libc::rlimit {
            rlim_cur: self.soft,
            rlim_max: self.hard,
        };
        let ret = unsafe { libc::setrlimit(self.resource as _, &lim) };
        if ret < 0 {
            return Err(Error::os(
                ErrorKind::Unknown,
                format!("setrlimit {}", self.resource),
            ));
        }
        Ok(())
    }
}

/// Scheduling knobs applied in the intermediary before namespace entry
#[derive(Debug, Clone)]
pub struct TaskSched {
    pub policy: libc::c_int,
    pub prio: libc::c_int,
    pub nice: libc::c_int,
    pub ioprio: libc::c_int,
    pub oom_score_adj: i32,
}

impl Default for TaskSched {
    fn default() -> Self {
        Self {
            policy: libc::SCHED_OTHER,
            prio: 0,
            nice: 0,
            ioprio: 0,
            oom_score_adj: 0,
        }
    }
}

impl TaskSched {
    pub fn apply(&self) -> Result<()> {
        let error = std::fs::write("/proc/self/oom_score_adj", self.oom_score_adj.to_string());
        if let Err(e) = error {
            // only a configured adjustment is worth failing the start
            if self.oom_score_adj != 0 {
                return Err(Error::from_errno(
                    ErrorKind::Unknown,
                    e.raw_os_error().unwrap_or(0),
                    "oom_score_adj",
                ));
            }
        }

        if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, self.nice) } < 0 {
            return Err(Error::os(ErrorKind::Unknown, "setpriority"));
        }

        let param = libc::sched_param {
            sched_priority: self.prio,
        };
        if unsafe { libc::sched_setscheduler(0, self.policy, &param) } < 0 {
            return Err(Error::os(ErrorKind::Unknown, "sched_setscheduler"));
        }

        const IOPRIO_WHO_PROCESS: libc::c_int = 1;
        let ret = unsafe {
            libc::syscall(
                libc::SYS_ioprio_set,
                IOPRIO_WHO_PROCESS,
                0,
                self.ioprio,
            )
        };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, "ioprio_set"));
        }
        Ok(())
    }
}

/// Where one standard stream comes from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdStream {
    /// Keep the inherited descriptor
    #[default]
    Inherit,
    /// Opened by the intermediary before entering namespaces (host path)
    Outside(PathBuf),
    /// Opened by the child after mount setup (container path)
    Inside(PathBuf),
}

/// Stdio wiring for the launched task
#[derive(Debug, Clone, Default)]
pub struct Stdio {
    pub stdin: StdStream,
    pub stdout: StdStream,
    pub stderr: StdStream,
}

impl Stdio {
    fn open_stream(stream: &StdStream, target_fd: i32, inside: bool) -> Result<()> {
        let path = match (stream, inside) {
            (StdStream::Outside(path), false) => path,
            (StdStream::Inside(path), true) => path,
            _ => return Ok(()),
        };

        let mut options = OpenOptions::new();
        if target_fd == 0 {
            options.read(true);
        } else {
            options.write(true).create(true).append(true).mode(0o644);
        }
        let file = options.open(path).map_err(|e| {
            Error::from_errno(
                ErrorKind::InvalidValue,
                e.raw_os_error().unwrap_or(0),
                format!("open {}", path.display()),
            )
        })?;

        let ret = unsafe { libc::dup2(file.as_raw_fd(), target_fd) };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, "dup2"));
        }
        Ok(())
    }

    fn apply(&self, inside: bool) -> Result<()> {
        Self::open_stream(&self.stdin, 0, inside)?;
        Self::open_stream(&self.stdout, 1, inside)?;
        Self::open_stream(&self.stderr, 2, inside)?;
        Ok(())
    }

    /// Host-path streams, opened in the intermediary
    pub fn apply_outside(&self) -> Result<()> {
        self.apply(false)
    }

    /// Container-path streams, opened in the child after mounts
    pub fn apply_inside(&self) -> Result<()> {
        self.apply(true)
    }
}

/// A device node created inside the container
#[derive(Debug, Clone)]
pub struct DeviceNode {
    pub path: PathBuf,
    pub char_device: bool,
    pub major: u64,
    pub minor: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

impl DeviceNode {
    pub fn makedev(&self) -> Result<()> {
        let kind = if self.char_device {
            SFlag::S_IFCHR
        } else {
            SFlag::S_IFBLK
        };
        let dev = nix::sys::stat::makedev(self.major, self.minor);
        mknod(
            &self.path,
            kind,
            Mode::from_bits_truncate(self.mode),
            dev,
        )
        .map_err(|e| {
            Error::from_errno(
                ErrorKind::Unknown,
                e as i32,
                format!("mknod {}", self.path.display()),
            )
        })?;
        chown(
            &self.path,
            Some(Uid::from_raw(self.uid)),
            Some(Gid::from_raw(self.gid)),
        )
        .map_err(|e| {
            Error::from_errno(
                ErrorKind::Unknown,
                e as i32,
                format!("chown {}", self.path.display()),
            )
        })
    }
}

/// One mount performed inside the new mount namespace
#[derive(Debug, Clone)]
pub struct MountSpec {
    pub source: PathBuf,
    pub target: PathBuf,
    pub fstype: Option<String>,
    pub flags: nix::mount::MsFlags,
    pub data: Option<String>,
}

/// Mount-namespace setup delegated to the child
#[derive(Debug, Clone, Default)]
pub struct MountSetup {
    pub mounts: Vec<MountSpec>,
    pub cwd: PathBuf,
}

impl MountSetup {
    /// Apply the configured mounts in order
    pub fn setup(&self) -> Result<()> {
        use nix::mount::mount;

        for m in &self.mounts {
            mount(
                Some(m.source.as_path()),
                m.target.as_path(),
                m.fstype.as_deref(),
                m.flags,
                m.data.as_deref(),
            )
            .map_err(|e| {
                Error::from_errno(
                    ErrorKind::Unknown,
                    e as i32,
                    format!("mount {} -> {}", m.source.display(), m.target.display()),
                )
            })?;
        }
        Ok(())
    }

    /// Hide the host-sensitive corners of `/proc` behind read-only binds
    pub fn protect_proc(&self) -> Result<()> {
        use nix::mount::{mount, MsFlags};

        for path in ["/proc/sysrq-trigger", "/proc/irq", "/proc/bus"] {
            if !Path::new(path).exists() {
                continue;
            }
            mount(
                Some(Path::new(path)),
                Path::new(path),
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )
            .and_then(|_| {
                mount(
                    None::<&str>,
                    Path::new(path),
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )
            })
            .map_err(|e| {
                Error::from_errno(ErrorKind::Unknown, e as i32, format!("protect {}", path))
            })?;
        }
        Ok(())
    }
}

/// Environment variables handed to the exec'ed command
#[derive(Debug, Clone, Default)]
pub struct TaskEnvVars {
    pub vars: Vec<(String, String)>,
}

impl TaskEnvVars {
    /// Export into this process so `$VAR` expansion sees them
    pub fn apply(&self) {
        for (key, value) in &self.vars {
            std::env::set_var(key, value);
        }
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.vars
            .iter()
            .rev()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .or_else(|| std::env::var(name).ok())
    }

    /// `KEY=VALUE` strings for `execvpe`
    pub fn envp(&self) -> Vec<CString> {
        self.vars
            .iter()
            .filter_map(|(key, value)| CString::new(format!("{}={}", key, value)).ok())
            .collect()
    }
}

/// Everything one task launch needs; dropped (and with it every
/// descriptor) at exec or abort
pub struct TaskEnv {
    /// Container name, used by portoinit and for logging
    pub name: String,
    /// Container id, the minor of its tc class
    pub id: u32,
    /// Command line, shell-expanded at exec
    pub command: String,
    /// Meta containers exec portoinit instead of a command
    pub meta: bool,
    pub env: TaskEnvVars,
    pub cwd: PathBuf,
    pub hostname: Option<String>,
    pub resolv_conf: Option<String>,

    pub isolate: bool,
    pub net_isolate: bool,
    pub new_mount_ns: bool,
    pub triple_fork: bool,
    pub quadro_fork: bool,

    pub namespaces: NamespaceSet,
    /// Directory descriptor of the chroot target
    pub root_fd: Option<OwnedFd>,
    /// Directory descriptor of the working directory outside the chroot
    pub cwd_fd: Option<OwnedFd>,

    pub cgroups: Vec<Cgroup>,
    pub credentials: Credentials,
    pub cap_ambient: CapSet,
    pub cap_bound: CapSet,
    pub ulimits: Vec<Ulimit>,
    pub sched: TaskSched,
    pub stdio: Stdio,
    pub devices: Vec<DeviceNode>,
    pub mounts: MountSetup,
    pub umask: u32,
    pub login_uid: u32,
    pub ipc_sysctl: Vec<SysctlPair>,
    pub user_sysctl: Vec<SysctlPair>,

    pub autoconf: Vec<String>,
    pub autoconf_timeout_s: u64,
    pub start_timeout_ms: u64,

    /// Executable descriptor of the in-container init helper
    pub portoinit: Option<OwnedFd>,

    pub(crate) master_sock: Option<ControlSocket>,
    pub(crate) sock: Option<ControlSocket>,
    pub(crate) master_sock2: Option<ControlSocket>,
    pub(crate) sock2: Option<ControlSocket>,
    pub(crate) report_stage: u32,
}

impl TaskEnv {
    pub fn new(name: &str, id: u32, command: &str) -> Self {
        Self {
            name: name.to_string(),
            id,
            command: command.to_string(),
            meta: false,
            env: TaskEnvVars::default(),
            cwd: PathBuf::from("/"),
            hostname: None,
            resolv_conf: None,
            isolate: true,
            net_isolate: false,
            new_mount_ns: true,
            triple_fork: false,
            quadro_fork: false,
            namespaces: NamespaceSet::default(),
            root_fd: None,
            cwd_fd: None,
            cgroups: Vec::new(),
            credentials: Credentials::default(),
            cap_ambient: CapSet::default(),
            cap_bound: CapSet::default(),
            ulimits: Vec::new(),
            sched: TaskSched::default(),
            stdio: Stdio::default(),
            devices: Vec::new(),
            mounts: MountSetup::default(),
            umask: 0o022,
            login_uid: u32::MAX,
            ipc_sysctl: Vec::new(),
            user_sysctl: Vec::new(),
            autoconf: Vec::new(),
            autoconf_timeout_s: 120,
            start_timeout_ms: 300_000,
            portoinit: None,
            master_sock: None,
            sock: None,
            master_sock2: None,
            sock2: None,
            report_stage: 0,
        }
    }

    /// Descriptor the exec step must keep open alongside stdio
    pub(crate) fn sock_fd(&self) -> i32 {
        self.sock.as_ref().map(|s| s.raw_fd()).unwrap_or(-1)
    }

    /// The portoinit argv for a meta or supervised container
    pub(crate) fn portoinit_args(&self, wait_pid: Option<i32>) -> Vec<CString> {
        let mut args = vec![
            CString::new("portoinit").unwrap_or_default(),
            CString::new("--container").unwrap_or_default(),
            CString::new(self.name.as_str()).unwrap_or_default(),
        ];
        if let Some(pid) = wait_pid {
            args.push(CString::new("--wait").unwrap_or_default());
            args.push(CString::new(pid.to_string()).unwrap_or_default());
        }
        args
    }

    pub(crate) fn portoinit_fd(&self) -> Option<i32> {
        self.portoinit.as_ref().map(|fd| fd.as_raw_fd())
    }

    /// Give the portoinit descriptor away for `fexecve`
    pub(crate) fn take_portoinit(&mut self) -> Option<i32> {
        self.portoinit.take().map(|fd| fd.into_raw_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ulimit_parsing() {
        let limit = Ulimit::parse("nofile", "1024 4096").unwrap();
        assert_eq!(limit.resource, libc::RLIMIT_NOFILE as u32);
        assert_eq!(limit.soft, 1024);
        assert_eq!(limit.hard, 4096);

        let limit = Ulimit::parse("core", "unlimited").unwrap();
        assert_eq!(limit.soft, libc::RLIM_INFINITY);
        assert_eq!(limit.hard, libc::RLIM_INFINITY);

        assert!(Ulimit::parse("bogus", "1").is_err());
        assert!(Ulimit::parse("nofile", "lots").is_err());
        assert!(Ulimit::parse("nofile", "").is_err());
    }

    #[test]
    fn capset_split() {
        let (low, high) = CapSet::split(0x0000_0001_8000_0002);
        assert_eq!(low, 0x8000_0002);
        assert_eq!(high, 0x1);
    }

    #[test]
    fn env_lookup_prefers_task_vars() {
        let env = TaskEnvVars {
            vars: vec![
                ("PATH".to_string(), "/container/bin".to_string()),
                ("X".to_string(), "1".to_string()),
                ("X".to_string(), "2".to_string()),
            ],
        };
        assert_eq!(env.lookup("PATH").unwrap(), "/container/bin");
        // later assignments win
        assert_eq!(env.lookup("X").unwrap(), "2");
        assert!(env.lookup("DEFINITELY_NOT_SET_ANYWHERE_42").is_none());
    }

    #[test]
    fn envp_formats_pairs() {
        let env = TaskEnvVars {
            vars: vec![("A".to_string(), "b".to_string())],
        };
        let envp = env.envp();
        assert_eq!(envp[0].to_str().unwrap(), "A=b");
    }

    #[test]
    fn portoinit_args_shape() {
        let env = TaskEnv::new("ct1", 4, "sleep 1");
        let args = env.portoinit_args(None);
        assert_eq!(args.len(), 3);
        assert_eq!(args[1].to_str().unwrap(), "--container");

        let args = env.portoinit_args(Some(42));
        assert_eq!(args[3].to_str().unwrap(), "--wait");
        assert_eq!(args[4].to_str().unwrap(), "42");
    }

    #[test]
    fn default_credentials_are_root() {
        let creds = Credentials::default();
        assert!(creds.is_root());
    }

    #[test]
    fn sched_default_is_neutral() {
        let sched = TaskSched::default();
        assert_eq!(sched.policy, libc::SCHED_OTHER);
        assert_eq!(sched.oom_score_adj, 0);
    }

    #[test]
    fn stdio_inherit_opens_nothing() {
        Stdio::default().apply_outside().unwrap();
        Stdio::default().apply_inside().unwrap();
    }
}
