//! Supervisor-side of the launch: fork, namespace entry, clone, and the
//! staged pid/ack protocol
//!
//! ```text
//! supervisor --fork--> intermediary --(vfork)--> [triple fork] --clone--> child
//!     |                    |                                               |
//!     |  stage 0: WPid     |  attaches cgroups, enters namespaces          |
//!     |<-------------------+-----------------------------------------------|
//!     |  ack -->           |                                               |
//!     |  stage 1: VPid (forwarded by the intermediary on triple fork)      |
//!     |<------------------------------------------------------------------|
//!     |  ack -->  wait intermediary  -->  wakeup  -->  stage 2: error      |
//! ```

use std::os::unix::io::AsRawFd;
use std::time::Duration;

use log::warn;
use nix::sched::{clone, CloneFlags};
use nix::sys::signal::{kill, sigprocmask, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chroot, fork, ForkResult, Pid};

use crate::errors::{Error, ErrorKind, Result};
use crate::execution::child::sock_or_err;
use crate::execution::control::ControlSocket;
use crate::execution::env::{CapSet, TaskEnv};
use crate::utils::{close_all_except, get_tid, set_die_on_parent_exit, set_process_name};

/// Pids learned during a successful start
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskPids {
    /// The process the supervisor waits on, in the host pid namespace
    pub wait_pid: i32,
    /// The container payload, in the host pid namespace
    pub task_pid: i32,
    /// The container payload, inside its own pid namespace
    pub task_vpid: i32,
}

impl TaskEnv {
    /// Namespace flags for the clone: pid and ipc follow isolation, mount
    /// follows the mount setup, uts is created whenever the hostname
    /// changes or isolation is on.
    fn clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();
        if self.isolate {
            flags |= CloneFlags::CLONE_NEWPID | CloneFlags::CLONE_NEWIPC;
        }
        if self.new_mount_ns {
            flags |= CloneFlags::CLONE_NEWNS;
        }
        if self.isolate || self.hostname.is_some() {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        flags
    }

    /// Launch the task: fork the intermediary, run the staged pid/ack
    /// protocol, and return the learned pids. On any failure the
    /// intermediary is killed and reaped.
    pub fn start(&mut self) -> Result<TaskPids> {
        let (master, sock) = ControlSocket::pair()?;
        self.master_sock = Some(master);
        self.sock = Some(sock);

        // double fork (fork + clone) keeps the daemon as the child's
        // reported parent while the pid still travels back over the pipe
        let intermediary = match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => child,
            Ok(ForkResult::Child) => self.intermediary(),
            Err(e) => {
                self.sock = None;
                let error = Error::from_errno(ErrorKind::Unknown, e as i32, "fork()");
                warn!("cannot spawn intermediary: {}", error);
                return Err(error);
            }
        };

        // child end lives in the forked processes now
        self.sock = None;

        match self.supervise(intermediary) {
            Ok(pids) => Ok(pids),
            Err(error) => {
                warn!("task start failed: {}", error);
                let _ = kill(intermediary, Signal::SIGKILL);
                let _ = waitpid(intermediary, None);
                Err(error)
            }
        }
    }

    fn supervise(&mut self, intermediary: Pid) -> Result<TaskPids> {
        let mut pids = TaskPids::default();
        let master = sock_or_err(&self.master_sock)?;

        master.set_recv_timeout(Duration::from_millis(self.start_timeout_ms))?;

        // stage 0
        let (wpid, vpid) = master.recv_pid()?;
        pids.wait_pid = wpid;
        pids.task_vpid = vpid;
        master.send_zero()?;

        // stage 1
        let (task_pid, task_vpid) = master.recv_pid()?;
        pids.task_pid = task_pid;
        pids.task_vpid = task_vpid;

        // the intermediary has done its job; reap it before the wakeup
        let wait_error = match waitpid(intermediary, None) {
            Ok(WaitStatus::Exited(_, 0)) => None,
            Ok(status) => Some(Error::new(
                ErrorKind::Unknown,
                format!("intermediary failed: {:?}", status),
            )),
            Err(e) => Some(Error::from_errno(ErrorKind::Unknown, e as i32, "waitpid")),
        };

        // wakeup; the task was alive a moment ago, a dead one still
        // leaves a zombie to collect
        if let Err(e) = master.send_zero() {
            warn!("task wakeup error: {}", e);
        }

        // stage 2: prefer the error reported by the child
        let reported = master.recv_error()?;
        if !reported.is_success() {
            return Err(reported);
        }
        if let Some(error) = wait_error {
            return Err(error);
        }

        Ok(pids)
    }

    /// The forked intermediary: join the container context, clone the
    /// task, and (for triple fork) forward its VPid. Never returns.
    fn intermediary(&mut self) -> ! {
        // switch from signalfd-driven delivery back to defaults
        let _ = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None);

        set_die_on_parent_exit(libc::SIGKILL);
        set_process_name(&format!("portod-CT{}", self.id));
        let _ = nix::unistd::setsid();

        drop(self.master_sock.take());

        let my_pid = unsafe { libc::getpid() };
        for cgroup in &self.cgroups {
            if let Err(e) = cgroup.attach(my_pid) {
                self.abort(&e);
            }
        }

        if let Err(e) = self.sched.apply() {
            self.abort(&e);
        }

        // default streams and redirections resolve outside the container
        if let Err(e) = self.stdio.apply_outside() {
            self.abort(&e);
        }

        if let Err(e) = self.namespaces.enter_all() {
            self.abort(&e);
        }

        if let Some(root) = &self.root_fd {
            if unsafe { libc::fchdir(root.as_raw_fd()) } < 0 {
                self.abort(&Error::os(ErrorKind::Unknown, "fchdir(root)"));
            }
            if let Err(e) = chroot(".") {
                self.abort(&Error::from_errno(ErrorKind::Unknown, e as i32, "chroot(.)"));
            }
        }
        if let Some(cwd) = &self.cwd_fd {
            if unsafe { libc::fchdir(cwd.as_raw_fd()) } < 0 {
                self.abort(&Error::os(ErrorKind::Unknown, "fchdir(cwd)"));
            }
        }

        if self.triple_fork {
            // Entering the pid namespace with plain fork() can hang in
            // libc when the child pid collides with a cached outer pid;
            // vfork has no such problem. The parent must exit
            // immediately and this branch must never return.
            let fork_pid = unsafe { libc::vfork() };
            if fork_pid < 0 {
                self.abort(&Error::os(ErrorKind::Unknown, "vfork()"));
            }
            if fork_pid > 0 {
                unsafe { libc::_exit(libc::EXIT_SUCCESS) }
            }

            match ControlSocket::pair() {
                Ok((master2, sock2)) => {
                    self.master_sock2 = Some(master2);
                    self.sock2 = Some(sock2);
                }
                Err(e) => self.abort(&e),
            }

            // stage 0 travels from inside the pid namespace
            self.report_pid(get_tid());
        }

        let mut stack = vec![0u8; 128 * 1024];
        let flags = self.clone_flags();

        let env_ptr: *mut TaskEnv = self;
        let clone_pid = unsafe {
            clone(
                Box::new(move || unsafe { (*env_ptr).start_child() }),
                &mut stack,
                flags,
                Some(libc::SIGCHLD),
            )
        };

        let clone_pid = match clone_pid {
            Ok(pid) => pid,
            Err(e) => {
                let kind = if e == nix::errno::Errno::ENOMEM {
                    ErrorKind::ResourceNotAvailable
                } else {
                    ErrorKind::Unknown
                };
                let error = Error::from_errno(kind, e as i32, "clone()");
                self.abort(&error);
            }
        };

        if !self.triple_fork {
            unsafe { libc::_exit(libc::EXIT_SUCCESS) }
        }

        // close the child's end before reading from ours
        drop(self.sock2.take());

        let (app_pid, _app_vpid) = match self.master_sock2.as_ref().map(|s| s.recv_pid()) {
            Some(Ok(pids)) => pids,
            Some(Err(e)) => self.abort(&e),
            None => self.abort(&Error::new(ErrorKind::InvalidState, "no second socket")),
        };

        // forward the VPid upstream, then ack it downstream
        self.report_pid(app_pid);
        if let Some(master2) = &self.master_sock2 {
            if let Err(e) = master2.send_zero() {
                self.abort(&e);
            }
        }
        drop(self.master_sock2.take());

        // become the in-namespace init supervising the clone child
        let args = self.portoinit_args(Some(clone_pid.as_raw()));
        let envp = self.env.envp();

        if CapSet::PORTOINIT.apply_limit().is_err() {
            unsafe { libc::_exit(libc::EXIT_FAILURE) }
        }

        if let Some(init_fd) = self.take_portoinit() {
            close_all_except(&[init_fd]);
            let _ = nix::unistd::fexecve(init_fd, &args, &envp);
        }
        let _ = kill(clone_pid, Signal::SIGKILL);
        unsafe { libc::_exit(libc::EXIT_FAILURE) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_flags_follow_isolation() {
        let mut env = TaskEnv::new("ct", 4, "true");
        env.isolate = true;
        env.new_mount_ns = true;
        let flags = env.clone_flags();
        assert!(flags.contains(CloneFlags::CLONE_NEWPID));
        assert!(flags.contains(CloneFlags::CLONE_NEWIPC));
        assert!(flags.contains(CloneFlags::CLONE_NEWNS));
        assert!(flags.contains(CloneFlags::CLONE_NEWUTS));
    }

    #[test]
    fn clone_flags_for_shared_pid_namespace() {
        let mut env = TaskEnv::new("ct", 4, "true");
        env.isolate = false;
        env.new_mount_ns = false;
        env.hostname = None;
        assert!(env.clone_flags().is_empty());

        // changed hostname alone still needs a UTS namespace
        env.hostname = Some("ct".to_string());
        assert_eq!(env.clone_flags(), CloneFlags::CLONE_NEWUTS);
    }

    #[test]
    fn start_without_intermediary_times_out() {
        // no child process to speak the protocol: the supervisor side
        // must fail on its receive timeout, not hang
        let mut env = TaskEnv::new("ct", 4, "true");
        env.start_timeout_ms = 50;

        let (master, _sock) = ControlSocket::pair().unwrap();
        env.master_sock = Some(master);
        let err = env.supervise(Pid::from_raw(i32::MAX)).unwrap_err();
        assert!(err.errno == libc::EAGAIN || err.errno == libc::EWOULDBLOCK);
    }
}
