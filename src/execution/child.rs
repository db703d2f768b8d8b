//! Child-side of the launch: everything that runs inside the cloned
//! container process between `clone` and `exec`

use std::ffi::CString;

use log::{debug, warn};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::unistd::{chdir, fexecve, fork, sethostname, setsid, ForkResult};

use crate::config::IPC_SYSCTLS;
use crate::errors::{Error, ErrorKind, Result};
use crate::execution::control::ControlSocket;
use crate::execution::env::{CapSet, TaskEnv};
use crate::network::netlink::wait_ipv6_address;
use crate::utils::{
    close_all_except, set_die_on_parent_exit, set_process_name, set_sysctl, word_split,
    write_private,
};

impl TaskEnv {
    /// Report a pid over the control socket and advance the stage counter.
    /// Send failures abort the launch, except transient `ENOMEM`.
    pub(crate) fn report_pid(&mut self, pid: i32) {
        let result = match &self.sock {
            Some(sock) => sock.send_pid(pid),
            None => Err(Error::new(ErrorKind::InvalidState, "no control socket")),
        };
        if let Err(e) = result {
            if e.errno != libc::ENOMEM {
                warn!("cannot report pid: {}", e);
                self.abort(&e);
            }
        }
        self.report_stage += 1;
    }

    /// Flush the remaining pid slots with our own pid, marshal the error
    /// to the supervisor and die.
    ///
    /// Stage 0 is the WPid report, stage 1 the VPid report, stage 2 the
    /// final error; the supervisor always reads all three.
    pub(crate) fn abort(&mut self, error: &Error) -> ! {
        warn!("aborting task start: {}", error);

        if let Some(sock) = &self.sock {
            for _ in self.report_stage..2 {
                if let Err(e) = sock.send_pid(unsafe { libc::getpid() }) {
                    if e.errno != libc::ENOMEM {
                        warn!("cannot flush pid report: {}", e);
                    }
                }
            }
            if let Err(e) = sock.send_error(error) {
                if e.errno != libc::ENOMEM {
                    warn!("cannot report error: {}", e);
                }
            }
        }
        unsafe { libc::_exit(libc::EXIT_FAILURE) }
    }

    /// Entry point of the cloned process. Never returns.
    pub(crate) fn start_child(&mut self) -> ! {
        if self.triple_fork {
            // the vfork parent reports our WPid; die with it
            set_die_on_parent_exit(libc::SIGKILL);
        } else {
            self.report_pid(unsafe { libc::getpid() });
        }

        // WPid ack
        if let Err(e) = self.recv_ack() {
            self.abort(&e);
        }

        if let Err(e) = self.configure_child() {
            self.abort(&e);
        }

        // wakeup
        if let Err(e) = self.recv_ack() {
            self.abort(&e);
        }

        reset_ignored_signals();

        if let Err(e) = self.wait_autoconf() {
            self.abort(&e);
        }

        let error = self.child_exec().unwrap_or_else(|e| e);
        self.abort(&error)
    }

    fn recv_ack(&self) -> Result<()> {
        match &self.sock {
            Some(sock) => sock.recv_zero(),
            None => Err(Error::new(ErrorKind::InvalidState, "no control socket")),
        }
    }

    /// Prepare the container environment before exec
    fn configure_child(&mut self) -> Result<()> {
        for limit in &self.ulimits {
            limit.apply()?;
        }

        setsid().map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "setsid()"))?;
        umask(Mode::empty());

        if self.new_mount_ns {
            self.mounts.setup()?;
        }

        self.apply_sysctl()?;

        if self.new_mount_ns {
            self.mounts.protect_proc()?;
        }

        for dev in &self.devices {
            dev.makedev()?;
        }

        self.write_resolv_conf()?;
        self.set_hostname()?;

        chdir(&self.cwd)
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "chdir(cwd)"))?;

        if self.quadro_fork {
            // portoinit --wait supervises the user process while this
            // branch continues as the payload
            match unsafe { fork() } {
                Err(e) => {
                    return Err(Error::from_errno(ErrorKind::Unknown, e as i32, "fork()"));
                }
                Ok(ForkResult::Parent { child }) => {
                    let args = self.portoinit_args(Some(child.as_raw()));
                    let envp = self.env.envp();

                    CapSet::PORTOINIT.apply_limit()?;

                    let init_fd = self
                        .take_portoinit()
                        .ok_or_else(|| Error::new(ErrorKind::InvalidState, "no portoinit fd"))?;
                    close_all_except(&[init_fd, self.sock_fd()]);
                    let err = fexecve(init_fd, &args, &envp).unwrap_err();
                    return Err(Error::from_errno(ErrorKind::Unknown, err as i32, "fexecve()"));
                }
                Ok(ForkResult::Child) => {
                    setsid().map_err(|e| {
                        Error::from_errno(ErrorKind::Unknown, e as i32, "setsid()")
                    })?;
                }
            }
        }

        // report VPid
        if self.triple_fork {
            drop(self.master_sock2.take());
            let sock2 = self
                .sock2
                .as_ref()
                .ok_or_else(|| Error::new(ErrorKind::InvalidState, "no second socket"))?;
            sock2.send_pid(unsafe { libc::getpid() })?;
            sock2.recv_zero()?;
            // the vfork parent forwards the VPid upstream
            self.report_stage += 1;
            drop(self.sock2.take());
        } else {
            self.report_pid(unsafe { libc::getpid() });
        }

        if self.login_uid != u32::MAX {
            if let Err(e) = std::fs::write("/proc/self/loginuid", self.login_uid.to_string()) {
                if e.raw_os_error() != Some(libc::ENOENT) {
                    warn!("cannot set loginuid: {}", e);
                }
            }
        }

        self.credentials.apply()?;

        if !self.cap_ambient.is_empty() {
            debug!("ambient capabilities: {:#x}", self.cap_ambient.bits);
        }
        self.cap_ambient.apply_ambient()?;
        self.cap_bound.apply_limit()?;
        if !self.credentials.is_root() {
            self.cap_ambient.apply_effective()?;
        }

        self.stdio.apply_inside()?;

        umask(Mode::from_bits_truncate(self.umask));

        Ok(())
    }

    fn apply_sysctl(&self) -> Result<()> {
        if self.isolate {
            for sysctl in &self.ipc_sysctl {
                set_sysctl(&sysctl.key, &sysctl.val)?;
            }
        }

        for sysctl in &self.user_sysctl {
            if sysctl.key.starts_with("net.") {
                if !self.net_isolate {
                    return Err(Error::new(
                        ErrorKind::Permission,
                        format!("sysctl {} requires net isolation", sysctl.key),
                    ));
                }
                // handled during network setup
                continue;
            }
            if IPC_SYSCTLS.contains(&sysctl.key.as_str()) {
                if !self.isolate {
                    return Err(Error::new(
                        ErrorKind::Permission,
                        format!("sysctl {} requires ipc isolation", sysctl.key),
                    ));
                }
            } else {
                return Err(Error::new(
                    ErrorKind::Permission,
                    format!("sysctl {} is not allowed", sysctl.key),
                ));
            }
            set_sysctl(&sysctl.key, &sysctl.val)?;
        }
        Ok(())
    }

    fn write_resolv_conf(&self) -> Result<()> {
        let config = match &self.resolv_conf {
            Some(config) if !config.is_empty() => config,
            _ => return Ok(()),
        };
        write_private("/etc/resolv.conf", &config.replace(';', "\n"))
    }

    fn set_hostname(&self) -> Result<()> {
        let hostname = match &self.hostname {
            Some(hostname) if !hostname.is_empty() => hostname,
            _ => return Ok(()),
        };
        write_private("/etc/hostname", &format!("{}\n", hostname))?;
        sethostname(hostname)
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "sethostname"))
    }

    /// Block until the autoconf interfaces acquire router-advertised
    /// addresses; a timeout on any of them fails the start.
    fn wait_autoconf(&self) -> Result<()> {
        if self.autoconf.is_empty() {
            return Ok(());
        }
        set_process_name("portod-autoconf");

        let timeout = std::time::Duration::from_secs(self.autoconf_timeout_s);
        for name in &self.autoconf {
            wait_ipv6_address(name, timeout)?;
        }
        Ok(())
    }

    /// Replace this process with the container payload. Returns only the
    /// error of a failed exec.
    fn child_exec(&mut self) -> Result<Error> {
        self.env.apply();
        let envp = self.env.envp();

        if self.meta {
            let args = self.portoinit_args(None);
            set_die_on_parent_exit(0);
            let init_fd = self
                .take_portoinit()
                .ok_or_else(|| Error::new(ErrorKind::InvalidState, "no portoinit fd"))?;
            close_all_except(&[init_fd, self.sock_fd()]);
            let err = fexecve(init_fd, &args, &envp).unwrap_err();
            return Ok(Error::from_errno(
                ErrorKind::InvalidValue,
                err as i32,
                format!("fexecve({}, portoinit)", init_fd),
            ));
        }

        let words = word_split(&self.command, |name| self.env.lookup(name))?;
        if words.is_empty() {
            return Ok(Error::new(ErrorKind::InvalidValue, "empty command"));
        }

        let argv: Vec<CString> = words
            .iter()
            .map(|w| CString::new(w.as_str()))
            .collect::<std::result::Result<_, _>>()
            .map_err(|_| Error::new(ErrorKind::InvalidValue, "NUL byte in command"))?;

        set_die_on_parent_exit(0);
        close_all_except(&[self.sock_fd()]);
        let err = nix::unistd::execvpe(&argv[0], &argv, &envp).unwrap_err();
        Ok(Error::from_errno(
            ErrorKind::InvalidValue,
            err as i32,
            format!("execvpe({}, {} args)", words[0], words.len()),
        ))
    }
}

/// Put ignored signal dispositions back to their defaults right before
/// exec; the signal mask was already lifted by the intermediary.
fn reset_ignored_signals() {
    for sig in Signal::iterator() {
        if matches!(sig, Signal::SIGKILL | Signal::SIGSTOP) {
            continue;
        }
        unsafe {
            let _ = signal(sig, SigHandler::SigDfl);
        }
    }
}

/// Helper split out so the supervisor can flag a lost control socket the
/// same way the child does
pub(crate) fn sock_or_err(sock: &Option<ControlSocket>) -> Result<&ControlSocket> {
    sock.as_ref()
        .ok_or_else(|| Error::new(ErrorKind::InvalidState, "no control socket"))
}
