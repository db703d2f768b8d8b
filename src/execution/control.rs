//! Control socket between supervisor and launched task
//!
//! A Unix seqpacket pair carrying exactly three message shapes:
//!
//! - `pid`: 4 bytes little-endian, accompanied by `SCM_CREDENTIALS` so the
//!   receiver also learns the sender's pid as seen from its own pid
//!   namespace (that is how WPid and VPid differ);
//! - `ack`: a single zero byte;
//! - `error`: a varint payload length followed by
//!   `{code: u32 le, errno: i32 le, text: utf-8}`.

use std::io::{IoSlice, IoSliceMut};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::Duration;

use nix::sys::socket::{
    recvmsg, sendmsg, setsockopt, socketpair, sockopt, AddressFamily, ControlMessage,
    ControlMessageOwned, MsgFlags, SockFlag, SockType, UnixCredentials,
};
use nix::sys::time::TimeVal;

use crate::errors::{Error, ErrorKind, Result};

/// Encode a LEB128 varint
pub(crate) fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a LEB128 varint, returning the value and the bytes consumed
pub(crate) fn decode_varint(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return None;
        }
        value |= ((byte & 0x7F) as u64) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// One end of the supervisor/task socket pair
#[derive(Debug)]
pub struct ControlSocket {
    fd: OwnedFd,
}

impl ControlSocket {
    /// Create a connected pair with credential passing enabled
    pub fn pair() -> Result<(ControlSocket, ControlSocket)> {
        let (a, b) = socketpair(
            AddressFamily::Unix,
            SockType::SeqPacket,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "socketpair"))?;

        for fd in [&a, &b] {
            setsockopt(fd, sockopt::PassCred, &true)
                .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "SO_PASSCRED"))?;
        }
        Ok((ControlSocket { fd: a }, ControlSocket { fd: b }))
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Bound every receive on this end; launches use `start_timeout_ms`
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = TimeVal::new(
            timeout.as_secs() as libc::time_t,
            timeout.subsec_micros() as libc::suseconds_t,
        );
        setsockopt(&self.fd, sockopt::ReceiveTimeout, &tv)
            .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, "SO_RCVTIMEO"))
    }

    fn send(&self, data: &[u8], creds: Option<&UnixCredentials>, desc: &str) -> Result<()> {
        let iov = [IoSlice::new(data)];
        let result = match creds {
            Some(creds) => sendmsg::<()>(
                self.fd.as_raw_fd(),
                &iov,
                &[ControlMessage::ScmCredentials(creds)],
                MsgFlags::empty(),
                None,
            ),
            None => sendmsg::<()>(self.fd.as_raw_fd(), &iov, &[], MsgFlags::empty(), None),
        };
        result.map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, desc))?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8], desc: &str) -> Result<(usize, Option<UnixCredentials>)> {
        let mut iov = [IoSliceMut::new(buf)];
        let mut cmsg = nix::cmsg_space!(UnixCredentials);

        let msg = recvmsg::<()>(
            self.fd.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg),
            MsgFlags::empty(),
        )
        .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, desc))?;

        let mut creds = None;
        if let Ok(cmsgs) = msg.cmsgs() {
            for cmsg in cmsgs {
                if let ControlMessageOwned::ScmCredentials(c) = cmsg {
                    creds = Some(c);
                }
            }
        }
        Ok((msg.bytes, creds))
    }

    /// Report a pid. The same pid rides in `SCM_CREDENTIALS`, so the
    /// kernel hands the receiver its translation into the receiver's pid
    /// namespace; stamping a pid other than our own (the triple-fork
    /// forwarding case) needs `CAP_SYS_ADMIN`, which the daemon holds.
    pub fn send_pid(&self, pid: i32) -> Result<()> {
        let creds = UnixCredentials::from(libc::ucred {
            pid,
            uid: unsafe { libc::geteuid() },
            gid: unsafe { libc::getegid() },
        });
        self.send(&pid.to_le_bytes(), Some(&creds), "send pid")
    }

    /// Receive a pid report: `(pid in receiver's namespace, pid as sent)`
    pub fn recv_pid(&self) -> Result<(i32, i32)> {
        let mut buf = [0u8; 4];
        let (len, creds) = self.recv(&mut buf, "recv pid")?;
        if len != 4 {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("short pid message: {} bytes", len),
            ));
        }
        let sent = i32::from_le_bytes(buf);
        let pid = creds.map(|c| c.pid()).unwrap_or(sent);
        Ok((pid, sent))
    }

    /// The zero-byte ack
    pub fn send_zero(&self) -> Result<()> {
        self.send(&[0u8], None, "send ack")
    }

    pub fn recv_zero(&self) -> Result<()> {
        let mut buf = [0u8; 1];
        let (len, _) = self.recv(&mut buf, "recv ack")?;
        if len != 1 || buf[0] != 0 {
            return Err(Error::new(ErrorKind::Unknown, "bad ack"));
        }
        Ok(())
    }

    /// Marshal an error (or [`Error::success`]) to the peer
    pub fn send_error(&self, error: &Error) -> Result<()> {
        let mut payload = Vec::with_capacity(error.text.len() + 8);
        payload.extend_from_slice(&error.kind.code().to_le_bytes());
        payload.extend_from_slice(&error.errno.to_le_bytes());
        payload.extend_from_slice(error.text.as_bytes());

        let mut msg = Vec::with_capacity(payload.len() + 2);
        encode_varint(payload.len() as u64, &mut msg);
        msg.extend_from_slice(&payload);
        self.send(&msg, None, "send error")
    }

    /// Receive the final error report; `kind == Success` means a clean exec
    pub fn recv_error(&self) -> Result<Error> {
        let mut buf = [0u8; 4096];
        let (len, _) = self.recv(&mut buf, "recv error")?;
        let buf = &buf[..len];

        let (payload_len, consumed) = decode_varint(buf)
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "truncated error header"))?;
        let payload = buf
            .get(consumed..consumed + payload_len as usize)
            .ok_or_else(|| Error::new(ErrorKind::Unknown, "truncated error payload"))?;
        if payload.len() < 8 {
            return Err(Error::new(ErrorKind::Unknown, "short error payload"));
        }

        let code = u32::from_le_bytes(payload[0..4].try_into().unwrap());
        let errno = i32::from_le_bytes(payload[4..8].try_into().unwrap());
        let text = String::from_utf8_lossy(&payload[8..]).into_owned();
        Ok(Error {
            kind: ErrorKind::from_code(code),
            errno,
            text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for value in [0u64, 1, 127, 128, 300, 65_535, u64::MAX] {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            let (decoded, consumed) = decode_varint(&buf).unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn varint_rejects_truncation() {
        assert!(decode_varint(&[0x80]).is_none());
        assert!(decode_varint(&[]).is_none());
    }

    #[test]
    fn pid_roundtrip_carries_credentials() {
        let (master, sock) = ControlSocket::pair().unwrap();
        let my_pid = std::process::id() as i32;

        sock.send_pid(my_pid).unwrap();
        let (pid, sent) = master.recv_pid().unwrap();
        // same pid namespace: the credential pid equals the sent pid
        assert_eq!(pid, my_pid);
        assert_eq!(sent, my_pid);
    }

    #[test]
    fn ack_roundtrip() {
        let (master, sock) = ControlSocket::pair().unwrap();
        master.send_zero().unwrap();
        sock.recv_zero().unwrap();
    }

    #[test]
    fn error_roundtrip() {
        let (master, sock) = ControlSocket::pair().unwrap();
        let sent = Error::from_errno(ErrorKind::Unknown, libc::ESRCH, "setns(net)");
        sock.send_error(&sent).unwrap();

        let received = master.recv_error().unwrap();
        assert_eq!(received.kind, ErrorKind::Unknown);
        assert_eq!(received.errno, libc::ESRCH);
        assert!(received.text.starts_with("setns(net)"));
    }

    #[test]
    fn success_roundtrip() {
        let (master, sock) = ControlSocket::pair().unwrap();
        sock.send_error(&Error::success()).unwrap();
        let received = master.recv_error().unwrap();
        assert!(received.is_success());
    }

    #[test]
    fn recv_timeout_expires() {
        let (master, _sock) = ControlSocket::pair().unwrap();
        master.set_recv_timeout(Duration::from_millis(50)).unwrap();
        let err = master.recv_zero().unwrap_err();
        assert!(err.errno == libc::EAGAIN || err.errno == libc::EWOULDBLOCK);
    }

    #[test]
    fn pid_protocol_stages_stay_ordered() {
        // supervisor thread and task thread speak the full three-stage
        // protocol over one pair
        let (master, sock) = ControlSocket::pair().unwrap();

        let task = std::thread::spawn(move || {
            let pid = std::process::id() as i32;
            sock.send_pid(pid).unwrap(); // stage 0: WPid
            sock.recv_zero().unwrap();
            sock.send_pid(pid).unwrap(); // stage 1: VPid
            sock.recv_zero().unwrap();
            sock.send_error(&Error::success()).unwrap(); // stage 2
        });

        let (wpid, _) = master.recv_pid().unwrap();
        master.send_zero().unwrap();
        let (vpid, _) = master.recv_pid().unwrap();
        master.send_zero().unwrap();
        let error = master.recv_error().unwrap();

        assert_eq!(wpid, vpid);
        assert!(error.is_success());
        task.join().unwrap();
    }
}
