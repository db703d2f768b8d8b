//! Utility functions shared by the network engine and the task launcher

use std::fs;
use std::os::unix::io::RawFd;
use std::path::Path;

use crate::errors::{Error, ErrorKind, Result};

/// Check if running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Kernel thread id of the calling thread
pub fn get_tid() -> i32 {
    unsafe { libc::gettid() }
}

/// Glob match with `*` and `?`, the same dialect `/etc/iproute2` and the
/// pattern-keyed config maps use. An exact string is a pattern too.
pub fn string_match(name: &str, pattern: &str) -> bool {
    let name: Vec<char> = name.chars().collect();
    let pat: Vec<char> = pattern.chars().collect();

    let (mut n, mut p) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == name[n]) {
            n += 1;
            p += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((sp, sn)) = star {
            p = sp + 1;
            n = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

/// CRC-32 (IEEE polynomial, the zlib variant) used for MAC generation
pub fn crc32(data: &[u8]) -> u32 {
    const fn table() -> [u32; 256] {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    }
    const TABLE: [u32; 256] = table();

    let mut crc = !0u32;
    for &byte in data {
        crc = (crc >> 8) ^ TABLE[((crc ^ byte as u32) & 0xFF) as usize];
    }
    !crc
}

fn sysctl_path(key: &str) -> String {
    format!("/proc/sys/{}", key.replace('.', "/"))
}

/// Read a sysctl value, trimmed
pub fn get_sysctl(key: &str) -> Result<String> {
    let path = sysctl_path(key);
    let value = fs::read_to_string(&path)
        .map_err(|e| Error::from_errno(ErrorKind::Unknown, raw_errno(&e), format!("sysctl {}", key)))?;
    Ok(value.trim_end().to_string())
}

/// Write a sysctl value
pub fn set_sysctl(key: &str, value: &str) -> Result<()> {
    let path = sysctl_path(key);
    fs::write(&path, value).map_err(|e| {
        Error::from_errno(
            ErrorKind::Unknown,
            raw_errno(&e),
            format!("sysctl {} = {}", key, value),
        )
    })
}

fn raw_errno(err: &std::io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

/// Set the comm name of the current thread
pub fn set_process_name(name: &str) {
    let mut bytes = name.as_bytes().to_vec();
    bytes.truncate(15);
    bytes.push(0);
    unsafe {
        libc::prctl(libc::PR_SET_NAME, bytes.as_ptr() as libc::c_ulong, 0, 0, 0);
    }
}

/// Deliver `signal` to this process when its parent dies (0 clears)
pub fn set_die_on_parent_exit(signal: i32) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, signal as libc::c_ulong, 0, 0, 0);
    }
}

/// Close every open descriptor above stderr except the listed ones.
/// Used right before `exec` so the container does not inherit daemon fds.
pub fn close_all_except(keep: &[RawFd]) {
    let mut fds: Vec<RawFd> = Vec::new();
    if let Ok(entries) = fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Some(fd) = entry
                .file_name()
                .to_str()
                .and_then(|s| s.parse::<RawFd>().ok())
            {
                if fd > 2 && !keep.contains(&fd) {
                    fds.push(fd);
                }
            }
        }
    }
    for fd in fds {
        unsafe {
            libc::close(fd);
        }
    }
}

/// Write a file "privately": the content lands in a fresh tmpfs-backed file
/// bind-mounted over `path`, so the change stays within the mount namespace.
pub fn write_private(path: &str, content: &str) -> Result<()> {
    use nix::mount::{mount, MsFlags};

    let tmp = format!("/tmp/.portod.private.{}", get_tid());
    fs::write(&tmp, content).map_err(|e| {
        Error::from_errno(ErrorKind::Unknown, raw_errno(&e), format!("write {}", tmp))
    })?;

    mount(
        Some(Path::new(tmp.as_str())),
        Path::new(path),
        None::<&str>,
        MsFlags::MS_BIND,
        None::<&str>,
    )
    .map_err(|e| Error::from_errno(ErrorKind::Unknown, e as i32, format!("bind {} over {}", tmp, path)))?;

    let _ = fs::remove_file(&tmp);
    Ok(())
}

/// Shell-style word expansion for the container command line.
///
/// Supports `$VAR` / `${VAR}` expansion, single and double quotes, and
/// backslash escapes. Command substitution and the shell control characters
/// `| & ; < > ( ) { }` are rejected, and referencing an undefined variable
/// is an error, matching the launcher's no-surprises exec contract.
pub fn word_split<F>(command: &str, lookup: F) -> Result<Vec<String>>
where
    F: Fn(&str) -> Option<String>,
{
    const BAD: &[char] = &['|', '&', ';', '<', '>', '(', ')', '{', '}', '\n'];

    let mut words = Vec::new();
    let mut word = String::new();
    let mut have_word = false;
    let mut chars = command.chars().peekable();

    fn expand_var<F: Fn(&str) -> Option<String>>(
        chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
        lookup: &F,
    ) -> Result<String> {
        let mut name = String::new();
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        while let Some(&c) = chars.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if braced {
            if chars.next() != Some('}') {
                return Err(Error::new(ErrorKind::InvalidValue, "unterminated ${} expansion"));
            }
        }
        if name.is_empty() {
            return Err(Error::new(ErrorKind::InvalidValue, "empty variable reference"));
        }
        lookup(&name).ok_or_else(|| {
            Error::from_errno(
                ErrorKind::Unknown,
                libc::EINVAL,
                format!("undefined shell variable ${}", name),
            )
        })
    }

    while let Some(c) = chars.next() {
        match c {
            c if BAD.contains(&c) => {
                return Err(Error::from_errno(
                    ErrorKind::Unknown,
                    libc::EINVAL,
                    format!("illegal character {:?} in command", c),
                ));
            }
            ' ' | '\t' => {
                if have_word {
                    words.push(std::mem::take(&mut word));
                    have_word = false;
                }
            }
            '\'' => {
                have_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => {
                            return Err(Error::from_errno(
                                ErrorKind::Unknown,
                                libc::EINVAL,
                                "unterminated single quote",
                            ))
                        }
                    }
                }
            }
            '"' => {
                have_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(e) => word.push(e),
                            None => {
                                return Err(Error::from_errno(
                                    ErrorKind::Unknown,
                                    libc::EINVAL,
                                    "trailing backslash",
                                ))
                            }
                        },
                        Some('$') => word.push_str(&expand_var(&mut chars, &lookup)?),
                        Some(c) => word.push(c),
                        None => {
                            return Err(Error::from_errno(
                                ErrorKind::Unknown,
                                libc::EINVAL,
                                "unterminated double quote",
                            ))
                        }
                    }
                }
            }
            '\\' => {
                have_word = true;
                match chars.next() {
                    Some(e) => word.push(e),
                    None => {
                        return Err(Error::from_errno(
                            ErrorKind::Unknown,
                            libc::EINVAL,
                            "trailing backslash",
                        ))
                    }
                }
            }
            '$' => {
                have_word = true;
                word.push_str(&expand_var(&mut chars, &lookup)?);
            }
            c => {
                have_word = true;
                word.push(c);
            }
        }
    }

    if have_word {
        words.push(word);
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_match_literals_and_globs() {
        assert!(string_match("eth0", "eth0"));
        assert!(string_match("eth0", "eth*"));
        assert!(string_match("eth0", "*"));
        assert!(string_match("eth10", "eth?0"));
        assert!(!string_match("eth0", "wlan*"));
        assert!(!string_match("eth0", "eth0x"));
        assert!(string_match("veth-a-b", "veth-*-*"));
        assert!(!string_match("eth", "eth?"));
    }

    #[test]
    fn crc32_matches_reference_values() {
        // Reference values from the zlib crc32() implementation.
        assert_eq!(crc32(b""), 0);
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(crc32(b"host"), 0xCF27_13FD);
    }

    #[test]
    fn word_split_basic() {
        let words = word_split("echo hello world", |_| None).unwrap();
        assert_eq!(words, vec!["echo", "hello", "world"]);
    }

    #[test]
    fn word_split_quotes_and_escapes() {
        let words = word_split(r#"sh -c 'a b' "c d" e\ f"#, |_| None).unwrap();
        assert_eq!(words, vec!["sh", "-c", "a b", "c d", "e f"]);
    }

    #[test]
    fn word_split_expands_variables() {
        let lookup = |name: &str| match name {
            "HOME" => Some("/root".to_string()),
            "USER" => Some("porto".to_string()),
            _ => None,
        };
        let words = word_split("ls $HOME ${USER}x \"$HOME/dir\"", lookup).unwrap();
        assert_eq!(words, vec!["ls", "/root", "portox", "/root/dir"]);
    }

    #[test]
    fn word_split_undefined_variable_fails() {
        let err = word_split("echo $NOPE", |_| None).unwrap_err();
        assert_eq!(err.errno, libc::EINVAL);
        assert!(err.text.contains("undefined"));
    }

    #[test]
    fn word_split_rejects_shell_control() {
        for cmd in ["a | b", "a; b", "a > f", "a (b)", "a\nb"] {
            assert!(word_split(cmd, |_| None).is_err(), "accepted {:?}", cmd);
        }
    }

    #[test]
    fn sysctl_path_translation() {
        assert_eq!(sysctl_path("net.ipv4.ip_forward"), "/proc/sys/net/ipv4/ip_forward");
    }
}
