//! Process attribution
//!
//! The kernel only reports the pid behind an event. What the pid stood for
//! is read from `/proc/<pid>` while the event is decoded, since the process
//! may be gone by the time anything downstream looks.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of the process that caused an event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Real user id
    pub uid: Option<u32>,
    /// Real group id
    pub gid: Option<u32>,
    /// Account name for `uid`
    pub username: Option<String>,
    /// Command name (`/proc/<pid>/comm`)
    pub comm: Option<String>,
    /// Arguments joined by spaces
    pub cmdline: Option<String>,
}

impl ProcessInfo {
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Fill `comm`, `uid` and `gid` from the text of `/proc/<pid>/status`.
    /// Fields that are missing or unparsable stay unset.
    pub fn parse_status(pid: u32, status: &str) -> Self {
        let mut info = Self::new(pid);

        for line in status.lines() {
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "Name" => info.comm = Some(value.trim().to_string()).filter(|name| !name.is_empty()),
                // Real, effective, saved, filesystem
                "Uid" => info.uid = first_id(value),
                "Gid" => info.gid = first_id(value),
                _ => {}
            }
        }
        info
    }

    /// Set the command line from the raw contents of `/proc/<pid>/cmdline`
    pub fn with_cmdline(mut self, raw: &[u8]) -> Self {
        self.cmdline = parse_cmdline(raw);
        self
    }

    pub fn with_username(mut self, username: Option<String>) -> Self {
        self.username = username;
        self
    }

    /// Best available name: comm, else the first word of the command line
    pub fn name(&self) -> Option<&str> {
        self.comm
            .as_deref()
            .or_else(|| self.cmdline.as_deref().and_then(|line| line.split(' ').next()))
    }
}

/// `comm[pid] user`, falling back to the numeric uid
impl fmt::Display for ProcessInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.name().unwrap_or("?"), self.pid)?;
        match (&self.username, self.uid) {
            (Some(user), _) => write!(f, " {}", user),
            (None, Some(uid)) => write!(f, " uid={}", uid),
            (None, None) => Ok(()),
        }
    }
}

fn first_id(value: &str) -> Option<u32> {
    value.split_whitespace().next()?.parse().ok()
}

/// NUL-separated arguments joined by spaces. Kernel threads have an empty
/// command line.
fn parse_cmdline(raw: &[u8]) -> Option<String> {
    let args: Vec<String> = raw
        .split(|&b| b == 0)
        .filter(|arg| !arg.is_empty())
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect();
    (!args.is_empty()).then(|| args.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tsshd\nUmask:\t0022\nState:\tS (sleeping)\nPid:\t812\n\
                          Uid:\t0\t0\t0\t0\nGid:\t4\t4\t4\t4\nGroups:\t\n";

    #[test]
    fn test_parse_status() {
        let info = ProcessInfo::parse_status(812, STATUS);

        assert_eq!(info.pid, 812);
        assert_eq!(info.comm.as_deref(), Some("sshd"));
        assert_eq!(info.uid, Some(0));
        assert_eq!(info.gid, Some(4));
    }

    #[test]
    fn test_parse_status_tolerates_garbage() {
        let info = ProcessInfo::parse_status(5, "Uid:\tnope\nrandom line\nName:\t\n");

        assert_eq!(info.uid, None);
        assert_eq!(info.comm, None);
    }

    #[test]
    fn test_cmdline_joins_arguments() {
        let info = ProcessInfo::new(1).with_cmdline(b"/usr/bin/vim\0-n\0/etc/hosts\0");
        assert_eq!(info.cmdline.as_deref(), Some("/usr/bin/vim -n /etc/hosts"));

        let kthread = ProcessInfo::new(2).with_cmdline(b"");
        assert_eq!(kthread.cmdline, None);
    }

    #[test]
    fn test_display() {
        let info = ProcessInfo::parse_status(812, STATUS);
        assert_eq!(info.to_string(), "sshd[812] uid=0");

        let named = info.with_username(Some("root".to_string()));
        assert_eq!(named.to_string(), "sshd[812] root");

        let bare = ProcessInfo::new(9).with_cmdline(b"python3\0job.py\0");
        assert_eq!(bare.to_string(), "python3[9]");
    }
}
