use tokio::process::Command;

pub fn cmd_program(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(|s| s.as_str()));
    cmd
}

/// Signal sent during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Force,
}

/// `root` followed by all of its descendants, parents before children.
#[cfg(target_os = "linux")]
pub fn process_tree(root: u32) -> Vec<u32> {
    linux::descendants(root)
}

#[cfg(not(target_os = "linux"))]
pub fn process_tree(root: u32) -> Vec<u32> {
    vec![root]
}

/// Deliver `how` to every pid in `pids`; pids that already vanished are skipped.
pub fn signal_all(pids: &[u32], how: Termination) {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let sig = match how {
                Termination::Graceful => libc::SIGTERM,
                Termination::Force => libc::SIGKILL,
            };
            for pid in pids {
                // SAFETY: kill(2) has no memory-safety preconditions.
                unsafe {
                    libc::kill(*pid as libc::pid_t, sig);
                }
            }
        } else {
            let _ = (pids, how);
        }
    }
}

/// Deliver `how` to every member of process group `pgid`.
pub fn signal_group(pgid: u32, how: Termination) {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            let sig = match how {
                Termination::Graceful => libc::SIGTERM,
                Termination::Force => libc::SIGKILL,
            };
            // SAFETY: killpg(2) has no memory-safety preconditions.
            unsafe {
                libc::killpg(pgid as libc::pid_t, sig);
            }
        } else {
            let _ = (pgid, how);
        }
    }
}

/// Returns `true` while process group `pgid` has at least one member.
#[cfg(unix)]
pub fn group_alive(pgid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence check.
    unsafe { libc::killpg(pgid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

/// Returns `true` if a process with this pid still exists and is not a zombie.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 only performs the existence check.
    let exists = unsafe { libc::kill(pid as libc::pid_t, 0) == 0 };
    cfg_if::cfg_if! {
        if #[cfg(target_os = "linux")] {
            exists && !linux::is_zombie(pid)
        } else {
            exists
        }
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(target_os = "linux")]
mod linux {
    use std::{collections::HashMap, fs};

    pub fn descendants(root: u32) -> Vec<u32> {
        let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
        if let Ok(entries) = fs::read_dir("/proc") {
            for entry in entries.flatten() {
                let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok())
                else {
                    continue;
                };
                if let Some(ppid) = read_ppid(pid) {
                    children.entry(ppid).or_default().push(pid);
                }
            }
        }

        let mut out = vec![root];
        let mut i = 0;
        while i < out.len() {
            if let Some(kids) = children.get(&out[i]) {
                out.extend(kids.iter().copied());
            }
            i += 1;
        }
        out
    }

    fn stat_fields(pid: u32) -> Option<String> {
        let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
        // comm may contain spaces and parens; fields resume after the last ')'.
        Some(stat[stat.rfind(')')? + 1..].to_owned())
    }

    fn read_ppid(pid: u32) -> Option<u32> {
        stat_fields(pid)?.split_whitespace().nth(1)?.parse().ok()
    }

    pub fn is_zombie(pid: u32) -> bool {
        stat_fields(pid)
            .and_then(|rest| rest.split_whitespace().next().map(|st| st == "Z"))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_starts_with_root() {
        let me = std::process::id();
        let tree = process_tree(me);
        assert_eq!(tree.first(), Some(&me));
    }

    #[cfg(unix)]
    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn own_group_is_alive() {
        // SAFETY: getpgrp(2) cannot fail.
        let pgid = unsafe { libc::getpgrp() } as u32;
        assert!(group_alive(pgid));
    }
}
