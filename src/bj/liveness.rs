use std::ffi::CString;
use std::fs;
use std::io;

/// OS-visible name every job worker gives itself before recording its pid.
/// Liveness checks compare against it exactly; it must fit the 15 byte `comm` limit.
pub const PROCESS_NAME: &str = "cmk-job";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    /// Single-letter state from `/proc/<pid>/stat` (R, S, D, Z, ...).
    pub state: char,
}

impl ProcessInfo {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Look up a process in `/proc`. `None` when it does not exist (or cannot be read).
pub fn process_info(pid: u32) -> Option<ProcessInfo> {
    if pid == 0 {
        return None;
    }
    let stat = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    parse_stat(pid, &stat)
}

pub(crate) fn parse_stat(pid: u32, stat: &str) -> Option<ProcessInfo> {
    // "<pid> (<comm>) <state> ..." where comm may itself contain spaces and ')'.
    let lparen = stat.find('(')?;
    let rparen = stat.rfind(')')?;
    if rparen <= lparen {
        return None;
    }
    let name = stat.get(lparen + 1..rparen)?.to_string();
    let state = stat.get(rparen + 1..)?.trim_start().chars().next()?;
    Some(ProcessInfo { pid, name, state })
}

/// The only identity check done on a recorded pid: exact name match, and not a zombie
/// (an orphaned worker may linger unreaped while nobody waits for it).
pub fn is_correct_process(info: &ProcessInfo) -> bool {
    !info.is_zombie() && info.name == PROCESS_NAME
}

/// Rename the current process. `/proc/self/comm` names the thread group leader, which is
/// what other processes see, even when called from a non-main thread.
pub fn set_process_name(name: &str) -> io::Result<()> {
    let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    match fs::write("/proc/self/comm", name) {
        Ok(()) => Ok(()),
        Err(_) => nix::sys::prctl::set_name(&cname).map_err(io::Error::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn parse_stat_handles_odd_names() {
        let info = parse_stat(7, "7 (we (ird) name) S 1 7 7 0 -1").unwrap();
        assert_eq!(info.name, "we (ird) name");
        assert_eq!(info.state, 'S');
        assert!(!info.is_zombie());

        let zombie = parse_stat(8, "8 (cmk-job) Z 1 8 8").unwrap();
        assert!(zombie.is_zombie());
        assert!(!is_correct_process(&zombie));
    }

    #[test]
    fn parse_stat_rejects_garbage() {
        assert_eq!(parse_stat(1, "nonsense"), None);
        assert_eq!(parse_stat(1, "1 )x( S"), None);
    }

    #[test]
    fn name_match_is_exact() {
        let mk = |name: &str| ProcessInfo {
            pid: 1,
            name: name.to_string(),
            state: 'S',
        };
        assert!(is_correct_process(&mk("cmk-job")));
        assert!(!is_correct_process(&mk("cmk-jobs")));
        assert!(!is_correct_process(&mk("cmk-job ")));
        assert!(!is_correct_process(&mk("sleep")));
    }

    #[test]
    fn unrelated_live_process_is_not_a_job() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let info = process_info(child.id()).unwrap();
        assert_eq!(info.name, "sleep");
        assert!(!is_correct_process(&info));
        child.kill().unwrap();
        child.wait().unwrap();
        assert_eq!(process_info(child.id()), None);
    }

    #[test]
    fn pid_zero_is_never_found() {
        assert_eq!(process_info(0), None);
    }
}
