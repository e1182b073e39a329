//! `/proc` lookups for the Linux resolver

use std::fs;
use std::path::PathBuf;

use crate::domain::{Pid, Tid};

use super::NameSource;

/// Linux idle task: thread 0 in process 0
const SWAPPER: &str = "swapper";

/// [`NameSource`] reading a procfs mount
#[derive(Debug, Clone)]
pub struct ProcNameSource {
    root: PathBuf,
}

impl Default for ProcNameSource {
    fn default() -> Self {
        Self::new("/proc")
    }
}

impl ProcNameSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, id: u32, file: &str) -> Option<String> {
        fs::read_to_string(self.root.join(id.to_string()).join(file)).ok()
    }
}

impl NameSource for ProcNameSource {
    fn system_process(&self) -> (Pid, &'static str) {
        (Pid(0), SWAPPER)
    }

    /// `Tgid` from `/proc/<tid>/status`.
    fn owning_process(&self, tid: Tid) -> Option<Pid> {
        if tid.0 == 0 {
            return Some(Pid(0));
        }
        let status = self.read(tid.0, "status")?;
        status
            .lines()
            .find_map(|line| line.strip_prefix("Tgid:"))
            .and_then(|tgid| tgid.trim().parse().ok())
            .map(Pid)
    }

    /// `/proc/<tid>/comm`.
    fn thread_name(&self, tid: Tid) -> Option<String> {
        if tid.0 == 0 {
            return Some(SWAPPER.to_string());
        }
        self.read(tid.0, "comm")
    }

    /// Command name field of `/proc/<tid>/stat`.
    fn thread_name_fallback(&self, tid: Tid, _pid: Option<Pid>) -> Option<String> {
        extract_comm(&self.read(tid.0, "stat")?).map(str::to_string)
    }

    /// `/proc/<pid>/exe` target, else `/proc/<pid>/comm`.
    fn process_image(&self, pid: Pid) -> Option<String> {
        let proc_dir = self.root.join(pid.0.to_string());
        match fs::read_link(proc_dir.join("exe")) {
            Ok(exe) => Some(exe.to_string_lossy().into_owned()),
            Err(_) => self.read(pid.0, "comm"),
        }
    }
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Option<&str> {
    let open = stat_line.find('(')?;
    let close = stat_line.rfind(')')?;
    (open < close).then(|| &stat_line[open + 1..close])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::Resolver;

    fn write(root: &std::path::Path, id: u32, file: &str, contents: &str) {
        let dir = root.join(id.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(file), contents).unwrap();
    }

    #[test]
    fn test_extract_comm() {
        let stat = "1234 (my-app) S 1 1234 1234 0 -1 4194304";
        assert_eq!(extract_comm(stat), Some("my-app"));
    }

    #[test]
    fn test_extract_comm_with_parens() {
        // Command names can contain parentheses
        let stat = "1234 (app (v2)) S 1 1234";
        assert_eq!(extract_comm(stat), Some("app (v2)"));
        assert_eq!(extract_comm(") broken ("), None);
    }

    #[test]
    fn test_fake_proc_tree() {
        let root = tempfile::tempdir().unwrap();
        write(root.path(), 101, "status", "Name:\tworker\nTgid:\t100\nPid:\t101\n");
        write(root.path(), 101, "comm", "worker-1\n");
        write(root.path(), 100, "comm", "server\n");
        write(root.path(), 102, "status", "Tgid:\t100\n");
        write(root.path(), 102, "stat", "102 (io (2)) S 1 100");

        let resolver = Resolver::new(ProcNameSource::new(root.path()));
        let mut sink = Vec::new();

        let resolved = resolver.resolve(Tid(101), &mut sink);
        assert_eq!(resolved.thread, "worker-1");
        assert_eq!(resolved.process, "server");

        let resolved = resolver.resolve(Tid(102), &mut sink);
        assert_eq!(resolved.thread, "io (2)");
        assert_eq!(resolved.process, "server");

        let resolved = resolver.resolve(Tid(999), &mut sink);
        assert_eq!(resolved.thread, "???");
        assert_eq!(resolved.process, "???");
        assert_eq!(sink.len(), 6);
    }

    #[test]
    fn test_swapper() {
        let root = tempfile::tempdir().unwrap();
        let resolver = Resolver::new(ProcNameSource::new(root.path()));
        let resolved = resolver.resolve(Tid(0), &mut Vec::new());
        assert_eq!(resolved.thread, "swapper");
        assert_eq!(resolved.process, "swapper");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resolves_own_thread() {
        let resolved = std::thread::Builder::new()
            .name("resolver-probe".to_string())
            .spawn(|| Resolver::new(ProcNameSource::default()).resolve(Tid::current(), &mut Vec::new()))
            .unwrap()
            .join()
            .unwrap();
        assert_eq!(resolved.thread, "resolver-probe");
        assert_ne!(resolved.process, "???");
    }
}
