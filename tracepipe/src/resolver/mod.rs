//! External name resolver
//!
//! Turns an OS thread id into two one-shot records: the thread's name and the
//! name of the process that owns it. Lookups are best-effort; every failure
//! degrades to [`UNRESOLVED_NAME`] and both records are always emitted.
//!
//! The OS layer is a [`NameSource`]: [`ProcNameSource`] reads `/proc` on Linux,
//! `Win32NameSource` queries the thread and process APIs on Windows.

mod procfs;
#[cfg(windows)]
mod win32;

pub use procfs::ProcNameSource;
#[cfg(windows)]
pub use win32::Win32NameSource;

use log::debug;
use tracepipe_common::{NameKind, QueueItem, UNRESOLVED_NAME};

use crate::domain::{Pid, Tid};

/// Receiver of resolved names
pub trait NameSink {
    fn send_name(&mut self, subject: u64, kind: NameKind, text: &str);
}

impl NameSink for Vec<QueueItem> {
    fn send_name(&mut self, subject: u64, kind: NameKind, text: &str) {
        self.push(QueueItem::external_name(subject, kind, text));
    }
}

/// OS queries behind the resolver; every method returns `None` on failure
pub trait NameSource: Send {
    /// Pseudo-process without an image, and the literal name emitted for it.
    fn system_process(&self) -> (Pid, &'static str);

    /// Process owning `tid`. `None` when the thread cannot be looked up.
    fn owning_process(&self, tid: Tid) -> Option<Pid>;

    /// Preferred thread name lookup.
    fn thread_name(&self, tid: Tid) -> Option<String>;

    /// Thread name lookup used when [`NameSource::thread_name`] yields nothing.
    fn thread_name_fallback(&self, tid: Tid, pid: Option<Pid>) -> Option<String>;

    /// Image path (or bare image name) of `pid`.
    fn process_image(&self, pid: Pid) -> Option<String>;
}

/// Names resolved for one thread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedNames {
    pub thread: String,
    pub process: String,
}

/// Best-effort thread → (thread name, process name) resolver
pub struct Resolver {
    source: Box<dyn NameSource>,
}

impl Resolver {
    pub fn new(source: impl NameSource + 'static) -> Self {
        Self { source: Box::new(source) }
    }

    /// Resolver over the OS this binary was built for.
    #[must_use]
    pub fn platform_default() -> Self {
        #[cfg(windows)]
        {
            Self::new(Win32NameSource)
        }
        #[cfg(not(windows))]
        {
            Self::new(ProcNameSource::default())
        }
    }

    /// Resolve `tid` and emit exactly one thread-name and one process-name record.
    pub fn resolve(&self, tid: Tid, sink: &mut dyn NameSink) -> ResolvedNames {
        let names = self.lookup(tid);
        sink.send_name(tid.as_record(), NameKind::ThreadName, &names.thread);
        sink.send_name(tid.as_record(), NameKind::ProcessName, &names.process);
        debug!("Resolved {tid}: thread '{}', process '{}'", names.thread, names.process);
        names
    }

    fn lookup(&self, tid: Tid) -> ResolvedNames {
        let pid = self.source.owning_process(tid);

        let thread = non_empty(self.source.thread_name(tid))
            .or_else(|| non_empty(self.source.thread_name_fallback(tid, pid)))
            .unwrap_or_else(|| UNRESOLVED_NAME.to_string());

        let (system_pid, system_name) = self.source.system_process();
        let process = match pid {
            Some(pid) if pid == system_pid => system_name.to_string(),
            Some(pid) => non_empty(self.source.process_image(pid).map(|image| final_component(&image).to_string()))
                .unwrap_or_else(|| UNRESOLVED_NAME.to_string()),
            None => UNRESOLVED_NAME.to_string(),
        };

        ResolvedNames { thread, process }
    }
}

fn non_empty(name: Option<String>) -> Option<String> {
    name.map(|n| n.trim_end_matches(['\n', '\0']).to_string()).filter(|n| !n.is_empty())
}

/// Last component of a `/` or `\` separated path.
fn final_component(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Source backed by fixed tables; missing entries fail
    #[derive(Default)]
    struct TableSource {
        owners: HashMap<u32, u32>,
        names: HashMap<u32, &'static str>,
        fallback_names: HashMap<u32, &'static str>,
        images: HashMap<u32, &'static str>,
    }

    impl NameSource for TableSource {
        fn system_process(&self) -> (Pid, &'static str) {
            (Pid(4), "System")
        }

        fn owning_process(&self, tid: Tid) -> Option<Pid> {
            self.owners.get(&tid.0).copied().map(Pid)
        }

        fn thread_name(&self, tid: Tid) -> Option<String> {
            self.names.get(&tid.0).map(ToString::to_string)
        }

        fn thread_name_fallback(&self, tid: Tid, _pid: Option<Pid>) -> Option<String> {
            self.fallback_names.get(&tid.0).map(ToString::to_string)
        }

        fn process_image(&self, pid: Pid) -> Option<String> {
            self.images.get(&pid.0).map(ToString::to_string)
        }
    }

    fn names(sink: &[QueueItem]) -> Vec<(u64, NameKind, String)> {
        sink.iter()
            .map(|item| match item {
                QueueItem::ExternalName(n) => (n.subject, n.kind, n.text.as_str().to_string()),
                other => panic!("unexpected record {other:?}"),
            })
            .collect()
    }

    #[test]
    fn test_failing_source_emits_sentinels() {
        let resolver = Resolver::new(TableSource::default());
        let mut sink = Vec::new();
        resolver.resolve(Tid(77), &mut sink);
        assert_eq!(
            names(&sink),
            vec![
                (77, NameKind::ThreadName, "???".to_string()),
                (77, NameKind::ProcessName, "???".to_string()),
            ]
        );
    }

    #[test]
    fn test_primary_then_fallback_thread_name() {
        let mut source = TableSource::default();
        source.names.insert(1, "");
        source.fallback_names.insert(1, "from-fallback");
        source.names.insert(2, "primary\n");
        source.fallback_names.insert(2, "unused");
        let resolver = Resolver::new(source);

        assert_eq!(resolver.lookup(Tid(1)).thread, "from-fallback");
        assert_eq!(resolver.lookup(Tid(2)).thread, "primary");
    }

    #[test]
    fn test_process_name_is_final_component() {
        let mut source = TableSource::default();
        source.owners.insert(10, 1000);
        source.images.insert(1000, r"\Device\HarddiskVolume3\Program Files\app.exe");
        source.owners.insert(11, 1100);
        source.images.insert(1100, "/usr/bin/server");
        let resolver = Resolver::new(source);

        assert_eq!(resolver.lookup(Tid(10)).process, "app.exe");
        assert_eq!(resolver.lookup(Tid(11)).process, "server");
    }

    #[test]
    fn test_system_process_literal() {
        let mut source = TableSource::default();
        source.owners.insert(8, 4);
        let resolver = Resolver::new(source);
        let mut sink = Vec::new();
        let resolved = resolver.resolve(Tid(8), &mut sink);
        assert_eq!(resolved.process, "System");
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn test_unknown_owner_skips_image_lookup() {
        let mut source = TableSource::default();
        source.images.insert(0, "/should/not/be/used");
        source.names.insert(5, "worker");
        let resolver = Resolver::new(source);
        let resolved = resolver.lookup(Tid(5));
        assert_eq!(resolved, ResolvedNames { thread: "worker".to_string(), process: "???".to_string() });
    }
}
