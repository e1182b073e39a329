//! Recorded stream decoding for `tracepipe dump`
//!
//! Reads a stream written by the drain thread and prints one line per record,
//! either as aligned text or as JSON lines.

use std::io::Write;

use serde::Serialize;
use tracepipe_common::wire::{self, StreamHeader, HEADER_SIZE};
use tracepipe_common::{
    NameKind, QueueItem, STATE_DEAD, STATE_IDLE, STATE_PAGING, STATE_RUNNING, STATE_SLEEPING,
    STATE_STOPPED, STATE_TRACED, STATE_UNINTERRUPTIBLE, STATE_UNKNOWN, STATE_ZOMBIE,
};

use crate::domain::DumpError;

/// Output flavour of [`dump`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpFormat {
    #[default]
    Text,
    JsonLines,
}

/// Iterator over `(byte offset, record)` pairs of a stream
///
/// Stops after the first corrupt record.
pub struct Records<'a> {
    data: &'a [u8],
    offset: usize,
}

/// Validate the stream header and iterate over the records behind it.
///
/// # Errors
/// Returns [`DumpError::Header`] for a missing or foreign header.
pub fn records(data: &[u8]) -> Result<Records<'_>, DumpError> {
    StreamHeader::decode(data).map_err(DumpError::Header)?;
    Ok(Records { data, offset: HEADER_SIZE })
}

impl Iterator for Records<'_> {
    type Item = Result<(usize, QueueItem), DumpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let offset = self.offset;
        match wire::decode(&self.data[offset..]) {
            Ok((item, used)) => {
                self.offset += used;
                Some(Ok((offset, item)))
            }
            Err(error) => {
                self.offset = self.data.len();
                Some(Err(DumpError::Record { offset, error }))
            }
        }
    }
}

/// Name of a canonical state / reason code, `None` for OS-specific values.
#[must_use]
pub fn state_label(code: u8) -> Option<&'static str> {
    Some(match code {
        STATE_UNKNOWN => "unknown",
        STATE_UNINTERRUPTIBLE => "uninterruptible",
        STATE_IDLE => "idle",
        STATE_RUNNING => "running",
        STATE_SLEEPING => "sleeping",
        STATE_STOPPED => "stopped",
        STATE_TRACED => "traced",
        STATE_PAGING => "paging",
        STATE_DEAD => "dead",
        STATE_ZOMBIE => "zombie",
        _ => return None,
    })
}

/// JSON shape of one record
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RecordView<'a> {
    ZoneBegin {
        time: i64,
        srcloc: u64,
    },
    ZoneEnd {
        time: i64,
    },
    Message {
        time: i64,
        text: &'a str,
    },
    Plot {
        time: i64,
        name: u64,
        value: f64,
    },
    ContextSwitch {
        time: i64,
        old_thread: u64,
        new_thread: u64,
        cpu: u8,
        reason: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason_name: Option<&'static str>,
        state: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        state_name: Option<&'static str>,
    },
    ThreadWakeup {
        time: i64,
        thread: u64,
    },
    ExternalName {
        subject: u64,
        name_kind: &'static str,
        text: &'a str,
    },
    ThreadContext {
        thread: u64,
    },
}

impl<'a> From<&'a QueueItem> for RecordView<'a> {
    fn from(item: &'a QueueItem) -> Self {
        match item {
            QueueItem::ZoneBegin(z) => Self::ZoneBegin { time: z.time, srcloc: z.srcloc },
            QueueItem::ZoneEnd(z) => Self::ZoneEnd { time: z.time },
            QueueItem::Message(m) => Self::Message { time: m.time, text: m.text.as_str() },
            QueueItem::PlotData(p) => Self::Plot { time: p.time, name: p.name, value: p.value },
            QueueItem::ContextSwitch(cs) => Self::ContextSwitch {
                time: cs.time,
                old_thread: cs.old_thread,
                new_thread: cs.new_thread,
                cpu: cs.cpu,
                reason: cs.reason,
                reason_name: state_label(cs.reason),
                state: cs.state,
                state_name: state_label(cs.state),
            },
            QueueItem::ThreadWakeup(w) => Self::ThreadWakeup { time: w.time, thread: w.thread },
            QueueItem::ExternalName(n) => Self::ExternalName {
                subject: n.subject,
                name_kind: name_kind_label(n.kind),
                text: n.text.as_str(),
            },
            QueueItem::ThreadContext(c) => Self::ThreadContext { thread: c.thread },
        }
    }
}

fn name_kind_label(kind: NameKind) -> &'static str {
    match kind {
        NameKind::ThreadName => "thread",
        NameKind::ProcessName => "process",
    }
}

fn code_text(code: u8) -> String {
    state_label(code).map_or_else(|| code.to_string(), str::to_string)
}

/// One aligned text line for `item`, without the trailing newline.
#[must_use]
pub fn format_text(offset: usize, item: &QueueItem) -> String {
    let body = match item {
        QueueItem::ZoneBegin(z) => format!("ZoneBegin      time={} srcloc={:#x}", z.time, z.srcloc),
        QueueItem::ZoneEnd(z) => format!("ZoneEnd        time={}", z.time),
        QueueItem::Message(m) => format!("Message        time={} {:?}", m.time, m.text.as_str()),
        QueueItem::PlotData(p) => format!("Plot           time={} name={:#x} value={}", p.time, p.name, p.value),
        QueueItem::ContextSwitch(cs) => format!(
            "ContextSwitch  time={} old={} new={} cpu={} reason={} state={}",
            cs.time,
            cs.old_thread,
            cs.new_thread,
            cs.cpu,
            code_text(cs.reason),
            code_text(cs.state)
        ),
        QueueItem::ThreadWakeup(w) => format!("ThreadWakeup   time={} thread={}", w.time, w.thread),
        QueueItem::ExternalName(n) => {
            format!("ExternalName   {}={} {:?}", name_kind_label(n.kind), n.subject, n.text.as_str())
        }
        QueueItem::ThreadContext(c) => format!("ThreadContext  thread={}", c.thread),
    };
    format!("{offset:>8}  {body}")
}

/// Decode `data` and write one line per record to `out`.
///
/// Returns the number of records printed.
///
/// # Errors
/// Fails on a bad header, the first corrupt record, or a write error. Lines
/// for the records before a corrupt one are already written.
pub fn dump(data: &[u8], format: DumpFormat, out: &mut impl Write) -> Result<u64, DumpError> {
    let mut count = 0;
    for record in records(data)? {
        let (offset, item) = record?;
        match format {
            DumpFormat::Text => writeln!(out, "{}", format_text(offset, &item))?,
            DumpFormat::JsonLines => {
                serde_json::to_writer(&mut *out, &RecordView::from(&item))?;
                out.write_all(b"\n")?;
            }
        }
        count += 1;
    }
    out.flush()?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracepipe_common::wire::DecodeError;

    fn stream(items: &[QueueItem]) -> Vec<u8> {
        let mut data = StreamHeader::default().encode().to_vec();
        for item in items {
            let mut buf = [0u8; wire::MAX_RECORD_SIZE];
            let len = wire::encode(item, &mut buf).unwrap();
            data.extend_from_slice(&buf[..len]);
        }
        data
    }

    #[test]
    fn test_text_lines() {
        let data = stream(&[
            QueueItem::thread_context(9),
            QueueItem::context_switch(5000, 100, 200, 3, STATE_UNKNOWN, STATE_SLEEPING),
            QueueItem::external_name(100, NameKind::ThreadName, "worker"),
        ]);
        let mut out = Vec::new();
        assert_eq!(dump(&data, DumpFormat::Text, &mut out).unwrap(), 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("ThreadContext  thread=9"));
        assert!(lines[1].contains("old=100 new=200 cpu=3 reason=unknown state=sleeping"));
        assert!(lines[2].ends_with("thread=100 \"worker\""));
    }

    #[test]
    fn test_json_lines() {
        let data = stream(&[
            QueueItem::context_switch(1, 1, 2, 0, 6, 5),
            QueueItem::message(2, "hello"),
        ]);
        let mut out = Vec::new();
        dump(&data, DumpFormat::JsonLines, &mut out).unwrap();

        let values: Vec<serde_json::Value> = String::from_utf8(out)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(values[0]["kind"], "context_switch");
        assert_eq!(values[0]["reason"], 6);
        // Raw OS codes carry no label.
        assert!(values[0].get("state_name").is_none());
        assert_eq!(values[1]["kind"], "message");
        assert_eq!(values[1]["text"], "hello");
    }

    #[test]
    fn test_foreign_header() {
        let err = dump(b"not a stream", DumpFormat::Text, &mut Vec::new()).unwrap_err();
        assert!(matches!(err, DumpError::Header(DecodeError::BadMagic)));
    }

    #[test]
    fn test_truncated_tail_reports_offset() {
        let mut data = stream(&[QueueItem::zone_end(1), QueueItem::zone_end(2)]);
        data.pop();
        let mut out = Vec::new();
        let err = dump(&data, DumpFormat::Text, &mut out).unwrap_err();

        let second = HEADER_SIZE + wire::encoded_len(&QueueItem::zone_end(1));
        assert!(matches!(err, DumpError::Record { offset, error: DecodeError::Truncated } if offset == second));
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_state_labels_cover_canonical_codes() {
        for code in STATE_UNKNOWN..=STATE_ZOMBIE {
            assert!(state_label(code).is_some(), "{code}");
        }
        assert_eq!(state_label(99), None);
    }
}
