//! Versioned binary layout of the outgoing record stream
//!
//! A stream is a [`StreamHeader`] followed by records. Each record is a single
//! [`QueueType`] tag byte and a fixed little-endian payload:
//!
//! | tag | payload |
//! |-----|---------|
//! | `ZoneBegin` | `time: i64`, `srcloc: u64` |
//! | `ZoneEnd` | `time: i64` |
//! | `Message` | `time: i64`, `len: u8`, `bytes[len]` |
//! | `PlotData` | `time: i64`, `name: u64`, `value: f64` |
//! | `ContextSwitch` | `time: i64`, `old: u64`, `new: u64`, `cpu: u8`, `reason: u8`, `state: u8` |
//! | `ThreadWakeup` | `time: i64`, `thread: u64` |
//! | `ExternalName` | `subject: u64`, `kind: u8`, `len: u8`, `bytes[len]` |
//! | `ThreadContext` | `thread: u64` |
//!
//! Any change to this table or to the state codes requires bumping
//! [`PROTOCOL_VERSION`].

use core::fmt;

use crate::{
    ContextSwitch, ExternalName, Message, NameKind, PlotData, QueueItem, QueueType, ShortString,
    ThreadContext, ThreadWakeup, ZoneBegin, ZoneEnd, SHORT_STRING_CAPACITY,
};

/// Magic bytes opening every stream
pub const STREAM_MAGIC: [u8; 4] = *b"TPIP";

/// Current protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the encoded [`StreamHeader`]
pub const HEADER_SIZE: usize = 8;

/// Upper bound on the encoded size of any single record
pub const MAX_RECORD_SIZE: usize = 1 + 8 + 1 + 1 + SHORT_STRING_CAPACITY;

/// Errors produced while decoding a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Input ended in the middle of a header or record
    Truncated,
    /// Stream does not start with [`STREAM_MAGIC`]
    BadMagic,
    /// Stream was written with a protocol version this build does not read
    UnsupportedVersion(u16),
    /// Record tag is not a known [`QueueType`]
    UnknownTag(u8),
    /// `ExternalName` kind byte is not a known [`NameKind`]
    UnknownNameKind(u8),
    /// Text payload longer than [`SHORT_STRING_CAPACITY`] or not UTF-8
    InvalidText,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "record stream truncated"),
            Self::BadMagic => write!(f, "missing stream magic"),
            Self::UnsupportedVersion(v) => {
                write!(f, "unsupported protocol version {v} (expected {PROTOCOL_VERSION})")
            }
            Self::UnknownTag(tag) => write!(f, "unknown record tag {tag}"),
            Self::UnknownNameKind(kind) => write!(f, "unknown name kind {kind}"),
            Self::InvalidText => write!(f, "invalid text payload"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// Output buffer too small for the record being encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferTooSmall {
    pub needed: usize,
}

impl fmt::Display for BufferTooSmall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "output buffer too small, {} bytes needed", self.needed)
    }
}

#[cfg(feature = "std")]
impl std::error::Error for BufferTooSmall {}

/// Leading bytes of a record stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    pub version: u16,
}

impl Default for StreamHeader {
    fn default() -> Self {
        Self { version: PROTOCOL_VERSION }
    }
}

impl StreamHeader {
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(&STREAM_MAGIC);
        out[4..6].copy_from_slice(&self.version.to_le_bytes());
        out
    }

    /// Parse and validate a stream header.
    ///
    /// # Errors
    /// Returns an error if the input is short, the magic is wrong, or the
    /// version is not [`PROTOCOL_VERSION`].
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = ByteReader::new(data);
        if r.take(4)? != STREAM_MAGIC {
            return Err(DecodeError::BadMagic);
        }
        let version = r.u16()?;
        r.take(2)?;
        if version != PROTOCOL_VERSION {
            return Err(DecodeError::UnsupportedVersion(version));
        }
        Ok(Self { version })
    }
}

/// Exact number of bytes [`encode`] writes for `item`.
#[must_use]
pub fn encoded_len(item: &QueueItem) -> usize {
    1 + match item {
        QueueItem::ZoneBegin(_) | QueueItem::ThreadWakeup(_) => 16,
        QueueItem::ZoneEnd(_) | QueueItem::ThreadContext(_) => 8,
        QueueItem::Message(m) => 8 + 1 + m.text.len(),
        QueueItem::PlotData(_) => 24,
        QueueItem::ContextSwitch(_) => 27,
        QueueItem::ExternalName(n) => 8 + 1 + 1 + n.text.len(),
    }
}

/// Encode one record into `out`, returning the number of bytes written.
///
/// # Errors
/// Returns [`BufferTooSmall`] if `out` cannot hold the record; nothing is
/// meaningful in `out` in that case.
pub fn encode(item: &QueueItem, out: &mut [u8]) -> Result<usize, BufferTooSmall> {
    let needed = encoded_len(item);
    if out.len() < needed {
        return Err(BufferTooSmall { needed });
    }
    let mut w = ByteWriter { out, pos: 0 };
    w.u8(item.kind() as u8);
    match item {
        QueueItem::ZoneBegin(z) => {
            w.i64(z.time);
            w.u64(z.srcloc);
        }
        QueueItem::ZoneEnd(z) => w.i64(z.time),
        QueueItem::Message(m) => {
            w.i64(m.time);
            w.text(&m.text);
        }
        QueueItem::PlotData(p) => {
            w.i64(p.time);
            w.u64(p.name);
            w.u64(p.value.to_bits());
        }
        QueueItem::ContextSwitch(c) => {
            w.i64(c.time);
            w.u64(c.old_thread);
            w.u64(c.new_thread);
            w.u8(c.cpu);
            w.u8(c.reason);
            w.u8(c.state);
        }
        QueueItem::ThreadWakeup(t) => {
            w.i64(t.time);
            w.u64(t.thread);
        }
        QueueItem::ExternalName(n) => {
            w.u64(n.subject);
            w.u8(n.kind as u8);
            w.text(&n.text);
        }
        QueueItem::ThreadContext(t) => w.u64(t.thread),
    }
    debug_assert_eq!(w.pos, needed);
    Ok(w.pos)
}

/// Decode one record from the front of `data`.
///
/// Returns the record and the number of bytes it occupied.
///
/// # Errors
/// Returns a [`DecodeError`] if the record is truncated or malformed. The
/// input is never read past its end.
pub fn decode(data: &[u8]) -> Result<(QueueItem, usize), DecodeError> {
    let mut r = ByteReader::new(data);
    let tag = r.u8()?;
    let kind = QueueType::from_u8(tag).ok_or(DecodeError::UnknownTag(tag))?;
    let item = match kind {
        QueueType::ZoneBegin => QueueItem::ZoneBegin(ZoneBegin { time: r.i64()?, srcloc: r.u64()? }),
        QueueType::ZoneEnd => QueueItem::ZoneEnd(ZoneEnd { time: r.i64()? }),
        QueueType::Message => QueueItem::Message(Message { time: r.i64()?, text: r.text()? }),
        QueueType::PlotData => QueueItem::PlotData(PlotData {
            time: r.i64()?,
            name: r.u64()?,
            value: f64::from_bits(r.u64()?),
        }),
        QueueType::ContextSwitch => QueueItem::ContextSwitch(ContextSwitch {
            time: r.i64()?,
            old_thread: r.u64()?,
            new_thread: r.u64()?,
            cpu: r.u8()?,
            reason: r.u8()?,
            state: r.u8()?,
        }),
        QueueType::ThreadWakeup => {
            QueueItem::ThreadWakeup(ThreadWakeup { time: r.i64()?, thread: r.u64()? })
        }
        QueueType::ExternalName => {
            let subject = r.u64()?;
            let raw_kind = r.u8()?;
            let kind = NameKind::from_u8(raw_kind).ok_or(DecodeError::UnknownNameKind(raw_kind))?;
            QueueItem::ExternalName(ExternalName { subject, kind, text: r.text()? })
        }
        QueueType::ThreadContext => QueueItem::ThreadContext(ThreadContext { thread: r.u64()? }),
    };
    Ok((item, r.pos))
}

struct ByteWriter<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl ByteWriter<'_> {
    fn put(&mut self, bytes: &[u8]) {
        self.out[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u64(&mut self, v: u64) {
        self.put(&v.to_le_bytes());
    }

    fn i64(&mut self, v: i64) {
        self.put(&v.to_le_bytes());
    }

    #[allow(clippy::cast_possible_truncation)]
    fn text(&mut self, s: &ShortString) {
        self.u8(s.len() as u8);
        self.put(s.as_bytes());
    }
}

/// Bounded cursor; every read checks the remaining length first.
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        let bytes = self.data.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    fn text(&mut self) -> Result<ShortString, DecodeError> {
        let len = usize::from(self.u8()?);
        if len > SHORT_STRING_CAPACITY {
            return Err(DecodeError::InvalidText);
        }
        let bytes = self.take(len)?;
        let text = core::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidText)?;
        Ok(ShortString::new(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{STATE_SLEEPING, UNRESOLVED_NAME};

    fn encode_to_buf(item: &QueueItem) -> ([u8; MAX_RECORD_SIZE], usize) {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let n = encode(item, &mut buf).unwrap();
        (buf, n)
    }

    #[test]
    fn test_context_switch_layout() {
        let item = QueueItem::context_switch(5000, 100, 200, 3, 7, STATE_SLEEPING);
        let (buf, n) = encode_to_buf(&item);
        assert_eq!(n, 28);
        assert_eq!(buf[0], QueueType::ContextSwitch as u8);
        assert_eq!(&buf[1..9], &5000i64.to_le_bytes());
        assert_eq!(&buf[9..17], &100u64.to_le_bytes());
        assert_eq!(&buf[17..25], &200u64.to_le_bytes());
        assert_eq!(&buf[25..28], &[3, 7, STATE_SLEEPING]);
        assert_eq!(decode(&buf[..n]).unwrap(), (item, n));
    }

    #[test]
    fn test_external_name_sentinel_survives() {
        let item = QueueItem::external_name(42, NameKind::ProcessName, UNRESOLVED_NAME);
        let (buf, n) = encode_to_buf(&item);
        assert_eq!(n, encoded_len(&item));
        let (decoded, used) = decode(&buf[..n]).unwrap();
        assert_eq!(used, n);
        let QueueItem::ExternalName(name) = decoded else { panic!("wrong kind") };
        assert_eq!(name.text.as_str(), "???");
        assert_eq!(name.kind, NameKind::ProcessName);
    }

    #[test]
    fn test_decode_truncated_never_panics() {
        let item = QueueItem::message(9, "hello");
        let (buf, n) = encode_to_buf(&item);
        for cut in 0..n {
            assert_eq!(decode(&buf[..cut]), Err(DecodeError::Truncated));
        }
    }

    #[test]
    fn test_decode_rejects_bad_input() {
        assert_eq!(decode(&[0xff]), Err(DecodeError::UnknownTag(0xff)));

        let mut bad_kind = [0u8; 11];
        bad_kind[0] = QueueType::ExternalName as u8;
        bad_kind[9] = 9;
        assert_eq!(decode(&bad_kind), Err(DecodeError::UnknownNameKind(9)));

        let bad_utf8 = [QueueType::Message as u8, 0, 0, 0, 0, 0, 0, 0, 0, 2, 0xc3, 0x28];
        assert_eq!(decode(&bad_utf8), Err(DecodeError::InvalidText));
    }

    #[test]
    fn test_encode_buffer_too_small() {
        let item = QueueItem::zone_end(1);
        let mut buf = [0u8; 4];
        assert_eq!(encode(&item, &mut buf), Err(BufferTooSmall { needed: 9 }));
    }

    #[test]
    fn test_header() {
        let header = StreamHeader::default().encode();
        assert_eq!(&header[..4], b"TPIP");
        assert_eq!(StreamHeader::decode(&header), Ok(StreamHeader { version: PROTOCOL_VERSION }));

        let mut future = header;
        future[4] = 2;
        assert_eq!(StreamHeader::decode(&future), Err(DecodeError::UnsupportedVersion(2)));
        assert_eq!(StreamHeader::decode(b"NOPE\x01\0\0\0"), Err(DecodeError::BadMagic));
        assert_eq!(StreamHeader::decode(&header[..5]), Err(DecodeError::Truncated));
    }
}
