//! Wire ABI shared by the tracer library and the `traced` collector.
//!
//! A chunk is a [`ChunkHeader`] followed by a packed sequence of tagged
//! records. The layout is little-endian with fields at their natural
//! (repr-C) offsets; padding bytes are written as zero and ignored on
//! decode. Changing any of it is a protocol break and requires bumping
//! [`VERSION`].

use thiserror::Error;

/// Sentinel identifying a chunk as ours.
pub const MAGIC: u64 = 0xDEAD_BEEF_BAAD;
/// Protocol revision carried in every chunk header.
pub const VERSION: u16 = 256;
/// Fixed size of every shared-memory chunk, header included.
pub const CHUNK_SIZE: usize = 10 * 1024;
/// Chunk sequence numbers wrap below this bound; the stale sweep covers
/// exactly this range.
pub const MAX_CHUNKS: u64 = 99_999;
/// Shared-memory object name prefix, completed by a sequence number.
pub const CHUNK_NAME_PREFIX: &str = "tracechunk-";
/// Default path of the collector's control socket.
pub const CONTROL_SOCKET_PATH: &str = "/tmp/traced";

/// Encoded size of [`ChunkHeader`].
pub const HEADER_SIZE: usize = 40;
/// Longest string a RegisterString record can carry (length is a u8).
pub const MAX_STRING_LEN: usize = 255;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 8;
const OFF_PID: usize = 16;
const OFF_TID: usize = 24;
const OFF_EPOCH: usize = 32;

// Payload offsets, relative to the first byte after the tag.
const OFF_MICROS: usize = 0;
const OFF_CATEGORY: usize = 8;
const OFF_TRACEPOINT: usize = 16;
const OFF_EXTRA: usize = 24;
const OFF_COUNTER_ID: usize = 32;

const OFF_STRING_ID: usize = 0;
const OFF_STRING_LEN: usize = 8;
const OFF_STRING_DATA: usize = 9;

const EVENT_PAYLOAD: usize = 24;
const ASYNC_PAYLOAD: usize = 32;
const COUNTER_PAYLOAD: usize = 32;
const COUNTER_WITH_ID_PAYLOAD: usize = 40;
const STRING_FIXED_PAYLOAD: usize = 9;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("buffer too small for record ({needed} bytes needed, {available} available)")]
    OutOfSpace { needed: usize, available: usize },

    #[error("string of {len} bytes exceeds the wire limit of 255")]
    StringTooLong { len: usize },

    #[error("chunk shorter than its header ({len} bytes)")]
    HeaderTruncated { len: usize },

    #[error("bad chunk magic {found:#x}")]
    BadMagic { found: u64 },

    #[error("unsupported chunk version {found}")]
    BadVersion { found: u16 },

    #[error("unknown message tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("truncated {kind} record at offset {offset}")]
    TruncatedRecord { kind: &'static str, offset: usize },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Record tags. Part of the wire ABI: values must not be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    NoMessage = 0,
    RegisterString = 1,
    Begin = 2,
    End = 3,
    AsyncBegin = 4,
    AsyncEnd = 5,
    Counter = 6,
    CounterWithId = 7,
}

impl MessageType {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::NoMessage),
            1 => Some(MessageType::RegisterString),
            2 => Some(MessageType::Begin),
            3 => Some(MessageType::End),
            4 => Some(MessageType::AsyncBegin),
            5 => Some(MessageType::AsyncEnd),
            6 => Some(MessageType::Counter),
            7 => Some(MessageType::CounterWithId),
            _ => None,
        }
    }
}

/// Leading header of every chunk. `epoch_micros` is the wall-clock origin
/// of the traced process; record timestamps are relative to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub magic: u64,
    pub version: u16,
    pub pid: u64,
    pub tid: u64,
    pub epoch_micros: u64,
}

impl ChunkHeader {
    pub fn new(pid: u64, tid: u64, epoch_micros: u64) -> Self {
        ChunkHeader {
            magic: MAGIC,
            version: VERSION,
            pid,
            tid,
            epoch_micros,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[OFF_MAGIC..OFF_MAGIC + 8].copy_from_slice(&self.magic.to_le_bytes());
        buf[OFF_VERSION..OFF_VERSION + 2].copy_from_slice(&self.version.to_le_bytes());
        buf[OFF_PID..OFF_PID + 8].copy_from_slice(&self.pid.to_le_bytes());
        buf[OFF_TID..OFF_TID + 8].copy_from_slice(&self.tid.to_le_bytes());
        buf[OFF_EPOCH..OFF_EPOCH + 8].copy_from_slice(&self.epoch_micros.to_le_bytes());
        buf
    }

    /// Parses and validates a header from the front of a chunk.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::HeaderTruncated { len: buf.len() });
        }
        let magic = read_u64(buf, OFF_MAGIC);
        if magic != MAGIC {
            return Err(ProtocolError::BadMagic { found: magic });
        }
        let version = read_u16(buf, OFF_VERSION);
        if version != VERSION {
            return Err(ProtocolError::BadVersion { found: version });
        }
        Ok(ChunkHeader {
            magic,
            version,
            pid: read_u64(buf, OFF_PID),
            tid: read_u64(buf, OFF_TID),
            epoch_micros: read_u64(buf, OFF_EPOCH),
        })
    }
}

/// One decoded record. Borrowed string data points into the chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Message<'a> {
    RegisterString {
        id: u64,
        string: &'a [u8],
    },
    Begin {
        micros: u64,
        category_id: u16,
        tracepoint_id: u64,
    },
    End {
        micros: u64,
        category_id: u16,
        tracepoint_id: u64,
    },
    AsyncBegin {
        micros: u64,
        category_id: u16,
        tracepoint_id: u64,
        cookie: u64,
    },
    AsyncEnd {
        micros: u64,
        category_id: u16,
        tracepoint_id: u64,
        cookie: u64,
    },
    Counter {
        micros: u64,
        category_id: u16,
        tracepoint_id: u64,
        value: u64,
    },
    CounterWithId {
        micros: u64,
        category_id: u16,
        tracepoint_id: u64,
        value: u64,
        id: u64,
    },
}

impl<'a> Message<'a> {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::RegisterString { .. } => MessageType::RegisterString,
            Message::Begin { .. } => MessageType::Begin,
            Message::End { .. } => MessageType::End,
            Message::AsyncBegin { .. } => MessageType::AsyncBegin,
            Message::AsyncEnd { .. } => MessageType::AsyncEnd,
            Message::Counter { .. } => MessageType::Counter,
            Message::CounterWithId { .. } => MessageType::CounterWithId,
        }
    }

    /// Encoded size in bytes, tag included.
    pub fn encoded_len(&self) -> usize {
        1 + match self {
            Message::RegisterString { string, .. } => STRING_FIXED_PAYLOAD + string.len(),
            Message::Begin { .. } | Message::End { .. } => EVENT_PAYLOAD,
            Message::AsyncBegin { .. } | Message::AsyncEnd { .. } => ASYNC_PAYLOAD,
            Message::Counter { .. } => COUNTER_PAYLOAD,
            Message::CounterWithId { .. } => COUNTER_WITH_ID_PAYLOAD,
        }
    }

    /// Serialises the record into the front of `buf`, returning the number
    /// of bytes written. Padding bytes are zeroed.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize> {
        let needed = self.encoded_len();
        if buf.len() < needed {
            return Err(ProtocolError::OutOfSpace {
                needed,
                available: buf.len(),
            });
        }
        buf[..needed].fill(0);
        buf[0] = self.message_type() as u8;
        let payload = &mut buf[1..needed];
        match *self {
            Message::RegisterString { id, string } => {
                if string.len() > MAX_STRING_LEN {
                    return Err(ProtocolError::StringTooLong { len: string.len() });
                }
                put_u64(payload, OFF_STRING_ID, id);
                payload[OFF_STRING_LEN] = string.len() as u8;
                payload[OFF_STRING_DATA..OFF_STRING_DATA + string.len()].copy_from_slice(string);
            }
            Message::Begin {
                micros,
                category_id,
                tracepoint_id,
            }
            | Message::End {
                micros,
                category_id,
                tracepoint_id,
            } => {
                put_event(payload, micros, category_id, tracepoint_id);
            }
            Message::AsyncBegin {
                micros,
                category_id,
                tracepoint_id,
                cookie,
            }
            | Message::AsyncEnd {
                micros,
                category_id,
                tracepoint_id,
                cookie,
            } => {
                put_event(payload, micros, category_id, tracepoint_id);
                put_u64(payload, OFF_EXTRA, cookie);
            }
            Message::Counter {
                micros,
                category_id,
                tracepoint_id,
                value,
            } => {
                put_event(payload, micros, category_id, tracepoint_id);
                put_u64(payload, OFF_EXTRA, value);
            }
            Message::CounterWithId {
                micros,
                category_id,
                tracepoint_id,
                value,
                id,
            } => {
                put_event(payload, micros, category_id, tracepoint_id);
                put_u64(payload, OFF_EXTRA, value);
                put_u64(payload, OFF_COUNTER_ID, id);
            }
        }
        Ok(needed)
    }
}

/// Clips a string to the longest prefix that fits a RegisterString record,
/// never splitting a UTF-8 sequence.
pub fn clip_string(s: &str) -> &str {
    if s.len() <= MAX_STRING_LEN {
        return s;
    }
    let mut end = MAX_STRING_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Pull parser over the record region of a chunk.
///
/// Iteration ends cleanly on a `NoMessage` tag or when the region is
/// exhausted; an unknown tag or a record that does not fit in the
/// remaining bytes yields one `Err` and then fuses.
pub struct MessageReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> MessageReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        MessageReader {
            buf,
            pos: 0,
            failed: false,
        }
    }

    /// Byte offset of the next unread record.
    pub fn offset(&self) -> usize {
        self.pos
    }

    fn payload(&mut self, kind: &'static str, len: usize) -> Result<&'a [u8]> {
        let start = self.pos + 1;
        if start + len > self.buf.len() {
            return Err(ProtocolError::TruncatedRecord {
                kind,
                offset: self.pos,
            });
        }
        self.pos = start + len;
        Ok(&self.buf[start..start + len])
    }

    fn decode_next(&mut self) -> Option<Result<Message<'a>>> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let tag = self.buf[self.pos];
        let message_type = match MessageType::from_tag(tag) {
            Some(t) => t,
            None => {
                return Some(Err(ProtocolError::UnknownTag {
                    tag,
                    offset: self.pos,
                }))
            }
        };
        let message = match message_type {
            MessageType::NoMessage => return None,
            MessageType::RegisterString => {
                // Fixed part first; the string data length lives inside it.
                let start = self.pos;
                let fixed = match self.payload("RegisterString", STRING_FIXED_PAYLOAD) {
                    Ok(p) => p,
                    Err(e) => return Some(Err(e)),
                };
                let id = read_u64(fixed, OFF_STRING_ID);
                let len = fixed[OFF_STRING_LEN] as usize;
                if self.pos + len > self.buf.len() {
                    return Some(Err(ProtocolError::TruncatedRecord {
                        kind: "RegisterString",
                        offset: start,
                    }));
                }
                let string = &self.buf[self.pos..self.pos + len];
                self.pos += len;
                Message::RegisterString { id, string }
            }
            MessageType::Begin | MessageType::End => {
                let kind = if message_type == MessageType::Begin {
                    "Begin"
                } else {
                    "End"
                };
                let p = match self.payload(kind, EVENT_PAYLOAD) {
                    Ok(p) => p,
                    Err(e) => return Some(Err(e)),
                };
                let (micros, category_id, tracepoint_id) = read_event(p);
                if message_type == MessageType::Begin {
                    Message::Begin {
                        micros,
                        category_id,
                        tracepoint_id,
                    }
                } else {
                    Message::End {
                        micros,
                        category_id,
                        tracepoint_id,
                    }
                }
            }
            MessageType::AsyncBegin | MessageType::AsyncEnd => {
                let kind = if message_type == MessageType::AsyncBegin {
                    "AsyncBegin"
                } else {
                    "AsyncEnd"
                };
                let p = match self.payload(kind, ASYNC_PAYLOAD) {
                    Ok(p) => p,
                    Err(e) => return Some(Err(e)),
                };
                let (micros, category_id, tracepoint_id) = read_event(p);
                let cookie = read_u64(p, OFF_EXTRA);
                if message_type == MessageType::AsyncBegin {
                    Message::AsyncBegin {
                        micros,
                        category_id,
                        tracepoint_id,
                        cookie,
                    }
                } else {
                    Message::AsyncEnd {
                        micros,
                        category_id,
                        tracepoint_id,
                        cookie,
                    }
                }
            }
            MessageType::Counter => {
                let p = match self.payload("Counter", COUNTER_PAYLOAD) {
                    Ok(p) => p,
                    Err(e) => return Some(Err(e)),
                };
                let (micros, category_id, tracepoint_id) = read_event(p);
                Message::Counter {
                    micros,
                    category_id,
                    tracepoint_id,
                    value: read_u64(p, OFF_EXTRA),
                }
            }
            MessageType::CounterWithId => {
                let p = match self.payload("CounterWithId", COUNTER_WITH_ID_PAYLOAD) {
                    Ok(p) => p,
                    Err(e) => return Some(Err(e)),
                };
                let (micros, category_id, tracepoint_id) = read_event(p);
                Message::CounterWithId {
                    micros,
                    category_id,
                    tracepoint_id,
                    value: read_u64(p, OFF_EXTRA),
                    id: read_u64(p, OFF_COUNTER_ID),
                }
            }
        };
        Some(Ok(message))
    }
}

impl<'a> Iterator for MessageReader<'a> {
    type Item = Result<Message<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.decode_next();
        if matches!(item, Some(Err(_))) {
            self.failed = true;
        }
        item
    }
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_event(payload: &mut [u8], micros: u64, category_id: u16, tracepoint_id: u64) {
    put_u64(payload, OFF_MICROS, micros);
    payload[OFF_CATEGORY..OFF_CATEGORY + 2].copy_from_slice(&category_id.to_le_bytes());
    put_u64(payload, OFF_TRACEPOINT, tracepoint_id);
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes(buf[off..off + 2].try_into().unwrap())
}

fn read_event(payload: &[u8]) -> (u64, u16, u64) {
    (
        read_u64(payload, OFF_MICROS),
        read_u16(payload, OFF_CATEGORY),
        read_u64(payload, OFF_TRACEPOINT),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[test]
    fn header_round_trip() {
        let header = ChunkHeader::new(1234, 5678, 1_000_000);
        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), HEADER_SIZE);
        let parsed = ChunkHeader::parse(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn header_rejects_bad_magic() {
        let mut bytes = ChunkHeader::new(1, 2, 3).to_bytes();
        bytes[0] ^= 0xff;
        match ChunkHeader::parse(&bytes) {
            Err(ProtocolError::BadMagic { .. }) => {}
            other => panic!("expected BadMagic, got {:?}", other),
        }
    }

    #[test]
    fn header_rejects_bad_version() {
        let mut bytes = ChunkHeader::new(1, 2, 3).to_bytes();
        bytes[8] = 0xff;
        bytes[9] = 0xff;
        match ChunkHeader::parse(&bytes) {
            Err(ProtocolError::BadVersion { found }) => assert_eq!(found, 0xffff),
            other => panic!("expected BadVersion, got {:?}", other),
        }
    }

    #[test]
    fn header_rejects_short_buffer() {
        let bytes = ChunkHeader::new(1, 2, 3).to_bytes();
        assert_eq!(
            ChunkHeader::parse(&bytes[..HEADER_SIZE - 1]),
            Err(ProtocolError::HeaderTruncated {
                len: HEADER_SIZE - 1
            })
        );
    }

    #[fixture]
    fn all_messages() -> Vec<Message<'static>> {
        vec![
            Message::RegisterString {
                id: 1,
                string: b"app",
            },
            Message::RegisterString { id: 2, string: b"" },
            Message::Begin {
                micros: 10,
                category_id: 1,
                tracepoint_id: 2,
            },
            Message::End {
                micros: 20,
                category_id: 1,
                tracepoint_id: 2,
            },
            Message::AsyncBegin {
                micros: 30,
                category_id: 1,
                tracepoint_id: 3,
                cookie: 0x1234,
            },
            Message::AsyncEnd {
                micros: 40,
                category_id: 1,
                tracepoint_id: 3,
                cookie: 0x1234,
            },
            Message::Counter {
                micros: 50,
                category_id: 1,
                tracepoint_id: 4,
                value: 42,
            },
            Message::CounterWithId {
                micros: 60,
                category_id: 1,
                tracepoint_id: 4,
                value: 43,
                id: 7,
            },
        ]
    }

    #[rstest]
    fn message_round_trip(all_messages: Vec<Message<'static>>) {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut pos = 0;
        for message in &all_messages {
            let written = message.encode(&mut buf[pos..]).unwrap();
            assert_eq!(written, message.encoded_len());
            pos += written;
        }

        let decoded: Vec<_> = MessageReader::new(&buf[..pos])
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(decoded, all_messages);
    }

    #[rstest]
    #[case::begin(Message::Begin { micros: 0, category_id: 0, tracepoint_id: 0 }, 25)]
    #[case::end(Message::End { micros: 0, category_id: 0, tracepoint_id: 0 }, 25)]
    #[case::async_begin(Message::AsyncBegin { micros: 0, category_id: 0, tracepoint_id: 0, cookie: 0 }, 33)]
    #[case::counter(Message::Counter { micros: 0, category_id: 0, tracepoint_id: 0, value: 0 }, 33)]
    #[case::counter_with_id(Message::CounterWithId { micros: 0, category_id: 0, tracepoint_id: 0, value: 0, id: 0 }, 41)]
    #[case::register(Message::RegisterString { id: 0, string: b"abcd" }, 14)]
    fn encoded_sizes(#[case] message: Message<'static>, #[case] expected: usize) {
        assert_eq!(message.encoded_len(), expected);
    }

    #[test]
    fn reader_stops_at_terminator() {
        let mut buf = vec![0u8; 128];
        let begin = Message::Begin {
            micros: 1,
            category_id: 2,
            tracepoint_id: 3,
        };
        let n = begin.encode(&mut buf).unwrap();
        // Everything after buf[n] is zero, i.e. a NoMessage terminator.
        let decoded: Vec<_> = MessageReader::new(&buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(decoded, vec![begin]);
        assert!(n < buf.len());
    }

    #[test]
    fn reader_stops_at_exact_end() {
        let mut buf = vec![0u8; 25];
        Message::Begin {
            micros: 1,
            category_id: 2,
            tracepoint_id: 3,
        }
        .encode(&mut buf)
        .unwrap();
        let decoded: Vec<_> = MessageReader::new(&buf)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(decoded.len(), 1);
    }

    #[test]
    fn reader_reports_unknown_tag() {
        let buf = [200u8, 0, 0];
        let mut reader = MessageReader::new(&buf);
        match reader.next() {
            Some(Err(ProtocolError::UnknownTag { tag: 200, offset: 0 })) => {}
            other => panic!("expected UnknownTag, got {:?}", other),
        }
        assert!(reader.next().is_none(), "reader must fuse after an error");
    }

    #[test]
    fn reader_reports_truncated_record() {
        let mut buf = vec![0u8; 33];
        Message::Counter {
            micros: 1,
            category_id: 2,
            tracepoint_id: 3,
            value: 4,
        }
        .encode(&mut buf)
        .unwrap();
        let mut reader = MessageReader::new(&buf[..20]);
        match reader.next() {
            Some(Err(ProtocolError::TruncatedRecord {
                kind: "Counter",
                offset: 0,
            })) => {}
            other => panic!("expected TruncatedRecord, got {:?}", other),
        }
    }

    #[test]
    fn reader_reports_truncated_string_data() {
        let mut buf = vec![0u8; 64];
        let n = Message::RegisterString {
            id: 9,
            string: b"hello world",
        }
        .encode(&mut buf)
        .unwrap();
        let mut reader = MessageReader::new(&buf[..n - 3]);
        match reader.next() {
            Some(Err(ProtocolError::TruncatedRecord {
                kind: "RegisterString",
                ..
            })) => {}
            other => panic!("expected TruncatedRecord, got {:?}", other),
        }
    }

    #[test]
    fn encode_rejects_small_buffer() {
        let mut buf = [0u8; 10];
        let err = Message::Begin {
            micros: 0,
            category_id: 0,
            tracepoint_id: 0,
        }
        .encode(&mut buf)
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::OutOfSpace {
                needed: 25,
                available: 10
            }
        );
    }

    #[test]
    fn encode_rejects_oversized_string() {
        let long = vec![b'x'; MAX_STRING_LEN + 1];
        let mut buf = vec![0u8; 512];
        let err = Message::RegisterString {
            id: 1,
            string: &long,
        }
        .encode(&mut buf)
        .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::StringTooLong {
                len: MAX_STRING_LEN + 1
            }
        );
    }

    #[test]
    fn clip_string_respects_char_boundaries() {
        assert_eq!(clip_string("short"), "short");

        let ascii = "x".repeat(300);
        assert_eq!(clip_string(&ascii).len(), MAX_STRING_LEN);

        // 2-byte code points; 255 is not a boundary.
        let wide = "é".repeat(150);
        let clipped = clip_string(&wide);
        assert!(clipped.len() <= MAX_STRING_LEN);
        assert_eq!(clipped.len() % 2, 0);
    }

    #[test]
    fn empty_string_round_trips() {
        let mut buf = vec![0u8; 32];
        let n = Message::RegisterString { id: 5, string: b"" }
            .encode(&mut buf)
            .unwrap();
        assert_eq!(n, 10);
        let decoded: Vec<_> = MessageReader::new(&buf[..n])
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(decoded, vec![Message::RegisterString { id: 5, string: b"" }]);
    }
}
