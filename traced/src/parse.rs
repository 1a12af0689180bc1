use chrome_trace_format::{async_id, AsyncEvent, CounterEvent, DurationEvent, Phase};
use protocol::{ChunkHeader, Message, MessageReader, HEADER_SIZE};
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use tracing::{debug, warn};

use crate::sink::TraceSink;
use crate::Result;

/// Decodes one announced chunk and streams its events to the sink.
///
/// The header must validate or the whole chunk is rejected. A malformed
/// record (unknown tag, truncation) stops the chunk at that point but
/// keeps the events decoded before it; the client connection is unaffected
/// either way. Returns the number of events emitted.
pub fn parse_chunk<W: Write>(
    bytes: &[u8],
    strings: &mut HashMap<u64, String>,
    sink: &mut TraceSink<W>,
) -> Result<u64> {
    let header = ChunkHeader::parse(bytes)?;
    let epoch = header.epoch_micros;
    let mut emitted = 0;

    for message in MessageReader::new(&bytes[HEADER_SIZE..]) {
        let message = match message {
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "stopping malformed chunk");
                break;
            }
        };
        match message {
            Message::RegisterString { id, string } => {
                let string = String::from_utf8_lossy(string).into_owned();
                debug!(id, string = %string, "registered string");
                strings.insert(id, string);
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
                let ph = if matches!(message, Message::Begin { .. }) {
                    Phase::DurationBegin
                } else {
                    Phase::DurationEnd
                };
                let event = DurationEvent::builder()
                    .pid(header.pid)
                    .tid(header.tid)
                    .ts(epoch + micros)
                    .ph(ph)
                    .cat(resolve(strings, category_id as u64))
                    .name(resolve(strings, tracepoint_id))
                    .build();
                sink.emit(&event)?;
                emitted += 1;
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
                let ph = if matches!(message, Message::AsyncBegin { .. }) {
                    Phase::AsyncBegin
                } else {
                    Phase::AsyncEnd
                };
                let event = AsyncEvent::builder()
                    .pid(header.pid)
                    .ts(epoch + micros)
                    .ph(ph)
                    .cat(resolve(strings, category_id as u64))
                    .name(resolve(strings, tracepoint_id))
                    .id(async_id(cookie))
                    .args(json!({}))
                    .build();
                sink.emit(&event)?;
                emitted += 1;
            }
            Message::Counter {
                micros,
                category_id,
                tracepoint_id,
                value,
            } => {
                let name = resolve(strings, tracepoint_id);
                let event = CounterEvent::builder()
                    .pid(header.pid)
                    .ts(epoch + micros)
                    .ph(Phase::Counter)
                    .cat(resolve(strings, category_id as u64))
                    .name(name.clone())
                    .args(json!({ name: value }))
                    .build();
                sink.emit(&event)?;
                emitted += 1;
            }
            Message::CounterWithId {
                micros,
                category_id,
                tracepoint_id,
                value,
                id,
            } => {
                let name = resolve(strings, tracepoint_id);
                let event = CounterEvent::builder()
                    .pid(header.pid)
                    .ts(epoch + micros)
                    .ph(Phase::Counter)
                    .cat(resolve(strings, category_id as u64))
                    .name(name.clone())
                    .id(id)
                    .args(json!({ name: value }))
                    .build();
                sink.emit(&event)?;
                emitted += 1;
            }
        }
    }

    Ok(emitted)
}

/// A dangling id is not fatal; the event is still worth keeping.
fn resolve(strings: &HashMap<u64, String>, id: u64) -> String {
    strings.get(&id).cloned().unwrap_or_else(|| "?".to_string())
}
