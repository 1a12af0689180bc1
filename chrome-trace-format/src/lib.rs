//! Types for the subset of the Chrome Trace Event Format emitted by the
//! collector: duration begin/end pairs, counters, and nestable async
//! begin/end events, serialised into the JSON Object Format's
//! `traceEvents` array.
//!
//! Field order on the structs matches the order the trace viewer's
//! documentation lists them in, so serialised objects read naturally in
//! the output document. All timestamps are microseconds.

use bon::Builder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event phase tokens. Only the phases the collector produces are
/// represented; the wire tags of the transport map 1:1 onto these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Begin of a duration slice. Paired with a following [`Phase::DurationEnd`].
    #[serde(rename = "B")]
    DurationBegin,
    /// End of a duration slice.
    #[serde(rename = "E")]
    DurationEnd,
    /// Counter sample; `args` carries one series per key.
    #[serde(rename = "C")]
    Counter,
    /// Begin of a nestable async operation.
    #[serde(rename = "b")]
    AsyncBegin,
    /// End of a nestable async operation.
    #[serde(rename = "e")]
    AsyncEnd,
}

/// A single trace event, deserialised by phase shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TraceEvent {
    Duration(DurationEvent),
    Async(AsyncEvent),
    Counter(CounterEvent),
}

/// Duration begin/end slice on one thread of one process.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct DurationEvent {
    pub pid: u64,
    pub tid: u64,
    /// Timestamp in microseconds.
    pub ts: u64,
    /// [`Phase::DurationBegin`] or [`Phase::DurationEnd`].
    pub ph: Phase,
    /// Category the tracepoint belongs to.
    pub cat: String,
    /// Tracepoint name shown in the viewer.
    pub name: String,
}

/// Counter sample. Counters are process-scoped, so no thread id.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct CounterEvent {
    pub pid: u64,
    pub ts: u64,
    /// Always [`Phase::Counter`].
    pub ph: Phase,
    pub cat: String,
    pub name: String,
    /// Distinguishes multiple counters sharing a name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    /// One series per key; the collector emits `{name: value}`.
    pub args: Value,
}

/// Async begin/end event. The id groups begin and end across threads;
/// it is rendered as a hex string (`"0x1234"`) like a pointer-derived
/// cookie would be.
#[derive(Debug, Clone, Serialize, Deserialize, Builder)]
pub struct AsyncEvent {
    pub pid: u64,
    pub ts: u64,
    /// [`Phase::AsyncBegin`] or [`Phase::AsyncEnd`].
    pub ph: Phase,
    pub cat: String,
    pub name: String,
    pub id: String,
    pub args: Value,
}

/// Formats an async cookie the way the trace viewer expects ids that
/// originate from pointers.
pub fn async_id(cookie: u64) -> String {
    format!("{:#x}", cookie)
}
