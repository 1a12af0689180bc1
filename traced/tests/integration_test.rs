use chrome_trace_format::TraceEvent;
use protocol::Message;
use serde_json::{json, Value};
use serial_test::serial;
use shmchunk::WriterChunk;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::{tempdir, TempDir};
use traced::Collector;

struct RunningCollector {
    shutdown: Arc<AtomicBool>,
    handle: thread::JoinHandle<Collector<Vec<u8>>>,
    _dir: TempDir,
    socket_path: std::path::PathBuf,
}

impl RunningCollector {
    fn start() -> Self {
        let dir = tempdir().unwrap();
        let socket_path = dir.path().join("traced.sock");
        let mut collector = Collector::new(&socket_path, Vec::new()).unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = shutdown.clone();
        let handle = thread::spawn(move || {
            collector.run(&flag).unwrap();
            collector
        });

        RunningCollector {
            shutdown,
            handle,
            _dir: dir,
            socket_path,
        }
    }

    /// Gives the collector time to drain, stops it, and returns the parsed
    /// trace events.
    fn stop(self) -> Vec<TraceEvent> {
        thread::sleep(Duration::from_millis(800));
        self.shutdown.store(true, Ordering::SeqCst);
        let collector = self.handle.join().unwrap();
        let bytes = collector.finish().unwrap();

        let document: Value = serde_json::from_slice(&bytes).unwrap();
        serde_json::from_value(document["traceEvents"].clone()).unwrap()
    }
}

fn cat(event: &TraceEvent) -> &str {
    match event {
        TraceEvent::Duration(e) => &e.cat,
        TraceEvent::Async(e) => &e.cat,
        TraceEvent::Counter(e) => &e.cat,
    }
}

fn name(event: &TraceEvent) -> &str {
    match event {
        TraceEvent::Duration(e) => &e.name,
        TraceEvent::Async(e) => &e.name,
        TraceEvent::Counter(e) => &e.name,
    }
}

fn ts(event: &TraceEvent) -> u64 {
    match event {
        TraceEvent::Duration(e) => e.ts,
        TraceEvent::Async(e) => e.ts,
        TraceEvent::Counter(e) => e.ts,
    }
}

// The tracer library holds process-global state behind a Once, so every
// scenario that needs a live client runs through this single test.
#[test]
#[serial]
fn client_scenarios_end_to_end() {
    let collector = RunningCollector::start();

    tracer::init_with_socket(&collector.socket_path);
    assert!(tracer::should_trace("app"));

    // Plain pair, then a nested pair.
    tracer::duration_begin("app", "main");
    tracer::duration_end("app", "main");
    tracer::duration_begin("app", "outer");
    tracer::duration_begin("app", "inner");
    tracer::duration_end("app", "inner");
    tracer::duration_end("app", "outer");

    tracer::counter("app", "freeBuffers", 5);

    tracer::async_begin("app", "req", 0x1234);
    tracer::async_end("app", "req", 0x1234);

    // Enough distinct tracepoints to force at least one rotation.
    let loop_names: Vec<&'static str> = (0..200)
        .map(|i| &*Box::leak(format!("tp-{:03}", i).into_boxed_str()))
        .collect();
    for &tracepoint in &loop_names {
        tracer::duration_begin("loop", tracepoint);
        tracer::duration_end("loop", tracepoint);
    }

    tracer::deinit();

    let events = collector.stop();

    let app_events: Vec<_> = events.iter().filter(|e| cat(e) == "app").collect();
    let shapes: Vec<(&str, &str)> = app_events
        .iter()
        .map(|e| match e {
            TraceEvent::Duration(d) => (
                match d.ph {
                    chrome_trace_format::Phase::DurationBegin => "B",
                    chrome_trace_format::Phase::DurationEnd => "E",
                    _ => panic!("unexpected duration phase"),
                },
                d.name.as_str(),
            ),
            TraceEvent::Async(a) => (
                match a.ph {
                    chrome_trace_format::Phase::AsyncBegin => "b",
                    chrome_trace_format::Phase::AsyncEnd => "e",
                    _ => panic!("unexpected async phase"),
                },
                a.name.as_str(),
            ),
            TraceEvent::Counter(c) => ("C", c.name.as_str()),
        })
        .collect();
    assert_eq!(
        shapes,
        vec![
            ("B", "main"),
            ("E", "main"),
            ("B", "outer"),
            ("B", "inner"),
            ("E", "inner"),
            ("E", "outer"),
            ("C", "freeBuffers"),
            ("b", "req"),
            ("e", "req"),
        ]
    );

    let pid = std::process::id() as u64;
    for event in &app_events {
        match event {
            TraceEvent::Duration(e) => assert_eq!(e.pid, pid),
            TraceEvent::Async(e) => assert_eq!(e.pid, pid),
            TraceEvent::Counter(e) => assert_eq!(e.pid, pid),
        }
    }

    // All duration events came from the one emitting thread.
    let tids: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TraceEvent::Duration(d) => Some(d.tid),
            _ => None,
        })
        .collect();
    assert!(tids.windows(2).all(|w| w[0] == w[1]));

    match app_events[6] {
        TraceEvent::Counter(counter) => {
            assert_eq!(counter.args, json!({"freeBuffers": 5}));
            assert_eq!(counter.id, None);
        }
        other => panic!("expected counter event, got {:?}", other),
    }
    match (app_events[7], app_events[8]) {
        (TraceEvent::Async(begin), TraceEvent::Async(end)) => {
            assert_eq!(begin.id, "0x1234");
            assert_eq!(end.id, "0x1234");
            assert_eq!(begin.args, json!({}));
            assert_eq!(end.args, json!({}));
        }
        other => panic!("expected async events, got {:?}", other),
    }

    // Rotation lost nothing: every loop tracepoint shows up as a B/E pair
    // with its registered name, in emission order.
    let loop_shapes: Vec<(&str, &str)> = events
        .iter()
        .filter(|e| cat(e) == "loop")
        .map(|e| match e {
            TraceEvent::Duration(d) => (
                match d.ph {
                    chrome_trace_format::Phase::DurationBegin => "B",
                    _ => "E",
                },
                d.name.as_str(),
            ),
            other => panic!("unexpected loop event {:?}", other),
        })
        .collect();
    let mut expected = Vec::new();
    for tracepoint in &loop_names {
        expected.push(("B", *tracepoint));
        expected.push(("E", *tracepoint));
    }
    assert_eq!(loop_shapes, expected);

    // Per-thread timestamps never go backwards.
    let stamps: Vec<_> = events.iter().map(ts).collect();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    assert_eq!(events.len(), 9 + 400);
    assert!(events.iter().all(|e| !name(e).is_empty()));
}

fn fill_chunk(chunk: &mut WriterChunk, messages: &[Message<'_>]) {
    for message in messages {
        let buf = chunk.reserve(message.encoded_len()).unwrap();
        message.encode(buf).unwrap();
    }
}

// Scenario: a valid chunk, then a header-only chunk, then another valid
// chunk from the same client. The empty chunk must neither kill the
// client nor poison its string table.
#[test]
#[serial]
fn header_only_chunk_keeps_client_alive() {
    let collector = RunningCollector::start();

    let mut first = WriterChunk::create(60_000, 11, 22, 1_000).unwrap();
    fill_chunk(
        &mut first,
        &[
            Message::RegisterString {
                id: 1,
                string: b"app",
            },
            Message::RegisterString {
                id: 2,
                string: b"main",
            },
            Message::Begin {
                micros: 5,
                category_id: 1,
                tracepoint_id: 2,
            },
            Message::End {
                micros: 9,
                category_id: 1,
                tracepoint_id: 2,
            },
        ],
    );
    let first = first.seal();

    let second = WriterChunk::create(60_001, 11, 22, 1_000).unwrap().seal();

    let mut third = WriterChunk::create(60_002, 11, 22, 1_000).unwrap();
    fill_chunk(
        &mut third,
        &[Message::Counter {
            micros: 20,
            category_id: 1,
            tracepoint_id: 2,
            value: 3,
        }],
    );
    let third = third.seal();

    let mut stream = UnixStream::connect(&collector.socket_path).unwrap();
    write!(stream, "{}\n{}\n{}\n", first, second, third).unwrap();

    let events = collector.stop();
    assert_eq!(events.len(), 3);

    match (&events[0], &events[1]) {
        (TraceEvent::Duration(begin), TraceEvent::Duration(end)) => {
            assert_eq!((begin.pid, begin.tid), (11, 22));
            assert_eq!(begin.ts, 1_005);
            assert_eq!(end.ts, 1_009);
            assert_eq!(begin.name, "main");
        }
        other => panic!("expected duration events, got {:?}", other),
    }

    // The counter in the third chunk resolves ids registered in the first.
    match &events[2] {
        TraceEvent::Counter(counter) => {
            assert_eq!(counter.cat, "app");
            assert_eq!(counter.args, json!({"main": 3}));
        }
        other => panic!("expected counter event, got {:?}", other),
    }
}
