//! Example client exercising every tracer entry point.
//!
//! Start the collector first (`traced -o trace.json`), then run this and
//! load the resulting document in a Chrome-style trace viewer.

use std::thread;
use std::time::Duration;

fn busy(millis: u64) {
    thread::sleep(Duration::from_millis(millis));
}

fn main() {
    tracer::init();
    if !tracer::should_trace("demo") {
        eprintln!("collector unreachable, nothing will be recorded");
    }

    let mut startup = tracer::duration_scope("demo", "startup");
    busy(5);
    startup.reset("demo", "load-config");
    busy(3);
    drop(startup);

    tracer::async_begin("demo", "request", 0x1);
    for i in 0..10 {
        let _work = tracer::duration_scope("demo", "work-item");
        tracer::counter("demo", "itemsQueued", 10 - i);
        busy(2);
    }
    tracer::async_end("demo", "request", 0x1);

    let worker = thread::spawn(|| {
        let _scope = tracer::duration_scope("demo", "worker");
        busy(8);
    });
    worker.join().unwrap();

    tracer::deinit();
}
