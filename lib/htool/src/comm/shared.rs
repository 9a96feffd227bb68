use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hantas::logging::{self, Logger};

use crate::comm::frame::FunctionCode;

/// Communication faults surfaced to the application through the error sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A frame failed CRC validation and was discarded.
    InvalidCrc,
    /// A partial frame aged out; the parameter carries the cleared length.
    Timeout,
    /// The device answered with an exception response; the parameter
    /// carries the exception code.
    Exception,
    ConnectFailed,
    WriteFailed,
    /// A queued message exhausted its retry budget.
    MessageTimeout,
}

/// Observer sinks fired by a transport. Implementations must not block
/// indefinitely; events are delivered from the transport's own threads.
pub trait LinkEvents: Send + Sync {
    fn changed_connect(&self, _connected: bool) {}
    fn received_data(&self, _code: FunctionCode, _frame: &[u8]) {}
    fn received_error(&self, _kind: ErrorKind, _param: u16) {}
    fn received_raw(&self, _bytes: &[u8]) {}
    fn transmit_raw(&self, _bytes: &[u8]) {}
}

/// Sink that drops every event.
pub struct NullEvents;

impl LinkEvents for NullEvents {}

/// Invokes a user callback, containing panics so they cannot corrupt
/// engine state. The failure is logged and ingestion continues.
pub fn guard<F: FnOnce()>(log: &Logger, context: &'static str, callback: F) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        logging::error!(log, "event callback panicked"; "context" => context);
    }
}

/// A periodic tick thread. The closure runs once per period with the
/// current instant until the ticker is stopped or dropped.
pub struct Ticker {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    pub fn spawn<F>(name: &str, period: Duration, mut tick: F) -> Ticker
    where
        F: FnMut(Instant) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);

        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                while !flag.load(Ordering::Acquire) {
                    tick(Instant::now());
                    thread::sleep(period);
                }
            })
            .expect("tick thread must spawn");

        Ticker { stop, handle: Some(handle) }
    }

    /// Stops the thread and waits for the in-flight tick to finish. Must
    /// not be called from the tick closure itself.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
