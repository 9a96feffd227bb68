use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use hantas::logging::{self, Logger};
use hantas::DeviceId;
use parking_lot::Mutex;

use crate::comm::buffer::RingBuffer;
use crate::comm::frame::{self, Classified, FunctionCode};
use crate::comm::shared::{guard, ErrorKind, LinkEvents};

/// Tick period shared by the transport pumps and the orchestrator.
pub const TICK_PERIOD: Duration = Duration::from_millis(50);
/// Bounded wait for the analyze monitor before a tick yields.
const ANALYZE_LOCK_TIMEOUT: Duration = Duration::from_millis(200);
/// A partial frame older than this is dropped and reported.
const FRAME_TIMEOUT: Duration = Duration::from_millis(500);
/// Analyze ring capacity; overflow here indicates a stalled consumer.
const ANALYZE_CAPACITY: usize = 16 * 1024;
/// Size of the pooled reader chunks.
pub const CHUNK_SIZE: usize = 4096;
/// Spare chunks retained between reads.
const POOL_LIMIT: usize = 8;

/// Wire dialect driving frame classification.
#[derive(Debug, Clone, Copy)]
pub enum Dialect {
    Rtu { device: DeviceId },
    Mbap,
}

struct Analyze {
    buffer: RingBuffer,
    last_change: Instant,
}

enum Emission {
    Data(FunctionCode, Vec<u8>),
    Error(ErrorKind, u16),
}

/// The staged ingest pipeline shared by every transport. An I/O thread
/// commits raw chunks; the tick thread drains them into the analyze ring
/// and classifies complete frames. Chunk buffers are pooled and return to
/// the pool on the drain path and on shutdown.
pub struct Ingress {
    dialect: Dialect,
    chunks: Mutex<VecDeque<(Vec<u8>, usize)>>,
    pool: Mutex<Vec<Vec<u8>>>,
    analyze: Mutex<Analyze>,
    events: Mutex<Option<Arc<dyn LinkEvents>>>,
    log: Logger,
}

impl Ingress {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(dialect: Dialect, log: L) -> Ingress {
        let log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        Ingress {
            dialect,
            chunks: Mutex::new(VecDeque::new()),
            pool: Mutex::new(Vec::new()),
            analyze: Mutex::new(Analyze {
                buffer: RingBuffer::new(ANALYZE_CAPACITY),
                last_change: Instant::now(),
            }),
            events: Mutex::new(None),
            log,
        }
    }

    pub fn set_events(&self, events: Arc<dyn LinkEvents>) {
        *self.events.lock() = Some(events);
    }

    fn events(&self) -> Option<Arc<dyn LinkEvents>> {
        self.events.lock().clone()
    }

    /// Borrows a pooled chunk for the reader thread.
    pub fn take_buffer(&self) -> Vec<u8> {
        self.pool.lock().pop().unwrap_or_else(|| vec![0u8; CHUNK_SIZE])
    }

    /// Returns an unused chunk to the pool.
    pub fn return_buffer(&self, buffer: Vec<u8>) {
        let mut pool = self.pool.lock();
        if pool.len() < POOL_LIMIT {
            pool.push(buffer);
        }
    }

    /// Stages `len` bytes read into a borrowed chunk and publishes the raw
    /// copy to any observer.
    pub fn commit(&self, buffer: Vec<u8>, len: usize) {
        if let Some(events) = self.events() {
            guard(&self.log, "received_raw", || events.received_raw(&buffer[..len]));
        }

        self.chunks.lock().push_back((buffer, len));
    }

    /// Stages a plain byte slice, chunking it through the pool.
    pub fn offer(&self, bytes: &[u8]) {
        for piece in bytes.chunks(CHUNK_SIZE) {
            let mut buffer = self.take_buffer();
            buffer[..piece.len()].copy_from_slice(piece);
            self.commit(buffer, piece.len());
        }
    }

    /// One tick: drain staged chunks into the analyze ring, age out stale
    /// partial frames, classify and emit everything complete. Events are
    /// delivered after the analyze monitor is released.
    pub fn pump(&self, now: Instant) {
        let mut analyze = match self.analyze.try_lock_for(ANALYZE_LOCK_TIMEOUT) {
            Some(analyze) => analyze,
            None => return,
        };

        let mut emissions: Vec<Emission> = Vec::new();

        let mut drained = false;
        loop {
            let chunk = self.chunks.lock().pop_front();
            match chunk {
                Some((buffer, len)) => {
                    if !analyze.buffer.write_bytes(&buffer[..len]) {
                        logging::warn!(self.log, "chunk exceeds analyze capacity, dropped"; "len" => len);
                    }
                    self.return_buffer(buffer);
                    drained = true;
                }
                None => break,
            }
        }
        if drained {
            analyze.last_change = now;
        }

        if !analyze.buffer.is_empty()
            && now.checked_duration_since(analyze.last_change).unwrap_or_default() > FRAME_TIMEOUT
        {
            let cleared = analyze.buffer.available();
            analyze.buffer.clear();
            analyze.last_change = now;
            emissions.push(Emission::Error(ErrorKind::Timeout, cleared as u16));
        }

        loop {
            let next = match self.dialect {
                Dialect::Rtu { device } => frame::classify_rtu(&analyze.buffer, device),
                Dialect::Mbap => frame::classify_mbap(&analyze.buffer),
            };

            match next {
                Classified::NeedMore => break,
                Classified::Resync => {
                    analyze.buffer.remove_bytes(1);
                    analyze.last_change = now;
                }
                Classified::Frame { code, len } => {
                    if analyze.buffer.available() < len {
                        break;
                    }

                    let bytes = analyze.buffer.read_bytes(len);
                    analyze.last_change = now;

                    let valid = match self.dialect {
                        Dialect::Rtu { .. } => frame::validate(&bytes),
                        Dialect::Mbap => true,
                    };

                    if valid {
                        emissions.push(Emission::Data(code, bytes));
                    } else {
                        emissions.push(Emission::Error(ErrorKind::InvalidCrc, 0));
                    }
                }
            }
        }

        drop(analyze);

        if let Some(events) = self.events() {
            for emission in emissions {
                match emission {
                    Emission::Data(code, bytes) => {
                        guard(&self.log, "received_data", || events.received_data(code, &bytes));
                    }
                    Emission::Error(kind, param) => {
                        guard(&self.log, "received_error", || events.received_error(kind, param));
                    }
                }
            }
        }
    }

    /// Drops all staged data and recycles borrowed chunks; the shutdown
    /// path of the owning transport.
    pub fn reset(&self) {
        loop {
            let chunk = self.chunks.lock().pop_front();
            match chunk {
                Some((buffer, _)) => self.return_buffer(buffer),
                None => break,
            }
        }

        if let Some(mut analyze) = self.analyze.try_lock_for(ANALYZE_LOCK_TIMEOUT) {
            analyze.buffer.clear();
        }
    }

    /// Number of bytes awaiting classification. Test and diagnostics hook.
    pub fn pending(&self) -> usize {
        self.analyze
            .try_lock_for(ANALYZE_LOCK_TIMEOUT)
            .map(|analyze| analyze.buffer.available())
            .unwrap_or(0)
    }
}
