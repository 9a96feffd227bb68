use std::sync::Arc;
use std::time::{Duration, Instant};

use hantas::logging::{self, Logger};
use hantas::DeviceId;
use parking_lot::Mutex;

use crate::comm::frame::{FunctionCode, Wire};
use crate::comm::ingress::TICK_PERIOD;
use crate::comm::link::{self, Link, LinkKind};
use crate::comm::message::{Message, MessageKey, EMPTY_ADDR};
use crate::comm::payload::{ExceptionView, Generation, GraphView, InfoView, RegisterView};
use crate::comm::queue::{EnqueueMode, KeyedQueue};
use crate::comm::shared::{guard, ErrorKind, LinkEvents, NullEvents, Ticker};

/// Largest register block per read request.
pub const MAX_READ_SPLIT: u16 = 125;
/// Largest register block per write request.
pub const MAX_WRITE_SPLIT: u16 = 123;

/// An activated message waits this long for its response.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
/// The handshake must produce an info response within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Idle spacing between keep-alive info probes.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(3);
/// Silence on the link longer than this closes the connection.
const KEEPALIVE_SILENCE: Duration = Duration::from_secs(10);

/// Connection lifecycle of the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// A classified response surfaced to the application, together with the
/// register address of the request it answered (or `EMPTY_ADDR` when the
/// frame was unsolicited or carried no address).
pub struct Response<'a> {
    pub code: FunctionCode,
    pub address: u16,
    pub frame: &'a [u8],
    wire: Wire,
}

impl<'a> Response<'a> {
    pub fn registers(&self) -> Option<RegisterView<'a>> {
        RegisterView::parse(self.wire, self.frame)
    }

    pub fn info(&self) -> Option<InfoView<'a>> {
        InfoView::parse(self.wire, self.frame)
    }

    pub fn exception(&self) -> Option<ExceptionView> {
        ExceptionView::parse(self.wire, self.frame)
    }

    pub fn graph(&self) -> Option<GraphView<'a>> {
        GraphView::parse(self.wire, self.frame)
    }
}

/// Application-facing sinks. Callbacks run on the tick thread that
/// produced them and must not block indefinitely; panics are contained
/// and logged.
pub trait EndpointEvents: Send + Sync {
    fn connection_changed(&self, _connected: bool) {}
    fn received(&self, _response: &Response<'_>) {}
    fn comm_error(&self, _kind: ErrorKind, _param: u16) {}
    fn raw_received(&self, _bytes: &[u8]) {}
    fn raw_transmitted(&self, _bytes: &[u8]) {}
}

struct Lifecycle {
    phase: Phase,
    wire: Wire,
    device: DeviceId,
    generation: Option<Generation>,
    connect_start: Instant,
    last_receive: Instant,
    last_probe: Instant,
    keepalive: bool,
    /// True once `connection_changed(true)` was delivered for this session.
    announced: bool,
}

fn message_key(message: &Message) -> MessageKey {
    message.key()
}

struct Core {
    queue: KeyedQueue<Message, MessageKey, fn(&Message) -> MessageKey>,
    link: Mutex<Option<Box<dyn Link>>>,
    lifecycle: Mutex<Lifecycle>,
    events: Mutex<Option<Arc<dyn EndpointEvents>>>,
    log: Logger,
}

impl Core {
    fn new(link: Option<Box<dyn Link>>, log: Logger) -> Core {
        let now = Instant::now();

        Core {
            queue: KeyedQueue::new(message_key as fn(&Message) -> MessageKey),
            link: Mutex::new(link),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                wire: Wire::Rtu,
                device: 0,
                generation: None,
                connect_start: now,
                last_receive: now,
                last_probe: now,
                keepalive: false,
                announced: false,
            }),
            events: Mutex::new(None),
            log,
        }
    }

    fn events(&self) -> Option<Arc<dyn EndpointEvents>> {
        self.events.lock().clone()
    }

    fn phase(&self) -> Phase {
        self.lifecycle.lock().phase
    }

    fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    /// Starts the transport and enters the handshake. The caller provides
    /// the sink the link reports into (the core itself, as an `Arc`).
    fn begin_connect(
        &self,
        sink: Arc<dyn LinkEvents>,
        target: &str,
        option: u32,
        device: DeviceId,
    ) -> bool {
        match self.phase() {
            Phase::Connecting | Phase::Connected => return false,
            _ => {}
        }

        let wire = {
            let mut slot = self.link.lock();
            let link = match slot.as_mut() {
                Some(link) => link,
                None => return false,
            };

            link.set_events(sink);
            if !link.connect(target, option, device) {
                return false;
            }
            link.wire()
        };

        self.queue.clear();

        let now = Instant::now();
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.phase = Phase::Connecting;
        lifecycle.wire = wire;
        lifecycle.device = device;
        lifecycle.generation = None;
        lifecycle.connect_start = now;
        lifecycle.last_receive = now;
        lifecycle.last_probe = now;
        lifecycle.announced = false;

        logging::info!(self.log, "handshake started"; "target" => %target, "device" => device);
        true
    }

    /// Tears the session down. `close_link` is false when the link itself
    /// reported the disconnect (the call then runs on a link thread and
    /// must not join into it).
    fn shutdown(&self, close_link: bool) {
        let announced = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.phase {
                Phase::Idle | Phase::Closed => return,
                _ => {}
            }

            let announced = lifecycle.announced;
            lifecycle.phase = Phase::Closed;
            lifecycle.device = 0;
            lifecycle.generation = None;
            lifecycle.announced = false;
            announced
        };

        self.queue.clear();

        if close_link {
            let mut slot = self.link.lock();
            if let Some(link) = slot.as_mut() {
                link.close();
                link.set_events(Arc::new(NullEvents));
            }
        }

        logging::info!(self.log, "session closed");
        if announced {
            if let Some(events) = self.events() {
                guard(&self.log, "connection_changed", || events.connection_changed(false));
            }
        }
    }

    /// Enqueues a deduplicated info request; the handshake probe and the
    /// keep-alive probe.
    fn enqueue_info_probe(&self) {
        let packet = match self.link.lock().as_ref() {
            Some(link) => link.encode_read_info(),
            None => return,
        };

        let message = Message::new(FunctionCode::ReadInfo, EMPTY_ADDR, packet);
        self.queue.try_enqueue(message, EnqueueMode::EnforceUnique);
    }

    /// One orchestrator tick: advance the handshake and keep-alive state,
    /// then transmit or retry the head message.
    fn service(&self, now: Instant) {
        enum Action {
            Close,
            Probe,
            None,
        }

        let action = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.phase {
                Phase::Idle | Phase::Closed => return,
                Phase::Connecting => {
                    let waited = now
                        .checked_duration_since(lifecycle.connect_start)
                        .unwrap_or_default();
                    if waited >= CONNECT_TIMEOUT {
                        Action::Close
                    } else {
                        Action::Probe
                    }
                }
                Phase::Connected => {
                    if lifecycle.keepalive {
                        let silence = now
                            .checked_duration_since(lifecycle.last_receive)
                            .unwrap_or_default();
                        if silence >= KEEPALIVE_SILENCE {
                            Action::Close
                        } else if self.queue.is_empty()
                            && now.checked_duration_since(lifecycle.last_probe).unwrap_or_default()
                                >= KEEPALIVE_INTERVAL
                        {
                            lifecycle.last_probe = now;
                            Action::Probe
                        } else {
                            Action::None
                        }
                    } else {
                        Action::None
                    }
                }
            }
        };

        match action {
            Action::Close => {
                logging::warn!(self.log, "link unresponsive, closing");
                self.shutdown(true);
                return;
            }
            Action::Probe => self.enqueue_info_probe(),
            Action::None => {}
        }

        let head = self.queue.with_head(|message| (message.is_activated(), message.is_fire_and_forget()));
        let (activated, fire_and_forget) = match head {
            Some(head) => head,
            None => return,
        };

        if !activated {
            let packet = match self.queue.with_head(|message| message.packet().to_vec()) {
                Some(packet) => packet,
                None => return,
            };

            let sent = match self.link.lock().as_mut() {
                Some(link) => link.write(&packet),
                None => false,
            };

            if !sent {
                logging::debug!(self.log, "transmit failed, head stays queued");
                return;
            }

            if fire_and_forget {
                self.queue.dequeue_if(|message| message.is_fire_and_forget());
            } else {
                self.queue.with_head(|message| message.activate(now));
            }
            return;
        }

        // The check and the dequeue share one critical section so a racing
        // response cannot shift the head underneath the retry bookkeeping.
        let dropped = self.queue.dequeue_if(|message| {
            if !message.is_activated() || message.active_elapsed(now) < RESPONSE_TIMEOUT {
                return false;
            }
            if message.consume_retry() {
                message.deactivate();
                false
            } else {
                true
            }
        });

        if let Some(message) = dropped {
            // Reference behaviour: the drop is silent towards the sink.
            logging::debug!(self.log, "response timed out, message dropped";
                            "code" => ?message.code(), "address" => message.address());
        }
    }

    fn enqueue(&self, messages: Vec<Message>, check: bool) -> bool {
        let mode = if check { EnqueueMode::EnforceUnique } else { EnqueueMode::AllowDuplicate };
        self.queue.try_enqueue_range(messages, mode).accepted > 0
    }

    fn read_registers(
        &self,
        code: FunctionCode,
        address: u16,
        count: u16,
        split: u16,
        check: bool,
    ) -> bool {
        if count == 0 || !self.is_connected() {
            return false;
        }

        let split = u32::from(split.max(1).min(MAX_READ_SPLIT));
        let count = u32::from(count);
        let blocks = (count + split - 1) / split;

        let messages = {
            let slot = self.link.lock();
            let link = match slot.as_ref() {
                Some(link) => link,
                None => return false,
            };

            (0..blocks)
                .map(|index| {
                    let block_addr = (u32::from(address) + index * split) as u16;
                    let block_count =
                        (if index == blocks - 1 { count - index * split } else { split }) as u16;
                    let packet = match code {
                        FunctionCode::ReadInput => link.encode_read_input(block_addr, block_count),
                        _ => link.encode_read_holding(block_addr, block_count),
                    };
                    build_message(code, block_addr, packet, check)
                })
                .collect()
        };

        self.enqueue(messages, check)
    }

    fn write_single(&self, address: u16, value: u16, check: bool) -> bool {
        if !self.is_connected() {
            return false;
        }

        let packet = match self.link.lock().as_ref() {
            Some(link) => link.encode_write_single(address, value),
            None => return false,
        };

        self.enqueue(vec![build_message(FunctionCode::WriteSingle, address, packet, check)], check)
    }

    fn write_multi(&self, address: u16, values: &[u16], check: bool) -> bool {
        if values.is_empty() || !self.is_connected() {
            return false;
        }

        let messages = {
            let slot = self.link.lock();
            let link = match slot.as_ref() {
                Some(link) => link,
                None => return false,
            };

            let mut block_addr = u32::from(address);
            values
                .chunks(MAX_WRITE_SPLIT as usize)
                .map(|block| {
                    let addr = block_addr as u16;
                    block_addr += block.len() as u32;
                    let packet = link.encode_write_multi(addr, block);
                    build_message(FunctionCode::WriteMulti, addr, packet, check)
                })
                .collect()
        };

        self.enqueue(messages, check)
    }

    fn write_string(&self, address: u16, text: &str, length: u8, check: bool) -> bool {
        if length == 0 || !self.is_connected() {
            return false;
        }

        let packet = match self.link.lock().as_ref() {
            Some(link) => link.encode_write_string(address, text, length),
            None => return false,
        };

        self.enqueue(vec![build_message(FunctionCode::WriteMulti, address, packet, check)], check)
    }

    fn read_info(&self, check: bool) -> bool {
        if !self.is_connected() {
            return false;
        }

        let packet = match self.link.lock().as_ref() {
            Some(link) => link.encode_read_info(),
            None => return false,
        };

        self.enqueue(vec![build_message(FunctionCode::ReadInfo, EMPTY_ADDR, packet, check)], check)
    }
}

/// An unchecked request skips de-duplication and correlation both; it is
/// dequeued as soon as the packet leaves the wire.
fn build_message(code: FunctionCode, address: u16, packet: Vec<u8>, check: bool) -> Message {
    if check {
        Message::new(code, address, packet)
    } else {
        Message::fire_and_forget(code, address, packet)
    }
}

impl LinkEvents for Core {
    fn changed_connect(&self, connected: bool) {
        if connected {
            logging::debug!(self.log, "transport up");
            return;
        }
        // The link died underneath the session; it cleans itself up.
        self.shutdown(false);
    }

    fn received_data(&self, code: FunctionCode, frame: &[u8]) {
        let now = Instant::now();
        let mut announce = false;

        let wire = {
            let mut lifecycle = self.lifecycle.lock();
            match lifecycle.phase {
                Phase::Idle | Phase::Closed => return,
                _ => {}
            }

            lifecycle.last_receive = now;

            if lifecycle.phase == Phase::Connecting && code == FunctionCode::ReadInfo {
                if let Some(info) = InfoView::parse(lifecycle.wire, frame) {
                    lifecycle.generation = Some(info.generation());
                    lifecycle.phase = Phase::Connected;
                    lifecycle.last_probe = now;
                    if !lifecycle.announced {
                        lifecycle.announced = true;
                        announce = true;
                    }
                    logging::info!(self.log, "handshake complete"; "generation" => ?info.generation());
                }
            }

            lifecycle.wire
        };

        // FIFO correlation: a matching activated head owns this response.
        let address = match self
            .queue
            .dequeue_if(|message| {
                message.is_activated()
                    && (message.code() == code || code == FunctionCode::Error)
            }) {
            Some(message) => message.address(),
            None => EMPTY_ADDR,
        };

        if let Some(events) = self.events() {
            if announce {
                guard(&self.log, "connection_changed", || events.connection_changed(true));
            }

            if code == FunctionCode::Error {
                if let Some(exception) = ExceptionView::parse(wire, frame) {
                    guard(&self.log, "comm_error", || {
                        events.comm_error(ErrorKind::Exception, u16::from(exception.code()))
                    });
                }
            }

            let response = Response { code, address, frame, wire };
            guard(&self.log, "received", || events.received(&response));
        }
    }

    fn received_error(&self, kind: ErrorKind, param: u16) {
        if let Some(events) = self.events() {
            guard(&self.log, "comm_error", || events.comm_error(kind, param));
        }
    }

    fn received_raw(&self, bytes: &[u8]) {
        if let Some(events) = self.events() {
            guard(&self.log, "raw_received", || events.raw_received(bytes));
        }
    }

    fn transmit_raw(&self, bytes: &[u8]) {
        if let Some(events) = self.events() {
            guard(&self.log, "raw_transmitted", || events.raw_transmitted(bytes));
        }
    }
}

/// The request orchestrator: translates the public operations into queued
/// messages, drives the transport one in-flight message at a time, runs
/// the connect handshake and the keep-alive probe.
pub struct Endpoint {
    core: Arc<Core>,
    ticker: Mutex<Option<Ticker>>,
}

impl Endpoint {
    /// Builds an endpoint over a factory-made transport.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(kind: LinkKind, log: L) -> Endpoint {
        let log = log.into();
        let link = link::create(kind, log);
        Endpoint::with_link(link, log)
    }

    /// Builds an endpoint over a caller-supplied transport.
    pub fn with_link<'a, L: Into<Option<&'a Logger>>>(link: Box<dyn Link>, log: L) -> Endpoint {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("component" => "endpoint")),
            _ => logging::discard(),
        };

        Endpoint {
            core: Arc::new(Core::new(Some(link), log)),
            ticker: Mutex::new(None),
        }
    }

    pub fn set_events(&self, events: Arc<dyn EndpointEvents>) {
        *self.core.events.lock() = Some(events);
    }

    /// Enables or disables the keep-alive probe and silence watchdog.
    pub fn set_keepalive(&self, enabled: bool) {
        let mut lifecycle = self.core.lifecycle.lock();
        lifecycle.keepalive = enabled;
        lifecycle.last_probe = Instant::now();
    }

    pub fn phase(&self) -> Phase {
        self.core.phase()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// Generation learned during the handshake; cleared on close.
    pub fn generation(&self) -> Option<Generation> {
        self.core.lifecycle.lock().generation
    }

    /// Device id fixed at connect; zero without an active session.
    pub fn device(&self) -> DeviceId {
        self.core.lifecycle.lock().device
    }

    /// Number of queued outbound messages.
    pub fn pending(&self) -> usize {
        self.core.queue.len()
    }

    /// Opens the transport and starts the handshake; the session reports
    /// `connection_changed(true)` once the first info response arrives.
    pub fn connect(&self, target: &str, option: u32, device: DeviceId) -> bool {
        let sink = Arc::clone(&self.core) as Arc<dyn LinkEvents>;
        if !self.core.begin_connect(sink, target, option, device) {
            return false;
        }

        let core = Arc::clone(&self.core);
        let mut slot = self.ticker.lock();
        if let Some(mut stale) = slot.take() {
            stale.stop();
        }
        *slot = Some(Ticker::spawn("endpoint-tick", TICK_PERIOD, move |now| core.service(now)));
        true
    }

    /// Closes the session and the transport.
    pub fn close(&self) {
        if let Some(mut ticker) = self.ticker.lock().take() {
            ticker.stop();
        }
        self.core.shutdown(true);
    }

    pub fn read_holding(&self, address: u16, count: u16) -> bool {
        self.read_holding_with(address, count, MAX_READ_SPLIT, true)
    }

    pub fn read_holding_with(&self, address: u16, count: u16, split: u16, check: bool) -> bool {
        self.core.read_registers(FunctionCode::ReadHolding, address, count, split, check)
    }

    pub fn read_input(&self, address: u16, count: u16) -> bool {
        self.read_input_with(address, count, MAX_READ_SPLIT, true)
    }

    pub fn read_input_with(&self, address: u16, count: u16, split: u16, check: bool) -> bool {
        self.core.read_registers(FunctionCode::ReadInput, address, count, split, check)
    }

    pub fn write_single(&self, address: u16, value: u16) -> bool {
        self.write_single_with(address, value, true)
    }

    pub fn write_single_with(&self, address: u16, value: u16, check: bool) -> bool {
        self.core.write_single(address, value, check)
    }

    pub fn write_multi(&self, address: u16, values: &[u16]) -> bool {
        self.write_multi_with(address, values, true)
    }

    pub fn write_multi_with(&self, address: u16, values: &[u16], check: bool) -> bool {
        self.core.write_multi(address, values, check)
    }

    pub fn write_string(&self, address: u16, text: &str, length: u8) -> bool {
        self.write_string_with(address, text, length, true)
    }

    pub fn write_string_with(&self, address: u16, text: &str, length: u8, check: bool) -> bool {
        self.core.write_string(address, text, length, check)
    }

    pub fn read_info(&self) -> bool {
        self.read_info_with(true)
    }

    pub fn read_info_with(&self, check: bool) -> bool {
        self.core.read_info(check)
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
