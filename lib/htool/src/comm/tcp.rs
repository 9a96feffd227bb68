use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hantas::logging::{self, Logger};
use hantas::{valid_device_id, DeviceId};
use socket2::{SockRef, TcpKeepalive};

use crate::comm::frame::{self, Wire};
use crate::comm::ingress::{Dialect, Ingress, TICK_PERIOD};
use crate::comm::link::Link;
use crate::comm::shared::{ErrorKind, LinkEvents, NullEvents, Ticker};

/// Default command port on HANTAS controllers.
pub const DEFAULT_PORT: u16 = 5000;
/// MODBUS-standard port, also accepted by newer tools.
pub const MODBUS_PORT: u16 = 502;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Reader poll timeout; keeps the thread responsive to shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(50);
const KEEPALIVE_TIME: Duration = Duration::from_secs(5);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const KEEPALIVE_RETRIES: u32 = 5;

/// Fixed monitor handshake: enables state reporting on the monitor socket.
pub const MONITOR_ACK: [u8; 12] =
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x06, 0x0F, 0xB0, 0x00, 0x01];
/// Fixed monitor handshake: enables graph streaming on the monitor socket.
pub const MONITOR_GRAPH_ACK: [u8; 12] =
    [0x00, 0x00, 0x00, 0x00, 0x00, 0x06, 0x00, 0x06, 0x0F, 0xBA, 0x00, 0x01];

fn parse_target(target: &str, option: u32) -> Option<SocketAddr> {
    let ip: Ipv4Addr = target.parse().ok()?;

    if option == 0 || option > u32::from(u16::max_value()) {
        return None;
    }
    Some(SocketAddr::from((ip, option as u16)))
}

/// One socket with its reader thread and pump ticker. Shared by the plain
/// MODBUS-TCP link and both halves of the legacy dual-socket link.
struct Conn {
    stream: TcpStream,
    ingress: Arc<Ingress>,
    reader: Option<thread::JoinHandle<()>>,
    ticker: Ticker,
    stop: Arc<AtomicBool>,
}

impl Conn {
    fn open(
        addr: SocketAddr,
        events: Arc<dyn LinkEvents>,
        notify_disconnect: bool,
        log: &Logger,
        label: &'static str,
    ) -> io::Result<Conn> {
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL)
            .with_retries(KEEPALIVE_RETRIES);
        SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TIMEOUT))?;

        let ingress = Arc::new(Ingress::new(Dialect::Mbap, log));
        ingress.set_events(Arc::clone(&events));

        let stop = Arc::new(AtomicBool::new(false));
        let reader_stream = stream.try_clone()?;
        let reader_ingress = Arc::clone(&ingress);
        let reader_stop = Arc::clone(&stop);
        let reader_log = log.new(logging::o!("thread" => label));

        let reader = thread::Builder::new().name(label.to_owned()).spawn(move || {
            run_reader(reader_stream, reader_ingress, reader_stop, events, notify_disconnect, reader_log)
        })?;

        let pump_ingress = Arc::clone(&ingress);
        let ticker = Ticker::spawn(label, TICK_PERIOD, move |now| pump_ingress.pump(now));

        Ok(Conn { stream, ingress, reader: Some(reader), ticker, stop })
    }

    fn is_alive(&self) -> bool {
        !self.stop.load(Ordering::Acquire)
    }

    fn write(&mut self, packet: &[u8]) -> io::Result<()> {
        self.stream.write_all(packet)
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.stream.shutdown(Shutdown::Both);
        self.ticker.stop();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        self.ingress.reset();
    }
}

fn run_reader(
    mut stream: TcpStream,
    ingress: Arc<Ingress>,
    stop: Arc<AtomicBool>,
    events: Arc<dyn LinkEvents>,
    notify_disconnect: bool,
    log: Logger,
) {
    while !stop.load(Ordering::Acquire) {
        let mut buffer = ingress.take_buffer();

        match stream.read(&mut buffer[..]) {
            Ok(0) => {
                // Orderly shutdown by the peer.
                ingress.return_buffer(buffer);
                if !stop.swap(true, Ordering::AcqRel) {
                    logging::info!(log, "peer closed the connection");
                    if notify_disconnect {
                        events.changed_connect(false);
                    }
                }
                return;
            }
            Ok(len) => ingress.commit(buffer, len),
            Err(ref err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                ingress.return_buffer(buffer)
            }
            Err(err) => {
                ingress.return_buffer(buffer);
                if !stop.swap(true, Ordering::AcqRel) {
                    logging::warn!(log, "tcp read failed"; "error" => ?err);
                    if notify_disconnect {
                        events.changed_connect(false);
                    }
                }
                return;
            }
        }
    }
}

/// MODBUS-TCP transport over a single client socket with TCP keep-alive.
/// Reads run on a dedicated blocking thread so response delivery keeps the
/// wire order.
pub struct TcpLink {
    conn: Option<Conn>,
    events: Arc<dyn LinkEvents>,
    device: DeviceId,
    log: Logger,
}

impl TcpLink {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> TcpLink {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("link" => "tcp")),
            _ => logging::discard(),
        };

        TcpLink { conn: None, events: Arc::new(NullEvents), device: 0, log }
    }
}

impl Link for TcpLink {
    fn connect(&mut self, target: &str, option: u32, device: DeviceId) -> bool {
        if self.conn.is_some() {
            return false;
        }
        if !valid_device_id(device) {
            return false;
        }
        let addr = match parse_target(target, option) {
            Some(addr) => addr,
            None => return false,
        };

        match Conn::open(addr, Arc::clone(&self.events), true, &self.log, "tcp-reader") {
            Ok(conn) => {
                self.device = device;
                self.conn = Some(conn);
                logging::info!(self.log, "tcp link opened"; "addr" => %addr, "device" => device);
                self.events.changed_connect(true);
                true
            }
            Err(err) => {
                logging::warn!(self.log, "tcp connect failed"; "addr" => %addr, "error" => ?err);
                self.events.received_error(ErrorKind::ConnectFailed, 0);
                false
            }
        }
    }

    fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            let was_alive = conn.is_alive();
            conn.shutdown();
            self.device = 0;
            logging::info!(self.log, "tcp link closed");
            if was_alive {
                self.events.changed_connect(false);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.conn.as_ref().map(Conn::is_alive).unwrap_or(false)
    }

    fn write(&mut self, packet: &[u8]) -> bool {
        let conn = match self.conn.as_mut() {
            Some(conn) if conn.is_alive() => conn,
            _ => return false,
        };

        match conn.write(packet) {
            Ok(()) => {
                self.events.transmit_raw(packet);
                true
            }
            Err(err) => {
                logging::warn!(self.log, "tcp write failed"; "error" => ?err);
                self.events.received_error(ErrorKind::WriteFailed, 0);
                false
            }
        }
    }

    fn set_events(&mut self, events: Arc<dyn LinkEvents>) {
        self.events = Arc::clone(&events);
        if let Some(conn) = self.conn.as_ref() {
            conn.ingress.set_events(events);
        }
    }

    fn wire(&self) -> Wire {
        Wire::Mbap
    }

    fn encode_read_holding(&self, address: u16, count: u16) -> Vec<u8> {
        frame::mbap::read_holding(self.device, address, count)
    }

    fn encode_read_input(&self, address: u16, count: u16) -> Vec<u8> {
        frame::mbap::read_input(self.device, address, count)
    }

    fn encode_write_single(&self, address: u16, value: u16) -> Vec<u8> {
        frame::mbap::write_single(self.device, address, value)
    }

    fn encode_write_multi(&self, address: u16, values: &[u16]) -> Vec<u8> {
        frame::mbap::write_multi(self.device, address, values)
    }

    fn encode_write_string(&self, address: u16, text: &str, length: u8) -> Vec<u8> {
        frame::mbap::write_string(self.device, address, text, length)
    }

    fn encode_read_info(&self) -> Vec<u8> {
        frame::mbap::read_info(self.device)
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Legacy dual-socket Ethernet transport: requests and responses ride the
/// command socket at `port`; graph samples stream in on the monitor socket
/// at `port + 1` once the two fixed acknowledgements are sent.
pub struct LegacyLink {
    command: Option<Conn>,
    monitor: Option<Conn>,
    events: Arc<dyn LinkEvents>,
    device: DeviceId,
    log: Logger,
}

impl LegacyLink {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> LegacyLink {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("link" => "legacy")),
            _ => logging::discard(),
        };

        LegacyLink { command: None, monitor: None, events: Arc::new(NullEvents), device: 0, log }
    }
}

impl Link for LegacyLink {
    fn connect(&mut self, target: &str, option: u32, device: DeviceId) -> bool {
        if self.command.is_some() {
            return false;
        }
        if !valid_device_id(device) {
            return false;
        }
        // The monitor port must fit next to the command port.
        let command_addr = match parse_target(target, option) {
            Some(addr) if option < u32::from(u16::max_value()) => addr,
            _ => return false,
        };
        let monitor_addr = SocketAddr::from((
            match target.parse::<Ipv4Addr>() {
                Ok(ip) => ip,
                Err(_) => return false,
            },
            (option + 1) as u16,
        ));

        let mut command =
            match Conn::open(command_addr, Arc::clone(&self.events), true, &self.log, "legacy-cmd") {
                Ok(conn) => conn,
                Err(err) => {
                    logging::warn!(self.log, "command connect failed"; "addr" => %command_addr, "error" => ?err);
                    self.events.received_error(ErrorKind::ConnectFailed, 0);
                    return false;
                }
            };

        let mut monitor =
            match Conn::open(monitor_addr, Arc::clone(&self.events), false, &self.log, "legacy-mon") {
                Ok(conn) => conn,
                Err(err) => {
                    logging::warn!(self.log, "monitor connect failed"; "addr" => %monitor_addr, "error" => ?err);
                    command.shutdown();
                    self.events.received_error(ErrorKind::ConnectFailed, 0);
                    return false;
                }
            };

        // Announce ourselves to the monitor port before anything streams.
        if monitor.write(&MONITOR_ACK).and_then(|_| monitor.write(&MONITOR_GRAPH_ACK)).is_err() {
            logging::warn!(self.log, "monitor handshake failed");
            monitor.shutdown();
            command.shutdown();
            self.events.received_error(ErrorKind::ConnectFailed, 0);
            return false;
        }

        self.device = device;
        self.command = Some(command);
        self.monitor = Some(monitor);
        logging::info!(self.log, "legacy link opened"; "command" => %command_addr, "monitor" => %monitor_addr);
        self.events.changed_connect(true);
        true
    }

    fn close(&mut self) {
        let mut was_alive = false;

        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown();
        }
        if let Some(mut command) = self.command.take() {
            was_alive = command.is_alive();
            command.shutdown();
            self.device = 0;
            logging::info!(self.log, "legacy link closed");
        }

        if was_alive {
            self.events.changed_connect(false);
        }
    }

    fn is_connected(&self) -> bool {
        self.command.as_ref().map(Conn::is_alive).unwrap_or(false)
    }

    fn write(&mut self, packet: &[u8]) -> bool {
        let command = match self.command.as_mut() {
            Some(conn) if conn.is_alive() => conn,
            _ => return false,
        };

        match command.write(packet) {
            Ok(()) => {
                self.events.transmit_raw(packet);
                true
            }
            Err(err) => {
                logging::warn!(self.log, "command write failed"; "error" => ?err);
                self.events.received_error(ErrorKind::WriteFailed, 0);
                false
            }
        }
    }

    fn set_events(&mut self, events: Arc<dyn LinkEvents>) {
        self.events = Arc::clone(&events);
        if let Some(conn) = self.command.as_ref() {
            conn.ingress.set_events(Arc::clone(&events));
        }
        if let Some(conn) = self.monitor.as_ref() {
            conn.ingress.set_events(events);
        }
    }

    fn wire(&self) -> Wire {
        Wire::Mbap
    }

    fn encode_read_holding(&self, address: u16, count: u16) -> Vec<u8> {
        frame::mbap::read_holding(self.device, address, count)
    }

    fn encode_read_input(&self, address: u16, count: u16) -> Vec<u8> {
        frame::mbap::read_input(self.device, address, count)
    }

    fn encode_write_single(&self, address: u16, value: u16) -> Vec<u8> {
        frame::mbap::write_single(self.device, address, value)
    }

    fn encode_write_multi(&self, address: u16, values: &[u16]) -> Vec<u8> {
        frame::mbap::write_multi(self.device, address, values)
    }

    fn encode_write_string(&self, address: u16, text: &str, length: u8) -> Vec<u8> {
        frame::mbap::write_string(self.device, address, text, length)
    }

    fn encode_read_info(&self) -> Vec<u8> {
        frame::mbap::read_info(self.device)
    }
}

impl Drop for LegacyLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::frame::FunctionCode;
    use parking_lot::Mutex as PlMutex;
    use std::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        data: PlMutex<Vec<(FunctionCode, Vec<u8>)>>,
        connects: PlMutex<Vec<bool>>,
        transmitted: PlMutex<Vec<Vec<u8>>>,
    }

    impl LinkEvents for Recorder {
        fn changed_connect(&self, connected: bool) {
            self.connects.lock().push(connected);
        }

        fn received_data(&self, code: FunctionCode, frame: &[u8]) {
            self.data.lock().push((code, frame.to_vec()));
        }

        fn transmit_raw(&self, bytes: &[u8]) {
            self.transmitted.lock().push(bytes.to_vec());
        }
    }

    fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
        for _ in 0..100 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_connect_rejects_invalid_parameters() {
        let mut link = TcpLink::new(None);

        assert!(!link.connect("not-an-ip", 5000, 1));
        assert!(!link.connect("192.168.0.10", 0, 1));
        assert!(!link.connect("192.168.0.10", 70000, 1));
        assert!(!link.connect("192.168.0.10", 5000, 0x10));
        assert!(!link.is_connected());
        assert!(!link.write(&[0x00]));
    }

    #[test]
    fn test_tcp_request_response_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        // A minimal device: echo a fixed read response to the first request.
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut request = vec![0u8; 12];
            socket.read_exact(&mut request).unwrap();

            let response =
                [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x00, 0x03, 0x02, 0x00, 0x2A];
            socket.write_all(&response).unwrap();
            request
        });

        let recorder = Arc::new(Recorder::default());
        let mut link = TcpLink::new(None);
        link.set_events(Arc::clone(&recorder) as Arc<dyn LinkEvents>);

        assert!(link.connect("127.0.0.1", u32::from(port), 1));
        assert!(link.is_connected());

        let request = link.encode_read_holding(0x0000, 0x0001);
        assert_eq!(request.len(), 12);
        assert!(link.write(&request));

        assert!(wait_for(|| !recorder.data.lock().is_empty()));
        {
            let data = recorder.data.lock();
            assert_eq!(data[0].0, FunctionCode::ReadHolding);
            assert_eq!(data[0].1[8], 0x02);
        }
        assert_eq!(recorder.transmitted.lock().len(), 1);

        assert_eq!(server.join().unwrap(), request);
        link.close();
        assert_eq!(recorder.connects.lock().as_slice(), &[true, false]);
    }

    #[test]
    fn test_peer_disconnect_reported_once() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = thread::spawn(move || {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        });

        let recorder = Arc::new(Recorder::default());
        let mut link = TcpLink::new(None);
        link.set_events(Arc::clone(&recorder) as Arc<dyn LinkEvents>);

        assert!(link.connect("127.0.0.1", u32::from(port), 1));
        server.join().unwrap();

        assert!(wait_for(|| !link.is_connected()));
        link.close();
        assert_eq!(recorder.connects.lock().as_slice(), &[true, false]);
    }

    #[test]
    fn test_legacy_link_sends_monitor_acks() {
        // The legacy link needs two adjacent ports; retry until a pair binds.
        let mut pair = None;
        for _ in 0..16 {
            let command = TcpListener::bind("127.0.0.1:0").unwrap();
            let port = command.local_addr().unwrap().port();
            if port == u16::max_value() {
                continue;
            }
            if let Ok(monitor) = TcpListener::bind(("127.0.0.1", port + 1)) {
                pair = Some((command, monitor, port));
                break;
            }
        }
        let (command, monitor, port) = pair.expect("no adjacent port pair available");

        let command_server = thread::spawn(move || {
            let (socket, _) = command.accept().unwrap();
            thread::sleep(Duration::from_millis(200));
            drop(socket);
        });
        let monitor_server = thread::spawn(move || {
            let (mut socket, _) = monitor.accept().unwrap();
            let mut acks = vec![0u8; 24];
            socket.read_exact(&mut acks).unwrap();
            acks
        });

        let recorder = Arc::new(Recorder::default());
        let mut link = LegacyLink::new(None);
        link.set_events(Arc::clone(&recorder) as Arc<dyn LinkEvents>);

        assert!(link.connect("127.0.0.1", u32::from(port), 1));
        assert_eq!(link.wire(), Wire::Mbap);

        let mut expected = MONITOR_ACK.to_vec();
        expected.extend_from_slice(&MONITOR_GRAPH_ACK);
        assert_eq!(monitor_server.join().unwrap(), expected);

        link.close();
        command_server.join().unwrap();
        assert_eq!(recorder.connects.lock().as_slice(), &[true, false]);
    }
}
