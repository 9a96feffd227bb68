use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use hantas::logging::{self, Logger};
use hantas::{valid_device_id, DeviceId};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};

use crate::comm::frame::{self, Wire};
use crate::comm::ingress::{Dialect, Ingress, TICK_PERIOD};
use crate::comm::link::Link;
use crate::comm::shared::{ErrorKind, LinkEvents, NullEvents, Ticker};

/// Baud rates accepted by HANTAS serial tools.
pub const BAUD_RATES: [u32; 6] = [9600, 19200, 38400, 57600, 115200, 230400];

/// Reader poll timeout; keeps the thread responsive to shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Names of serial ports present on the host.
pub fn available_ports() -> Vec<String> {
    serialport::available_ports()
        .map(|ports| ports.into_iter().map(|port| port.port_name).collect())
        .unwrap_or_default()
}

/// MODBUS-RTU transport over a serial port: 8N1, no flow control, bytes
/// passed through untranslated. A dedicated reader thread stages chunks;
/// the pump ticker classifies them.
pub struct SerialLink {
    port: Option<Box<dyn SerialPort>>,
    ingress: Option<Arc<Ingress>>,
    reader: Option<thread::JoinHandle<()>>,
    ticker: Option<Ticker>,
    stop: Arc<AtomicBool>,
    events: Arc<dyn LinkEvents>,
    device: DeviceId,
    log: Logger,
}

impl SerialLink {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> SerialLink {
        let log = match log.into() {
            Some(log) => log.new(logging::o!("link" => "serial")),
            _ => logging::discard(),
        };

        SerialLink {
            port: None,
            ingress: None,
            reader: None,
            ticker: None,
            stop: Arc::new(AtomicBool::new(false)),
            events: Arc::new(NullEvents),
            device: 0,
            log,
        }
    }
}

fn run_reader(mut port: Box<dyn SerialPort>, ingress: Arc<Ingress>, stop: Arc<AtomicBool>, log: Logger) {
    while !stop.load(Ordering::Acquire) {
        let mut buffer = ingress.take_buffer();

        match port.read(&mut buffer[..]) {
            Ok(0) => ingress.return_buffer(buffer),
            Ok(len) => ingress.commit(buffer, len),
            Err(ref err)
                if err.kind() == io::ErrorKind::TimedOut
                    || err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                ingress.return_buffer(buffer)
            }
            Err(err) => {
                // The port stays open; transient faults are retried.
                ingress.return_buffer(buffer);
                logging::warn!(log, "serial read failed"; "error" => ?err);
                thread::sleep(READ_TIMEOUT);
            }
        }
    }
}

impl Link for SerialLink {
    fn connect(&mut self, target: &str, option: u32, device: DeviceId) -> bool {
        if self.is_connected() {
            return false;
        }
        if target.is_empty() || !BAUD_RATES.contains(&option) || !valid_device_id(device) {
            return false;
        }

        let port = serialport::new(target, option)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open();

        let port = match port {
            Ok(port) => port,
            Err(err) => {
                logging::warn!(self.log, "serial open failed"; "port" => %target, "error" => ?err);
                self.events.received_error(ErrorKind::ConnectFailed, 0);
                return false;
            }
        };

        let reader_port = match port.try_clone() {
            Ok(clone) => clone,
            Err(err) => {
                logging::warn!(self.log, "serial clone failed"; "error" => ?err);
                return false;
            }
        };

        let ingress = Arc::new(Ingress::new(Dialect::Rtu { device }, &self.log));
        ingress.set_events(Arc::clone(&self.events));

        self.stop = Arc::new(AtomicBool::new(false));
        let stop = Arc::clone(&self.stop);
        let reader_ingress = Arc::clone(&ingress);
        let reader_log = self.log.new(logging::o!("thread" => "serial-reader"));

        let reader = thread::Builder::new()
            .name("serial-reader".to_owned())
            .spawn(move || run_reader(reader_port, reader_ingress, stop, reader_log));

        let reader = match reader {
            Ok(reader) => reader,
            Err(err) => {
                logging::warn!(self.log, "reader spawn failed"; "error" => ?err);
                return false;
            }
        };

        let pump_ingress = Arc::clone(&ingress);
        let ticker = Ticker::spawn("serial-pump", TICK_PERIOD, move |now| pump_ingress.pump(now));

        self.device = device;
        self.port = Some(port);
        self.ingress = Some(ingress);
        self.reader = Some(reader);
        self.ticker = Some(ticker);

        logging::info!(self.log, "serial link opened"; "port" => %target, "baud" => option, "device" => device);
        self.events.changed_connect(true);
        true
    }

    fn close(&mut self) {
        if self.port.is_none() && self.reader.is_none() {
            return;
        }

        self.stop.store(true, Ordering::Release);
        if let Some(mut ticker) = self.ticker.take() {
            ticker.stop();
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(ingress) = self.ingress.take() {
            ingress.reset();
        }
        self.port = None;
        self.device = 0;

        logging::info!(self.log, "serial link closed");
        self.events.changed_connect(false);
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn write(&mut self, packet: &[u8]) -> bool {
        let port = match self.port.as_mut() {
            Some(port) => port,
            None => return false,
        };

        match port.write_all(packet).and_then(|_| port.flush()) {
            Ok(()) => {
                self.events.transmit_raw(packet);
                true
            }
            Err(err) => {
                logging::warn!(self.log, "serial write failed"; "error" => ?err);
                self.events.received_error(ErrorKind::WriteFailed, 0);
                false
            }
        }
    }

    fn set_events(&mut self, events: Arc<dyn LinkEvents>) {
        self.events = Arc::clone(&events);
        if let Some(ingress) = self.ingress.as_ref() {
            ingress.set_events(events);
        }
    }

    fn wire(&self) -> Wire {
        Wire::Rtu
    }

    fn encode_read_holding(&self, address: u16, count: u16) -> Vec<u8> {
        frame::rtu::read_holding(self.device, address, count)
    }

    fn encode_read_input(&self, address: u16, count: u16) -> Vec<u8> {
        frame::rtu::read_input(self.device, address, count)
    }

    fn encode_write_single(&self, address: u16, value: u16) -> Vec<u8> {
        frame::rtu::write_single(self.device, address, value)
    }

    fn encode_write_multi(&self, address: u16, values: &[u16]) -> Vec<u8> {
        frame::rtu::write_multi(self.device, address, values)
    }

    fn encode_write_string(&self, address: u16, text: &str, length: u8) -> Vec<u8> {
        frame::rtu::write_string(self.device, address, text, length)
    }

    fn encode_read_info(&self) -> Vec<u8> {
        frame::rtu::read_info(self.device)
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_rejects_invalid_parameters() {
        let mut link = SerialLink::new(None);

        assert!(!link.connect("", 115200, 1));
        assert!(!link.connect("/dev/ttyUSB0", 12345, 1));
        assert!(!link.connect("/dev/ttyUSB0", 115200, 0x10));
        assert!(!link.is_connected());
    }

    #[test]
    fn test_write_refused_when_closed() {
        let mut link = SerialLink::new(None);
        assert!(!link.write(&[0x01, 0x02]));
    }

    #[test]
    fn test_builders_use_connected_device_id() {
        let link = SerialLink::new(None);
        // Unconnected links encode for device zero; the orchestrator only
        // encodes after a successful connect.
        assert_eq!(link.encode_read_info()[0], 0x00);
        assert_eq!(link.wire(), Wire::Rtu);
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut link = SerialLink::new(None);
        link.close();
        link.close();
    }
}
