use byteorder::{BigEndian, WriteBytesExt};
use hantas::DeviceId;
use lazy_static::lazy_static;

use crate::comm::buffer::RingBuffer;

/// Function codes observed on the wire. Exception responses carry the
/// request code with the high bit set; the classifier strips the bit and
/// reports them as `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionCode {
    ReadHolding = 0x03,
    ReadInput = 0x04,
    WriteSingle = 0x06,
    WriteMulti = 0x10,
    ReadInfo = 0x11,
    Graph = 0x14,
    GraphRes = 0x15,
    HighResGraph = 0x16,
    Error = 0x80,
}

/// Marks an exception response on the function byte.
pub const EXCEPTION_FLAG: u8 = 0x80;

impl FunctionCode {
    /// Maps a raw function byte to a known response code.
    pub fn from_wire(byte: u8) -> Option<FunctionCode> {
        match byte {
            0x03 => Some(FunctionCode::ReadHolding),
            0x04 => Some(FunctionCode::ReadInput),
            0x06 => Some(FunctionCode::WriteSingle),
            0x10 => Some(FunctionCode::WriteMulti),
            0x11 => Some(FunctionCode::ReadInfo),
            0x14 => Some(FunctionCode::Graph),
            0x15 => Some(FunctionCode::GraphRes),
            0x16 => Some(FunctionCode::HighResGraph),
            _ => None,
        }
    }

    #[inline]
    pub fn to_wire(self) -> u8 {
        self as u8
    }
}

/// Wire dialect of a link, selecting frame layout and payload offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wire {
    Rtu,
    Mbap,
}

lazy_static! {
    static ref CRC_TABLE: [u16; 256] = crc_table();
}

fn crc_table() -> [u16; 256] {
    let mut table = [0u16; 256];

    for (value, slot) in table.iter_mut().enumerate() {
        let mut crc = value as u16;
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0xA001 } else { crc >> 1 };
        }
        *slot = crc;
    }

    table
}

/// CRC-16/MODBUS: reversed polynomial 0xA001, initial 0xFFFF, no final xor.
/// Emitted on the wire low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFFu16, |crc, &byte| {
        (crc >> 8) ^ CRC_TABLE[((crc ^ u16::from(byte)) & 0xFF) as usize]
    })
}

/// True when the trailing two bytes of `frame` hold the CRC of the rest.
pub fn validate(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }

    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from(tail[0]) | (u16::from(tail[1]) << 8)
}

fn read_payload(address: u16, count: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(address).expect("vec write");
    payload.write_u16::<BigEndian>(count).expect("vec write");
    payload
}

fn write_single_payload(address: u16, value: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4);
    payload.write_u16::<BigEndian>(address).expect("vec write");
    payload.write_u16::<BigEndian>(value).expect("vec write");
    payload
}

fn write_multi_payload(address: u16, values: &[u16]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.write_u16::<BigEndian>(address).expect("vec write");
    payload.write_u16::<BigEndian>(values.len() as u16).expect("vec write");
    payload.push((values.len() * 2) as u8);
    for &value in values {
        payload.write_u16::<BigEndian>(value).expect("vec write");
    }
    payload
}

/// String payload: register count is `length / 2`, the declared length
/// byte follows, then the ASCII bytes right-padded with NUL to `length`.
fn write_string_payload(address: u16, text: &str, length: u8) -> Vec<u8> {
    let length = length as usize;
    let mut payload = Vec::with_capacity(5 + length);
    payload.write_u16::<BigEndian>(address).expect("vec write");
    payload.write_u16::<BigEndian>((length / 2) as u16).expect("vec write");
    payload.push(length as u8);

    let ascii = text.as_bytes();
    let copied = ascii.len().min(length);
    payload.extend_from_slice(&ascii[..copied]);
    payload.resize(5 + length, 0);
    payload
}

/// Builders for the serial dialect: `[device, function, payload, crc]`.
pub mod rtu {
    use super::*;

    fn seal(device: DeviceId, code: FunctionCode, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.push(device);
        frame.push(code.to_wire());
        frame.extend_from_slice(payload);

        let crc = crc16(&frame);
        frame.push((crc & 0xFF) as u8);
        frame.push((crc >> 8) as u8);
        frame
    }

    pub fn read_holding(device: DeviceId, address: u16, count: u16) -> Vec<u8> {
        seal(device, FunctionCode::ReadHolding, &read_payload(address, count))
    }

    pub fn read_input(device: DeviceId, address: u16, count: u16) -> Vec<u8> {
        seal(device, FunctionCode::ReadInput, &read_payload(address, count))
    }

    pub fn write_single(device: DeviceId, address: u16, value: u16) -> Vec<u8> {
        seal(device, FunctionCode::WriteSingle, &write_single_payload(address, value))
    }

    pub fn write_multi(device: DeviceId, address: u16, values: &[u16]) -> Vec<u8> {
        seal(device, FunctionCode::WriteMulti, &write_multi_payload(address, values))
    }

    pub fn write_string(device: DeviceId, address: u16, text: &str, length: u8) -> Vec<u8> {
        seal(device, FunctionCode::WriteMulti, &write_string_payload(address, text, length))
    }

    pub fn read_info(device: DeviceId) -> Vec<u8> {
        seal(device, FunctionCode::ReadInfo, &[])
    }
}

/// Builders for the TCP dialect. The MBAP header rides the device id in
/// the transaction-id field with a zero unit byte, as the tools expect;
/// correlation stays FIFO either way.
pub mod mbap {
    use super::*;

    fn seal(device: DeviceId, code: FunctionCode, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.write_u16::<BigEndian>(u16::from(device)).expect("vec write");
        frame.write_u16::<BigEndian>(0).expect("vec write");
        frame.write_u16::<BigEndian>((payload.len() + 2) as u16).expect("vec write");
        frame.push(0x00);
        frame.push(code.to_wire());
        frame.extend_from_slice(payload);
        frame
    }

    pub fn read_holding(device: DeviceId, address: u16, count: u16) -> Vec<u8> {
        seal(device, FunctionCode::ReadHolding, &read_payload(address, count))
    }

    pub fn read_input(device: DeviceId, address: u16, count: u16) -> Vec<u8> {
        seal(device, FunctionCode::ReadInput, &read_payload(address, count))
    }

    pub fn write_single(device: DeviceId, address: u16, value: u16) -> Vec<u8> {
        seal(device, FunctionCode::WriteSingle, &write_single_payload(address, value))
    }

    pub fn write_multi(device: DeviceId, address: u16, values: &[u16]) -> Vec<u8> {
        seal(device, FunctionCode::WriteMulti, &write_multi_payload(address, values))
    }

    pub fn write_string(device: DeviceId, address: u16, text: &str, length: u8) -> Vec<u8> {
        seal(device, FunctionCode::WriteMulti, &write_string_payload(address, text, length))
    }

    pub fn read_info(device: DeviceId) -> Vec<u8> {
        seal(device, FunctionCode::ReadInfo, &[])
    }
}

/// What the classifier found at the head of the analyze buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classified {
    /// Not enough bytes to decide yet.
    NeedMore,
    /// The leading byte cannot start a frame; drop it and retry.
    Resync,
    /// A frame of `len` bytes starts here.
    Frame { code: FunctionCode, len: usize },
}

/// Exception responses on the serial dialect are a fixed five bytes.
pub const RTU_ERROR_LEN: usize = 5;
/// MBAP header plus the function byte.
pub const MBAP_HEADER_LEN: usize = 8;

/// Determines the next frame in a serial analyze buffer. Responses must
/// open with the expected device id; anything else resyncs one byte at a
/// time. Length bytes are only indexed once they are known to be present.
pub fn classify_rtu(buffer: &RingBuffer, device: DeviceId) -> Classified {
    if buffer.available() < 2 {
        return Classified::NeedMore;
    }
    if buffer.peek(0) != device {
        return Classified::Resync;
    }

    let function = buffer.peek(1);
    if function & EXCEPTION_FLAG != 0 {
        return match FunctionCode::from_wire(function & !EXCEPTION_FLAG) {
            Some(_) => Classified::Frame { code: FunctionCode::Error, len: RTU_ERROR_LEN },
            None => Classified::Resync,
        };
    }

    let code = match FunctionCode::from_wire(function) {
        Some(code) => code,
        None => return Classified::Resync,
    };

    match code {
        FunctionCode::ReadHolding | FunctionCode::ReadInput | FunctionCode::ReadInfo => {
            if buffer.available() < 3 {
                Classified::NeedMore
            } else {
                Classified::Frame { code, len: buffer.peek(2) as usize + 5 }
            }
        }
        FunctionCode::WriteSingle | FunctionCode::WriteMulti => {
            Classified::Frame { code, len: 8 }
        }
        FunctionCode::Graph | FunctionCode::GraphRes => {
            if buffer.available() < 4 {
                Classified::NeedMore
            } else {
                let data_len = (buffer.peek(2) as usize) << 8 | buffer.peek(3) as usize;
                Classified::Frame { code, len: data_len + 6 }
            }
        }
        // High-resolution graphs only exist on the Ethernet dialect.
        FunctionCode::HighResGraph | FunctionCode::Error => Classified::Resync,
    }
}

/// Determines the next frame in a TCP analyze buffer, trusting the MBAP
/// length field for the frame size.
pub fn classify_mbap(buffer: &RingBuffer) -> Classified {
    if buffer.available() < MBAP_HEADER_LEN {
        return Classified::NeedMore;
    }

    let declared = (buffer.peek(4) as usize) << 8 | buffer.peek(5) as usize;
    if declared < 2 {
        return Classified::Resync;
    }
    let len = declared + 6;

    let function = buffer.peek(7);
    if function & EXCEPTION_FLAG != 0 {
        return match FunctionCode::from_wire(function & !EXCEPTION_FLAG) {
            Some(_) => Classified::Frame { code: FunctionCode::Error, len },
            None => Classified::Resync,
        };
    }

    match FunctionCode::from_wire(function) {
        Some(code) => Classified::Frame { code, len },
        None => Classified::Resync,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn staged(bytes: &[u8]) -> RingBuffer {
        let mut buffer = RingBuffer::new(256);
        buffer.write_bytes(bytes);
        buffer
    }

    #[test]
    fn test_read_holding_rtu_reference_bytes() {
        let frame = rtu::read_holding(0x01, 0x0000, 0x000A);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x0A, 0xC5, 0xCD]);
    }

    #[test]
    fn test_read_info_mbap_reference_bytes() {
        let frame = mbap::read_info(0x01);
        assert_eq!(frame, vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x00, 0x11]);
    }

    #[test]
    fn test_crc_validates_roundtrip() {
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);

        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            let len = rng.gen_range(1..64);
            let mut frame: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            let crc = crc16(&frame);
            frame.push((crc & 0xFF) as u8);
            frame.push((crc >> 8) as u8);
            assert!(validate(&frame));

            // Flipping any single bit must break validation.
            let byte = rng.gen_range(0..frame.len());
            let bit = rng.gen_range(0..8);
            frame[byte] ^= 1 << bit;
            assert!(!validate(&frame));
        }
    }

    #[test]
    fn test_write_single_layout() {
        let frame = rtu::write_single(0x01, 0x2000, 0x1234);
        assert_eq!(&frame[..6], &[0x01, 0x06, 0x20, 0x00, 0x12, 0x34]);
        assert_eq!(frame.len(), 8);
        assert!(validate(&frame));

        let frame = mbap::write_single(0x02, 0x2000, 0x1234);
        assert_eq!(
            frame,
            vec![0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x00, 0x06, 0x20, 0x00, 0x12, 0x34]
        );
    }

    #[test]
    fn test_write_multi_layout() {
        let frame = rtu::write_multi(0x01, 0x0100, &[0x0A0B, 0x0C0D]);
        assert_eq!(
            &frame[..frame.len() - 2],
            &[0x01, 0x10, 0x01, 0x00, 0x00, 0x02, 0x04, 0x0A, 0x0B, 0x0C, 0x0D]
        );
        assert!(validate(&frame));
    }

    #[test]
    fn test_write_string_pads_with_nul() {
        let frame = rtu::write_string(0x01, 0x0300, "AB", 6);
        // addr, count = length/2, length byte, ascii, padding
        assert_eq!(
            &frame[2..frame.len() - 2],
            &[0x03, 0x00, 0x00, 0x03, 0x06, b'A', b'B', 0x00, 0x00, 0x00, 0x00]
        );
        assert!(validate(&frame));

        // Longer text is truncated to the declared length.
        let frame = rtu::write_string(0x01, 0x0300, "ABCDEFGH", 4);
        assert_eq!(&frame[7..frame.len() - 2], b"ABCD");
    }

    #[test]
    fn test_write_single_echo_classifies_to_itself() {
        let built = rtu::write_single(0x01, 0x0001, 0x00FF);
        let buffer = staged(&built);

        match classify_rtu(&buffer, 0x01) {
            Classified::Frame { code, len } => {
                assert_eq!(code, FunctionCode::WriteSingle);
                assert_eq!(len, built.len());
            }
            other => panic!("unexpected classification {:?}", other),
        }
    }

    #[test]
    fn test_classify_read_response() {
        let buffer = staged(&[0x01, 0x03, 0x04, 0x00, 0x11, 0x00, 0x22, 0x6A, 0x2C]);

        assert_eq!(
            classify_rtu(&buffer, 0x01),
            Classified::Frame { code: FunctionCode::ReadHolding, len: 9 }
        );
    }

    #[test]
    fn test_classify_exception_response() {
        let buffer = staged(&[0x01, 0x83, 0x02, 0xC0, 0xF1]);

        assert_eq!(
            classify_rtu(&buffer, 0x01),
            Classified::Frame { code: FunctionCode::Error, len: RTU_ERROR_LEN }
        );
    }

    #[test]
    fn test_classify_waits_for_length_byte() {
        let buffer = staged(&[0x01, 0x03]);
        assert_eq!(classify_rtu(&buffer, 0x01), Classified::NeedMore);

        let buffer = staged(&[0x01, 0x14, 0x00]);
        assert_eq!(classify_rtu(&buffer, 0x01), Classified::NeedMore);
    }

    #[test]
    fn test_classify_resyncs_on_foreign_bytes() {
        // Wrong device id.
        let buffer = staged(&[0x02, 0x03, 0x04]);
        assert_eq!(classify_rtu(&buffer, 0x01), Classified::Resync);

        // Unknown function code.
        let buffer = staged(&[0x01, 0x55, 0x00]);
        assert_eq!(classify_rtu(&buffer, 0x01), Classified::Resync);

        // Unknown base code behind the exception flag.
        let buffer = staged(&[0x01, 0xD5, 0x00]);
        assert_eq!(classify_rtu(&buffer, 0x01), Classified::Resync);
    }

    #[test]
    fn test_classify_graph_length() {
        let buffer = staged(&[0x01, 0x14, 0x01, 0x02, 0x00]);
        assert_eq!(
            classify_rtu(&buffer, 0x01),
            Classified::Frame { code: FunctionCode::Graph, len: 0x0102 + 6 }
        );
    }

    #[test]
    fn test_classify_mbap_uses_length_field() {
        let buffer = staged(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x00, 0x03, 0x02, 0x00, 0x11]);
        assert_eq!(
            classify_mbap(&buffer),
            Classified::Frame { code: FunctionCode::ReadHolding, len: 11 }
        );

        // Exception frame: high bit set, nine bytes total.
        let buffer = staged(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00, 0x83, 0x02]);
        assert_eq!(
            classify_mbap(&buffer),
            Classified::Frame { code: FunctionCode::Error, len: 9 }
        );

        let buffer = staged(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x00]);
        assert_eq!(classify_mbap(&buffer), Classified::NeedMore);

        // Nonsense length resyncs instead of stalling.
        let buffer = staged(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x03]);
        assert_eq!(classify_mbap(&buffer), Classified::Resync);
    }

    #[test]
    fn test_high_res_graph_mbap_only() {
        let buffer = staged(&[0x01, 0x16, 0x00, 0x04]);
        assert_eq!(classify_rtu(&buffer, 0x01), Classified::Resync);

        let buffer = staged(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x00, 0x16, 0x00, 0x02, 0xAA, 0xBB]);
        assert_eq!(
            classify_mbap(&buffer),
            Classified::Frame { code: FunctionCode::HighResGraph, len: 12 }
        );
    }
}
