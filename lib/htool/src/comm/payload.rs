//! Minimal response views. Full device-facing decoders (event records,
//! calibration blocks, settings) live outside the engine; these views cover
//! what the orchestrator and a typical caller need to act on a frame.

use std::io::Cursor;

use byteorder::{BigEndian, ReadBytesExt};

use crate::comm::frame::Wire;

/// Coarse protocol generation of a connected tool, learned from the info
/// response during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Generation {
    Gen1,
    Gen1Ad,
    Gen1Plus,
    Gen2,
}

/// Model code reported by AD-series drivers.
pub const MODEL_AD: u16 = 2;

/// Firmware floors (exclusive) separating the protocol generations.
const GEN2_FIRMWARE: u16 = 2000;
const GEN1_PLUS_FIRMWARE: u16 = 1600;
const GEN1_AD_FIRMWARE: u16 = 1000;

impl Generation {
    /// Ordered derivation from the info response fields.
    pub fn derive(model: u16, firmware: u16) -> Generation {
        if firmware > GEN2_FIRMWARE {
            Generation::Gen2
        } else if firmware > GEN1_PLUS_FIRMWARE {
            Generation::Gen1Plus
        } else if firmware > GEN1_AD_FIRMWARE && model == MODEL_AD {
            Generation::Gen1Ad
        } else {
            Generation::Gen1
        }
    }
}

/// Slices the counted data region of a read-style response.
fn data_region(wire: Wire, frame: &[u8]) -> Option<&[u8]> {
    match wire {
        Wire::Rtu => {
            let count = *frame.get(2)? as usize;
            frame.get(3..3 + count)
        }
        Wire::Mbap => {
            let count = *frame.get(8)? as usize;
            frame.get(9..9 + count)
        }
    }
}

/// Register values of a ReadHolding/ReadInput response.
pub struct RegisterView<'a> {
    data: &'a [u8],
}

impl<'a> RegisterView<'a> {
    pub fn parse(wire: Wire, frame: &'a [u8]) -> Option<RegisterView<'a>> {
        let data = data_region(wire, frame)?;
        if data.len() % 2 != 0 {
            return None;
        }
        Some(RegisterView { data })
    }

    /// Number of 16-bit registers in the response.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() / 2
    }

    pub fn value(&self, index: usize) -> Option<u16> {
        let offset = index * 2;
        let bytes = self.data.get(offset..offset + 2)?;
        Some(u16::from(bytes[0]) << 8 | u16::from(bytes[1]))
    }

    pub fn values(&self) -> Vec<u16> {
        let mut cursor = Cursor::new(self.data);
        let mut values = Vec::with_capacity(self.len());
        while let Ok(value) = cursor.read_u16::<BigEndian>() {
            values.push(value);
        }
        values
    }
}

/// Identity block of a ReadInfo response: model, firmware, then the
/// device-specific remainder (serial, calibration tag, ...).
pub struct InfoView<'a> {
    data: &'a [u8],
}

impl<'a> InfoView<'a> {
    pub fn parse(wire: Wire, frame: &'a [u8]) -> Option<InfoView<'a>> {
        let data = data_region(wire, frame)?;
        if data.len() < 4 {
            return None;
        }
        Some(InfoView { data })
    }

    #[inline]
    pub fn model(&self) -> u16 {
        u16::from(self.data[0]) << 8 | u16::from(self.data[1])
    }

    #[inline]
    pub fn firmware(&self) -> u16 {
        u16::from(self.data[2]) << 8 | u16::from(self.data[3])
    }

    /// Bytes past the identity header.
    #[inline]
    pub fn tail(&self) -> &'a [u8] {
        &self.data[4..]
    }

    #[inline]
    pub fn generation(&self) -> Generation {
        Generation::derive(self.model(), self.firmware())
    }
}

/// Exception code of an error response.
pub struct ExceptionView {
    code: u8,
}

impl ExceptionView {
    pub fn parse(wire: Wire, frame: &[u8]) -> Option<ExceptionView> {
        let code = match wire {
            Wire::Rtu => *frame.get(2)?,
            Wire::Mbap => *frame.get(8)?,
        };
        Some(ExceptionView { code })
    }

    #[inline]
    pub fn code(&self) -> u8 {
        self.code
    }
}

/// Raw sample region of a graph or high-resolution graph frame. Sample
/// decoding is generation specific and happens outside the engine.
pub struct GraphView<'a> {
    samples: &'a [u8],
}

impl<'a> GraphView<'a> {
    pub fn parse(wire: Wire, frame: &'a [u8]) -> Option<GraphView<'a>> {
        let samples = match wire {
            Wire::Rtu => {
                let len = (*frame.get(2)? as usize) << 8 | *frame.get(3)? as usize;
                frame.get(4..4 + len)?
            }
            Wire::Mbap => {
                let len = (*frame.get(8)? as usize) << 8 | *frame.get(9)? as usize;
                frame.get(10..10 + len)?
            }
        };
        Some(GraphView { samples })
    }

    #[inline]
    pub fn samples(&self) -> &'a [u8] {
        self.samples
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.samples.len()
    }
}
