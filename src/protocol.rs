//! Corner-node bus protocol.
//!
//! Every corner node owns a contiguous block of identifiers starting at its
//! base (`0x100`, `0x120`, `0x140`, `0x160`); the message type is the offset
//! inside the block. Frames carry at most eight payload bytes, multi-byte
//! fields are little endian, and temperatures travel as `i16` in tenths of a
//! unit.
//!
//! | Offset | Message       | Bytes |
//! |--------|---------------|-------|
//! | `0x00` | TyreTemps     | 8     |
//! | `0x01` | TyreDetection | 6     |
//! | `0x02` | BrakeTemps    | 4     |
//! | `0x03` | Status        | 7     |
//! | `0x10` | FrameRequest  | 1     |
//! | `0x11` | FrameData     | 8     |

use crate::zone::{RawThermalFrame, FRAME_COLS, FRAME_PIXELS};
use serde::{Deserialize, Serialize};
use static_assertions::{const_assert, const_assert_eq};
use thiserror::Error;

pub const MAX_PAYLOAD_SIZE: usize = 8;

pub const CORNER_BLOCK_STRIDE: u32 = 0x20;
pub const FRONT_LEFT_BASE: u32 = 0x100;
pub const FRONT_RIGHT_BASE: u32 = FRONT_LEFT_BASE + CORNER_BLOCK_STRIDE;
pub const REAR_LEFT_BASE: u32 = FRONT_RIGHT_BASE + CORNER_BLOCK_STRIDE;
pub const REAR_RIGHT_BASE: u32 = REAR_LEFT_BASE + CORNER_BLOCK_STRIDE;

pub const OFFSET_TYRE_TEMPS: u32 = 0x00;
pub const OFFSET_TYRE_DETECTION: u32 = 0x01;
pub const OFFSET_BRAKE_TEMPS: u32 = 0x02;
pub const OFFSET_STATUS: u32 = 0x03;
pub const OFFSET_FRAME_REQUEST: u32 = 0x10;
pub const OFFSET_FRAME_DATA: u32 = 0x11;

/// Scale of every fixed-point temperature, width and rate field.
pub const DECI: f32 = 10.0;

pub const PIXELS_PER_CHUNK: usize = 3;
pub const FRAME_CHUNKS: usize = FRAME_PIXELS / PIXELS_PER_CHUNK;

pub const STATUS_FLAG_SENSOR_FAULT: u8 = 0x01;
pub const STATUS_FLAG_OVER_TEMPERATURE: u8 = 0x02;
pub const STATUS_FLAG_FRAME_PENDING: u8 = 0x04;

const_assert!(OFFSET_FRAME_DATA < CORNER_BLOCK_STRIDE);
const_assert_eq!(FRAME_PIXELS % PIXELS_PER_CHUNK, 0);
const_assert!(FRAME_CHUNKS <= u16::MAX as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown identifier 0x{0:03X}")]
    UnknownIdentifier(u32),

    #[error("malformed payload for 0x{identifier:03X}: expected {expected} bytes, got {actual}")]
    MalformedPayload {
        identifier: u32,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Corner {
    FrontLeft,
    FrontRight,
    RearLeft,
    RearRight,
}

impl Corner {
    pub const ALL: [Corner; 4] = [
        Corner::FrontLeft,
        Corner::FrontRight,
        Corner::RearLeft,
        Corner::RearRight,
    ];

    pub fn index(self) -> usize {
        match self {
            Corner::FrontLeft => 0,
            Corner::FrontRight => 1,
            Corner::RearLeft => 2,
            Corner::RearRight => 3,
        }
    }

    pub fn base_identifier(self) -> u32 {
        match self {
            Corner::FrontLeft => FRONT_LEFT_BASE,
            Corner::FrontRight => FRONT_RIGHT_BASE,
            Corner::RearLeft => REAR_LEFT_BASE,
            Corner::RearRight => REAR_RIGHT_BASE,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Corner::FrontLeft => "FL",
            Corner::FrontRight => "FR",
            Corner::RearLeft => "RL",
            Corner::RearRight => "RR",
        }
    }

    pub fn identifier(self, kind: MessageKind) -> u32 {
        self.base_identifier() + kind.offset()
    }
}

impl core::fmt::Display for Corner {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    TyreTemps,
    TyreDetection,
    BrakeTemps,
    Status,
    FrameRequest,
    FrameData,
}

impl MessageKind {
    pub fn offset(self) -> u32 {
        match self {
            MessageKind::TyreTemps => OFFSET_TYRE_TEMPS,
            MessageKind::TyreDetection => OFFSET_TYRE_DETECTION,
            MessageKind::BrakeTemps => OFFSET_BRAKE_TEMPS,
            MessageKind::Status => OFFSET_STATUS,
            MessageKind::FrameRequest => OFFSET_FRAME_REQUEST,
            MessageKind::FrameData => OFFSET_FRAME_DATA,
        }
    }

    fn from_offset(offset: u32) -> Option<Self> {
        match offset {
            OFFSET_TYRE_TEMPS => Some(MessageKind::TyreTemps),
            OFFSET_TYRE_DETECTION => Some(MessageKind::TyreDetection),
            OFFSET_BRAKE_TEMPS => Some(MessageKind::BrakeTemps),
            OFFSET_STATUS => Some(MessageKind::Status),
            OFFSET_FRAME_REQUEST => Some(MessageKind::FrameRequest),
            OFFSET_FRAME_DATA => Some(MessageKind::FrameData),
            _ => None,
        }
    }

    /// Fixed payload width of this message on the wire.
    pub fn payload_len(self) -> usize {
        match self {
            MessageKind::TyreTemps => 8,
            MessageKind::TyreDetection => 6,
            MessageKind::BrakeTemps => 4,
            MessageKind::Status => 7,
            MessageKind::FrameRequest => 1,
            MessageKind::FrameData => 8,
        }
    }
}

/// Resolve an identifier to its corner and message type.
pub fn lookup(identifier: u32) -> Result<(Corner, MessageKind), DecodeError> {
    let corner = Corner::ALL
        .into_iter()
        .find(|c| {
            let base = c.base_identifier();
            identifier >= base && identifier < base + CORNER_BLOCK_STRIDE
        })
        .ok_or(DecodeError::UnknownIdentifier(identifier))?;

    let kind = MessageKind::from_offset(identifier - corner.base_identifier())
        .ok_or(DecodeError::UnknownIdentifier(identifier))?;

    Ok((corner, kind))
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum CornerMessage {
    TyreTemps {
        corner: Corner,
        left: f32,
        centre: f32,
        right: f32,
        gradient: f32,
    },
    TyreDetection {
        corner: Corner,
        detected: bool,
        /// 0..=1, carried as whole percent.
        confidence: f32,
        edge_left: u8,
        edge_right: u8,
        width_mm: f32,
    },
    BrakeTemps {
        corner: Corner,
        inner: f32,
        outer: f32,
    },
    Status {
        corner: Corner,
        uptime_s: u32,
        frame_rate_hz: f32,
        flags: u8,
    },
    FrameRequest {
        corner: Corner,
        request_id: u8,
    },
    FrameData {
        corner: Corner,
        chunk: u16,
        pixels: [f32; PIXELS_PER_CHUNK],
    },
}

impl CornerMessage {
    pub fn corner(&self) -> Corner {
        match *self {
            CornerMessage::TyreTemps { corner, .. }
            | CornerMessage::TyreDetection { corner, .. }
            | CornerMessage::BrakeTemps { corner, .. }
            | CornerMessage::Status { corner, .. }
            | CornerMessage::FrameRequest { corner, .. }
            | CornerMessage::FrameData { corner, .. } => corner,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            CornerMessage::TyreTemps { .. } => MessageKind::TyreTemps,
            CornerMessage::TyreDetection { .. } => MessageKind::TyreDetection,
            CornerMessage::BrakeTemps { .. } => MessageKind::BrakeTemps,
            CornerMessage::Status { .. } => MessageKind::Status,
            CornerMessage::FrameRequest { .. } => MessageKind::FrameRequest,
            CornerMessage::FrameData { .. } => MessageKind::FrameData,
        }
    }

    pub fn identifier(&self) -> u32 {
        self.corner().identifier(self.kind())
    }
}

fn to_deci(value: f32) -> i16 {
    (value * DECI)
        .round()
        .clamp(f32::from(i16::MIN), f32::from(i16::MAX)) as i16
}

fn from_deci(raw: i16) -> f32 {
    f32::from(raw) / DECI
}

fn read_i16(payload: &[u8], at: usize) -> i16 {
    i16::from_le_bytes([payload[at], payload[at + 1]])
}

fn read_u16(payload: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([payload[at], payload[at + 1]])
}

fn write_i16(data: &mut [u8; MAX_PAYLOAD_SIZE], at: usize, value: i16) {
    data[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

/// Decode one frame. Pure; never returns a partially populated message.
pub fn decode(identifier: u32, payload: &[u8]) -> Result<CornerMessage, DecodeError> {
    let (corner, kind) = lookup(identifier)?;

    let expected = kind.payload_len();
    if payload.len() < expected {
        return Err(DecodeError::MalformedPayload {
            identifier,
            expected,
            actual: payload.len(),
        });
    }

    let message = match kind {
        MessageKind::TyreTemps => CornerMessage::TyreTemps {
            corner,
            left: from_deci(read_i16(payload, 0)),
            centre: from_deci(read_i16(payload, 2)),
            right: from_deci(read_i16(payload, 4)),
            gradient: from_deci(read_i16(payload, 6)),
        },
        MessageKind::TyreDetection => CornerMessage::TyreDetection {
            corner,
            detected: payload[0] != 0,
            confidence: f32::from(payload[1].min(100)) / 100.0,
            edge_left: payload[2],
            edge_right: payload[3],
            width_mm: from_deci(read_i16(payload, 4)),
        },
        MessageKind::BrakeTemps => CornerMessage::BrakeTemps {
            corner,
            inner: from_deci(read_i16(payload, 0)),
            outer: from_deci(read_i16(payload, 2)),
        },
        MessageKind::Status => CornerMessage::Status {
            corner,
            uptime_s: u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]),
            frame_rate_hz: f32::from(read_u16(payload, 4)) / DECI,
            flags: payload[6],
        },
        MessageKind::FrameRequest => CornerMessage::FrameRequest {
            corner,
            request_id: payload[0],
        },
        MessageKind::FrameData => CornerMessage::FrameData {
            corner,
            chunk: read_u16(payload, 0),
            pixels: [
                from_deci(read_i16(payload, 2)),
                from_deci(read_i16(payload, 4)),
                from_deci(read_i16(payload, 6)),
            ],
        },
    };

    Ok(message)
}

/// Encode a message with the same scale `decode` expects. Out-of-range values
/// saturate at the field limits.
pub fn encode(message: &CornerMessage) -> BusFrame {
    let mut data = [0u8; MAX_PAYLOAD_SIZE];

    match *message {
        CornerMessage::TyreTemps { left, centre, right, gradient, .. } => {
            write_i16(&mut data, 0, to_deci(left));
            write_i16(&mut data, 2, to_deci(centre));
            write_i16(&mut data, 4, to_deci(right));
            write_i16(&mut data, 6, to_deci(gradient));
        }
        CornerMessage::TyreDetection { detected, confidence, edge_left, edge_right, width_mm, .. } => {
            data[0] = u8::from(detected);
            data[1] = (confidence.clamp(0.0, 1.0) * 100.0).round() as u8;
            data[2] = edge_left;
            data[3] = edge_right;
            write_i16(&mut data, 4, to_deci(width_mm));
        }
        CornerMessage::BrakeTemps { inner, outer, .. } => {
            write_i16(&mut data, 0, to_deci(inner));
            write_i16(&mut data, 2, to_deci(outer));
        }
        CornerMessage::Status { uptime_s, frame_rate_hz, flags, .. } => {
            data[0..4].copy_from_slice(&uptime_s.to_le_bytes());
            let rate = (frame_rate_hz * DECI).round().clamp(0.0, f32::from(u16::MAX)) as u16;
            data[4..6].copy_from_slice(&rate.to_le_bytes());
            data[6] = flags;
        }
        CornerMessage::FrameRequest { request_id, .. } => {
            data[0] = request_id;
        }
        CornerMessage::FrameData { chunk, pixels, .. } => {
            data[0..2].copy_from_slice(&chunk.to_le_bytes());
            for (i, pixel) in pixels.iter().enumerate() {
                write_i16(&mut data, 2 + i * 2, to_deci(*pixel));
            }
        }
    }

    BusFrame {
        identifier: message.identifier(),
        len: message.kind().payload_len() as u8,
        data,
    }
}

/// Split a full thermal frame into `FrameData` messages, row-major.
pub fn frame_chunks(corner: Corner, frame: &RawThermalFrame) -> impl Iterator<Item = CornerMessage> + '_ {
    (0..FRAME_CHUNKS).map(move |chunk| {
        let mut pixels = [0.0; PIXELS_PER_CHUNK];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            let index = chunk * PIXELS_PER_CHUNK + i;
            *pixel = frame.get(index / FRAME_COLS, index % FRAME_COLS);
        }
        CornerMessage::FrameData {
            corner,
            chunk: chunk as u16,
            pixels,
        }
    })
}

/// One classic bus frame: identifier plus up to eight data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusFrame {
    pub identifier: u32,
    pub len: u8,
    pub data: [u8; MAX_PAYLOAD_SIZE],
}

impl BusFrame {
    pub fn new(identifier: u32, payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(DecodeError::MalformedPayload {
                identifier,
                expected: MAX_PAYLOAD_SIZE,
                actual: payload.len(),
            });
        }

        let mut data = [0u8; MAX_PAYLOAD_SIZE];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            identifier,
            len: payload.len() as u8,
            data,
        })
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..usize::from(self.len).min(MAX_PAYLOAD_SIZE)]
    }

    pub fn decode(&self) -> Result<CornerMessage, DecodeError> {
        decode(self.identifier, self.payload())
    }
}

/// Rebuilds a thermal frame from an on-demand `FrameData` transfer.
///
/// Chunks may arrive in any order and duplicates are harmless; the frame is
/// complete once every chunk index has been seen at least once.
#[derive(Debug, Clone)]
pub struct FrameAssembler {
    corner: Corner,
    frame: RawThermalFrame,
    received: [u64; FRAME_CHUNKS / 64],
    received_count: usize,
}

const_assert_eq!(FRAME_CHUNKS % 64, 0);

impl FrameAssembler {
    pub fn new(corner: Corner) -> Self {
        Self {
            corner,
            frame: RawThermalFrame::default(),
            received: [0; FRAME_CHUNKS / 64],
            received_count: 0,
        }
    }

    /// Drop any partial transfer, e.g. after sending a new `FrameRequest`.
    pub fn reset(&mut self) {
        self.received = [0; FRAME_CHUNKS / 64];
        self.received_count = 0;
    }

    pub fn progress(&self) -> (usize, usize) {
        (self.received_count, FRAME_CHUNKS)
    }

    /// Feed one message. Returns the finished frame when the last missing
    /// chunk arrives; the assembler then starts over.
    pub fn push(&mut self, message: &CornerMessage) -> Option<RawThermalFrame> {
        let CornerMessage::FrameData { corner, chunk, pixels } = *message else {
            return None;
        };
        let chunk = usize::from(chunk);
        if corner != self.corner || chunk >= FRAME_CHUNKS {
            return None;
        }

        for (i, pixel) in pixels.iter().enumerate() {
            let index = chunk * PIXELS_PER_CHUNK + i;
            self.frame.set(index / FRAME_COLS, index % FRAME_COLS, *pixel);
        }

        let (word, bit) = (chunk / 64, chunk % 64);
        if self.received[word] & (1 << bit) == 0 {
            self.received[word] |= 1 << bit;
            self.received_count += 1;
        }

        if self.received_count == FRAME_CHUNKS {
            self.reset();
            Some(self.frame.clone())
        } else {
            None
        }
    }
}
