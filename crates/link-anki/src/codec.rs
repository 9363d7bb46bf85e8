//! Wire codec for the vehicle protocol.
//!
//! Every frame starts with a size byte (number of bytes that follow it) and an
//! opcode byte. Multi-byte integers and floats are little-endian.

use std::io::Cursor;

use byteorder::{LittleEndian, ReadBytesExt};
use bytes::{BufMut, Bytes, BytesMut};
use overdrive_link_core::{IntersectionUpdate, PositionUpdate, TransitionUpdate, TurnType, VehicleMessage};
use time::OffsetDateTime;

// controller -> vehicle
pub const OP_SET_SPEED: u8 = 0x24;
pub const OP_CHANGE_LANE: u8 = 0x25;
pub const OP_SET_OFFSET: u8 = 0x2c;
pub const OP_TURN: u8 = 0x32;
pub const OP_SDK_MODE: u8 = 0x90;

// vehicle -> controller
pub const OP_POSITION_UPDATE: u8 = 0x27;
pub const OP_TRANSITION_UPDATE: u8 = 0x29;
pub const OP_INTERSECTION_UPDATE: u8 = 0x2a;

pub const DEFAULT_ACCELERATION: u16 = 500;
pub const DEFAULT_LANE_SPEED: u16 = 500;

const SDK_FLAGS: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetSpeed { speed: u16, acceleration: u16 },
    SetOffset { offset: f32 },
    ChangeLane { speed: u16, acceleration: u16, offset: f32 },
    Turn { turn: TurnType },
    SdkMode { on: bool },
}

impl Command {
    pub fn set_speed(speed: u16, acceleration: Option<u16>) -> Self {
        Command::SetSpeed { speed, acceleration: acceleration.unwrap_or(DEFAULT_ACCELERATION) }
    }

    pub fn change_lane(offset: f32, speed: Option<u16>, acceleration: Option<u16>) -> Self {
        Command::ChangeLane {
            speed: speed.unwrap_or(DEFAULT_LANE_SPEED),
            acceleration: acceleration.unwrap_or(DEFAULT_ACCELERATION),
            offset,
        }
    }

    pub fn opcode(&self) -> u8 {
        match self {
            Command::SetSpeed { .. } => OP_SET_SPEED,
            Command::SetOffset { .. } => OP_SET_OFFSET,
            Command::ChangeLane { .. } => OP_CHANGE_LANE,
            Command::Turn { .. } => OP_TURN,
            Command::SdkMode { .. } => OP_SDK_MODE,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("frame too short to carry an opcode ({0} bytes)")]
    Empty(usize),
    #[error("frame 0x{opcode:02x} truncated at {len} bytes")]
    Truncated { opcode: u8, len: usize },
    #[error("unknown command opcode 0x{0:02x}")]
    UnknownCommand(u8),
    #[error("invalid turn type {0}")]
    InvalidTurn(u8),
}

pub fn encode(cmd: &Command) -> Bytes {
    let mut b = BytesMut::with_capacity(12);
    match *cmd {
        Command::SetSpeed { speed, acceleration } => {
            b.put_u8(6);
            b.put_u8(OP_SET_SPEED);
            b.put_u16_le(speed);
            b.put_u16_le(acceleration);
            b.put_u8(0); // do not respect road piece speed limit
        }
        Command::SetOffset { offset } => {
            b.put_u8(5);
            b.put_u8(OP_SET_OFFSET);
            b.put_f32_le(offset);
        }
        Command::ChangeLane { speed, acceleration, offset } => {
            b.put_u8(11);
            b.put_u8(OP_CHANGE_LANE);
            b.put_u16_le(speed);
            b.put_u16_le(acceleration);
            b.put_f32_le(offset);
            b.put_u8(0); // hop intent
            b.put_u8(0); // tag
        }
        Command::Turn { turn } => {
            b.put_u8(3);
            b.put_u8(OP_TURN);
            b.put_u8(turn as u8);
            b.put_u8(0); // trigger immediately
        }
        Command::SdkMode { on } => {
            b.put_u8(3);
            b.put_u8(OP_SDK_MODE);
            b.put_u8(on as u8);
            b.put_u8(SDK_FLAGS);
        }
    }
    b.freeze()
}

fn truncated(opcode: u8, len: usize) -> impl Fn(std::io::Error) -> DecodeError {
    move |_| DecodeError::Truncated { opcode, len }
}

/// Parses an outbound command frame.
pub fn decode_command(frame: &[u8]) -> Result<Command, DecodeError> {
    if frame.len() < 2 {
        return Err(DecodeError::Empty(frame.len()));
    }
    let op = frame[1];
    let short = truncated(op, frame.len());
    let mut c = Cursor::new(&frame[2..]);
    let cmd = match op {
        OP_SET_SPEED => Command::SetSpeed {
            speed: c.read_u16::<LittleEndian>().map_err(&short)?,
            acceleration: c.read_u16::<LittleEndian>().map_err(&short)?,
        },
        OP_SET_OFFSET => Command::SetOffset { offset: c.read_f32::<LittleEndian>().map_err(&short)? },
        OP_CHANGE_LANE => Command::ChangeLane {
            speed: c.read_u16::<LittleEndian>().map_err(&short)?,
            acceleration: c.read_u16::<LittleEndian>().map_err(&short)?,
            offset: c.read_f32::<LittleEndian>().map_err(&short)?,
        },
        OP_TURN => {
            let raw = c.read_u8().map_err(&short)?;
            Command::Turn { turn: TurnType::from_u8(raw).ok_or(DecodeError::InvalidTurn(raw))? }
        }
        OP_SDK_MODE => Command::SdkMode { on: c.read_u8().map_err(&short)? != 0 },
        other => return Err(DecodeError::UnknownCommand(other)),
    };
    Ok(cmd)
}

/// Decodes one notification frame.
///
/// `Ok(None)` means the opcode is not one we consume; such frames are skipped
/// so newer firmware telemetry does not break the link.
pub fn decode(
    vehicle_id: &str,
    timestamp: OffsetDateTime,
    frame: &[u8],
) -> Result<Option<VehicleMessage>, DecodeError> {
    if frame.len() < 2 {
        return Err(DecodeError::Empty(frame.len()));
    }
    let op = frame[1];
    let short = truncated(op, frame.len());
    let mut c = Cursor::new(&frame[2..]);

    let msg = match op {
        OP_POSITION_UPDATE => {
            let location = c.read_u8().map_err(&short)?;
            let piece = c.read_u8().map_err(&short)?;
            let offset = c.read_f32::<LittleEndian>().map_err(&short)?;
            let speed = c.read_u16::<LittleEndian>().map_err(&short)?;
            // trailing fields are absent on older firmware
            VehicleMessage::Position(PositionUpdate {
                vehicle_id: vehicle_id.to_string(),
                timestamp,
                piece: piece as u32,
                location: location as u32,
                offset,
                speed,
                parsing_flags: c.read_u8().unwrap_or(0),
                last_recv_lane_change: c.read_u8().unwrap_or(0),
                last_exec_lane_change: c.read_u8().unwrap_or(0),
                last_desired_horizontal_speed: c.read_u16::<LittleEndian>().unwrap_or(0),
                last_desired_speed: c.read_u16::<LittleEndian>().unwrap_or(0),
                lane: None,
                position: None,
                distances: None,
            })
        }
        OP_TRANSITION_UPDATE => {
            let piece = c.read_i8().map_err(&short)?;
            let previous_piece = c.read_i8().map_err(&short)?;
            let offset = c.read_f32::<LittleEndian>().map_err(&short)?;
            VehicleMessage::Transition(TransitionUpdate {
                vehicle_id: vehicle_id.to_string(),
                timestamp,
                piece,
                previous_piece,
                offset,
                last_recv_lane_change: c.read_u8().unwrap_or(0),
                last_exec_lane_change: c.read_u8().unwrap_or(0),
                last_desired_horizontal_speed: c.read_u16::<LittleEndian>().unwrap_or(0),
                last_desired_speed: c.read_u16::<LittleEndian>().unwrap_or(0),
                uphill_counter: c.read_u8().unwrap_or(0),
                downhill_counter: c.read_u8().unwrap_or(0),
                left_wheel_distance_cm: c.read_u8().unwrap_or(0),
                right_wheel_distance_cm: c.read_u8().unwrap_or(0),
            })
        }
        OP_INTERSECTION_UPDATE => {
            let piece = c.read_i8().map_err(&short)?;
            let offset = c.read_f32::<LittleEndian>().map_err(&short)?;
            VehicleMessage::Intersection(IntersectionUpdate {
                vehicle_id: vehicle_id.to_string(),
                timestamp,
                piece,
                offset,
                intersection_code: c.read_u8().unwrap_or(0),
                is_exiting: c.read_u8().unwrap_or(0) != 0,
                mm_since_last_transition_bar: c.read_u16::<LittleEndian>().unwrap_or(0),
                mm_since_last_intersection_code: c.read_u16::<LittleEndian>().unwrap_or(0),
            })
        }
        _ => return Ok(None),
    };
    Ok(Some(msg))
}
