//! Core vehicle link model and traits used by Overdrive

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

mod listeners;
pub mod memory;

pub use listeners::{Listener, ListenerId, ListenerRegistry};
pub use memory::MemoryTransport;

/// Endpoint the vehicle publishes telemetry notifications on.
pub const READ_ENDPOINT: &str = "be15bee06186407e83810bd89c4d8df4";
/// Endpoint the vehicle accepts command frames on.
pub const WRITE_ENDPOINT: &str = "be15bee16186407e83810bd89c4d8df4";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[repr(u8)]
pub enum TurnType {
    None = 0,
    Left = 1,
    Right = 2,
    UTurn = 3,
    UTurnJump = 4,
}

impl TurnType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TurnType::None),
            1 => Some(TurnType::Left),
            2 => Some(TurnType::Right),
            3 => Some(TurnType::UTurn),
            4 => Some(TurnType::UTurnJump),
            _ => None,
        }
    }
}

/// Spacing from the reporting vehicle to one other vehicle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Distance {
    pub vehicle: String,
    /// mm, lateral offset difference
    pub vertical: f64,
    /// mm, bumper to bumper along the reporting vehicle's lane
    pub horizontal: f64,
    /// mm, change of `horizontal` since the previous update for the same pair
    pub delta: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PositionUpdate {
    pub vehicle_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    pub piece: u32,
    pub location: u32,
    pub offset: f32, // mm from lane center
    pub speed: u16,  // mm/s
    pub parsing_flags: u8,
    pub last_recv_lane_change: u8,
    pub last_exec_lane_change: u8,
    pub last_desired_horizontal_speed: u16,
    pub last_desired_speed: u16,

    // assigned by the distance filter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distances: Option<Vec<Distance>>,
}

impl PositionUpdate {
    pub fn new(vehicle_id: impl Into<String>, piece: u32, location: u32, offset: f32, speed: u16) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            timestamp: OffsetDateTime::now_utc(),
            piece,
            location,
            offset,
            speed,
            parsing_flags: 0,
            last_recv_lane_change: 0,
            last_exec_lane_change: 0,
            last_desired_horizontal_speed: 0,
            last_desired_speed: 0,
            lane: None,
            position: None,
            distances: None,
        }
    }

    pub fn at(mut self, timestamp: OffsetDateTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn distance_to(&self, vehicle: &str) -> Option<&Distance> {
        self.distances.as_ref()?.iter().find(|d| d.vehicle == vehicle)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionUpdate {
    pub vehicle_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub piece: i8,
    pub previous_piece: i8,
    pub offset: f32,
    pub last_recv_lane_change: u8,
    pub last_exec_lane_change: u8,
    pub last_desired_horizontal_speed: u16,
    pub last_desired_speed: u16,
    pub uphill_counter: u8,
    pub downhill_counter: u8,
    pub left_wheel_distance_cm: u8,
    pub right_wheel_distance_cm: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntersectionUpdate {
    pub vehicle_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub piece: i8,
    pub offset: f32,
    pub intersection_code: u8,
    pub is_exiting: bool,
    pub mm_since_last_transition_bar: u16,
    pub mm_since_last_intersection_code: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum VehicleMessage {
    Position(PositionUpdate),
    Transition(TransitionUpdate),
    Intersection(IntersectionUpdate),
}

impl VehicleMessage {
    pub fn vehicle_id(&self) -> &str {
        match self {
            VehicleMessage::Position(m) => &m.vehicle_id,
            VehicleMessage::Transition(m) => &m.vehicle_id,
            VehicleMessage::Intersection(m) => &m.vehicle_id,
        }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            VehicleMessage::Position(m) => m.timestamp,
            VehicleMessage::Transition(m) => m.timestamp,
            VehicleMessage::Intersection(m) => m.timestamp,
        }
    }

    pub fn as_position(&self) -> Option<&PositionUpdate> {
        match self {
            VehicleMessage::Position(m) => Some(m),
            _ => None,
        }
    }
}

impl From<PositionUpdate> for VehicleMessage {
    fn from(m: PositionUpdate) -> Self {
        VehicleMessage::Position(m)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("endpoint {0} not found")]
    MissingEndpoint(String),
    #[error("transport is closed")]
    Closed,
    #[error("{0}")]
    Msg(String),
}

#[derive(Debug, thiserror::Error)]
pub enum VehicleError {
    #[error("connection error: {0}")]
    Connection(#[from] TransportError),
    #[error("vehicle {0} is not connected")]
    NotConnected(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type NotificationTx = tokio::sync::mpsc::UnboundedSender<Bytes>;
pub type NotificationRx = tokio::sync::mpsc::UnboundedReceiver<Bytes>;

/// Byte-level session with one physical vehicle.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<(), TransportError>;
    /// Identifiers of every endpoint the device exposes.
    async fn discover(&self) -> Result<Vec<String>, TransportError>;
    async fn subscribe(&self, endpoint: &str) -> Result<NotificationRx, TransportError>;
    fn write(&self, endpoint: &str, frame: Bytes) -> Result<(), TransportError>;
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Trait for any controllable vehicle
#[async_trait::async_trait]
pub trait Vehicle: Send + Sync {
    fn id(&self) -> &str;
    fn address(&self) -> &str;
    fn name(&self) -> &str;
    fn state(&self) -> ConnectionState;

    async fn connect(&self) -> Result<(), VehicleError>;
    async fn disconnect(&self) -> Result<(), VehicleError>;

    fn set_speed(&self, speed: u16, acceleration: Option<u16>) -> Result<(), VehicleError>;
    fn set_offset(&self, offset: f32) -> Result<(), VehicleError>;
    fn change_lane(&self, offset: f32, speed: Option<u16>, acceleration: Option<u16>) -> Result<(), VehicleError>;
    fn turn(&self, turn: TurnType) -> Result<(), VehicleError>;
    fn set_sdk_mode(&self, on: bool) -> Result<(), VehicleError>;

    fn turn_left(&self) -> Result<(), VehicleError> {
        self.turn(TurnType::Left)
    }
    fn turn_right(&self) -> Result<(), VehicleError> {
        self.turn(TurnType::Right)
    }
    fn u_turn(&self) -> Result<(), VehicleError> {
        self.turn(TurnType::UTurn)
    }
    fn u_turn_jump(&self) -> Result<(), VehicleError> {
        self.turn(TurnType::UTurnJump)
    }

    fn add_listener(&self, listener: Listener) -> ListenerId;
    /// Returns false when the id was not registered.
    fn remove_listener(&self, id: ListenerId) -> bool;
}

pub type MessageTx = crossbeam_channel::Sender<VehicleMessage>;
pub type MessageRx = crossbeam_channel::Receiver<VehicleMessage>;

pub fn channel() -> (MessageTx, MessageRx) {
    crossbeam_channel::unbounded()
}
