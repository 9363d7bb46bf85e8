//! Vehicle link for the Anki Overdrive command protocol.

pub mod codec;
mod vehicle;

pub use codec::{decode, decode_command, encode, Command, DecodeError};
pub use vehicle::AnkiVehicle;
