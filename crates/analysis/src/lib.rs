//! Track geometry and the distance filter that enriches vehicle telemetry
//! with the spacing between vehicles.

pub mod filter;
pub mod track;

pub use filter::{
    Clock, CountingErrorSink, DistanceFilter, ErrorSink, FilterConfig, FilterError, LogErrorSink, Stopping, SystemClock,
    TableCostModel, TransitionCostModel, UpdateListener, DEFAULT_VEHICLE_LENGTH_MM,
};
pub use track::{Piece, Track, TrackError, TrackPoint};
