//! Tidepool wire protocol
//!
//! JSON text frames exchanged over the controller/worker WebSocket. Every frame is an
//! [`Envelope`] carrying the sender's clock and a message tagged by `type`.

pub mod messages;

pub use messages::{
    CommandMetrics, ControllerMessage, Envelope, ErrorCode, LoadCommand, MetricsReport,
    StopCommand, WorkerMessage, WorkerState, now_millis,
};
