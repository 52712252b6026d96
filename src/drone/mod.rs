pub mod command;
pub mod receiver;
pub mod state;
pub mod telemetry;

pub use command::{Acknowledgement, CommandChannel, CommandError};
pub use receiver::{ReceiverStats, TelemetryCounts, TelemetryReceiver};
pub use state::{FlightState, SharedFlightState, Snapshot};
pub use telemetry::{decode, DecodeError};
