//! Transport-agnostic line protocol for the pedal controller.

pub mod calibration;
pub mod command;
mod error;
pub mod event;
pub mod frame;
pub mod framer;
pub mod manager;
pub mod transport;

pub use calibration::{CalibrationPrompt, CalibrationSession, CalibrationState, PromptStep};
pub use command::{CalibrationTarget, Command, DeadzoneUpdate};
pub use error::{InvalidInputError, LinkError};
pub use event::{channel, DisconnectReason, EventRx, EventTx, LinkEvent};
pub use frame::{classify, Frame};
pub use framer::LineFramer;
pub use manager::{ConnectionManager, ConnectionStatus};
pub use transport::{chunk_channel, ChunkEvent, ChunkRx, ChunkTx, Link, LinkSink, Transport, TransportKind};
