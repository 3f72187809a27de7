//! # grblhost Core
//!
//! Core types, errors and event dispatch for grblhost.
//! Provides the fundamental abstractions shared by the protocol engine:
//! error taxonomy, machine-state primitives, the broadcast event
//! dispatcher, and the Grbl code databases.

pub mod decoder;
pub mod error;
pub mod event;
pub mod machine;
pub mod settings_db;

pub use error::{CommandError, Error, ProtocolError, Result, TransportError};
pub use event::EventDispatcher;
pub use machine::{ExecutionContext, MachineState, Position};
pub use settings_db::{setting_info, SettingInfo};
