//! # grblhost Protocol
//!
//! Host-side streaming protocol engine for Grbl controllers: a
//! character-counting sender for loaded programs, a feeder for ad-hoc
//! commands, a three-state workflow machine, the response parser and
//! device model, and the glue engine that routes acknowledgments and
//! drives the periodic status/parser-state queries.

pub mod device;
pub mod engine;
pub mod event;
pub mod external;
pub mod feeder;
pub mod parser;
pub mod preprocessor;
pub mod realtime;
pub mod sender;
pub mod service;
pub mod transport;
pub mod trigger;
pub mod workflow;

pub use device::{DeviceModel, DeviceSnapshot};
pub use engine::{Command, Engine};
pub use event::EngineEvent;
pub use external::{Macro, MacroStore, TaskRunner, WatchDirLoader};
pub use feeder::{Feeder, FeederStatus};
pub use parser::{parse_line, ModalState, Response, ResponseRecord, StatusReport};
pub use sender::{Sender, SenderStatus, DEFAULT_BUFFER_SIZE};
pub use service::{EngineHandle, EngineService};
pub use transport::{list_ports, PortInfo, PortOptions, SerialTransport, Transport};
pub use trigger::{EventHook, EventTrigger, TriggerAction};
pub use workflow::{HoldReason, Workflow, WorkflowState};
