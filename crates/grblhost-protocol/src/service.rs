//! Async engine service
//!
//! Wraps the synchronous engine in a tokio task that serializes the
//! three input sources onto it: inbound serial lines, command-bus
//! commands and the 250 ms housekeeping tick. A cloneable handle
//! exposes command dispatch, event subscription and a synchronous
//! device-state mirror for front-ends that poll.

use crate::engine::{Command, Engine};
use crate::event::EngineEvent;
use crate::transport::{PortOptions, SerialEvent, SerialTransport};
use grblhost_core::{Error, EventDispatcher, Result};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};

/// Housekeeping cadence.
const TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Cloneable handle to a running engine service
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    events: EventDispatcher<EngineEvent>,
    device: Arc<RwLock<crate::device::DeviceSnapshot>>,
}

impl EngineHandle {
    /// Dispatch a command to the engine
    pub async fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::other("engine service has shut down"))
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Latest device-state snapshot (refreshed every tick)
    pub fn device_state(&self) -> crate::device::DeviceSnapshot {
        self.device.read().clone()
    }
}

/// The engine service
pub struct EngineService {
    handle: EngineHandle,
    join: JoinHandle<()>,
}

impl EngineService {
    /// Open a serial port and spawn the engine task on it
    pub fn open(options: &PortOptions) -> Result<Self> {
        let (transport, lines) = SerialTransport::open(options)?;

        let events: EventDispatcher<EngineEvent> = EventDispatcher::default();
        let mut engine = Engine::new(events.clone());
        engine.open(Box::new(transport), options.baud_rate);

        Ok(Self::spawn(engine, events, lines))
    }

    /// Spawn the service around a prepared engine. The transport must
    /// already be attached; `lines` is the inbound line channel.
    pub fn spawn(
        engine: Engine,
        events: EventDispatcher<EngineEvent>,
        lines: mpsc::UnboundedReceiver<SerialEvent>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let device = Arc::new(RwLock::new(engine.device().snapshot()));

        let handle = EngineHandle {
            commands: cmd_tx,
            events,
            device: device.clone(),
        };

        let join = tokio::spawn(run(engine, cmd_rx, lines, device));
        Self { handle, join }
    }

    /// Handle for commands, events and state snapshots
    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Stop the service, closing the port
    pub fn shutdown(self) {
        self.join.abort();
    }
}

async fn run(
    mut engine: Engine,
    mut commands: mpsc::Receiver<Command>,
    mut lines: mpsc::UnboundedReceiver<SerialEvent>,
    device: Arc<RwLock<crate::device::DeviceSnapshot>>,
) {
    let mut tick = interval(TICK_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                engine.tick(Instant::now());
                *device.write() = engine.device().snapshot();
            }
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        if let Err(err) = engine.dispatch(command, Instant::now()) {
                            tracing::warn!("command failed: {}", err);
                        }
                    }
                    // All handles dropped: shut down.
                    None => break,
                }
            }
            event = lines.recv() => {
                match event {
                    Some(SerialEvent::Line(line)) => {
                        engine.handle_line(&line, Instant::now());
                    }
                    Some(SerialEvent::Closed(reason)) => {
                        engine.handle_disconnect(&reason);
                        break;
                    }
                    None => {
                        engine.handle_disconnect("reader thread exited");
                        break;
                    }
                }
            }
        }
    }

    engine.close();
}
