//! Engine service loop: lines in, commands in, events out.

use grblhost_core::machine::ExecutionContext;
use grblhost_core::{EventDispatcher, TransportError};
use grblhost_protocol::engine::{Command, Engine};
use grblhost_protocol::event::EngineEvent;
use grblhost_protocol::service::EngineService;
use grblhost_protocol::transport::{SerialEvent, Transport};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

#[derive(Clone)]
struct MockTransport {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Transport for MockTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.writes.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn port_name(&self) -> &str {
        "/dev/ttyMOCK0"
    }

    fn close(&mut self) {}
}

async fn next_event(events: &mut broadcast::Receiver<EngineEvent>) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn service_routes_lines_commands_and_disconnects() {
    let dispatcher: EventDispatcher<EngineEvent> = EventDispatcher::default();
    let mut events = dispatcher.subscribe();

    let wire = MockTransport {
        writes: Arc::new(Mutex::new(Vec::new())),
    };
    let mut engine = Engine::new(dispatcher.clone());
    engine.open(Box::new(wire.clone()), 115_200);

    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let service = EngineService::spawn(engine, dispatcher, line_rx);
    let handle = service.handle();

    // The startup banner flows through to a read event and triggers the
    // settings dump.
    line_tx
        .send(SerialEvent::Line("Grbl 1.1f ['$' for help]".to_string()))
        .unwrap();
    loop {
        if let EngineEvent::PortRead { line } = next_event(&mut events).await {
            assert_eq!(line, "Grbl 1.1f ['$' for help]");
            break;
        }
    }

    // A command dispatched through the handle reaches the wire.
    handle
        .command(Command::Gcode {
            lines: vec!["G0 X0".to_string()],
            context: ExecutionContext::new(),
        })
        .await
        .unwrap();
    loop {
        if let EngineEvent::PortWrite { data } = next_event(&mut events).await {
            if data == "G0 X0\n" {
                break;
            }
        }
    }

    // The device snapshot mirror refreshes on the housekeeping tick.
    line_tx
        .send(SerialEvent::Line("<Idle|MPos:1.000,2.000,3.000>".to_string()))
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if handle.device_state().mpos.x == 1.0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("device snapshot never refreshed");

    // A reader disconnect surfaces as an error followed by close.
    line_tx
        .send(SerialEvent::Closed("device unplugged".to_string()))
        .unwrap();
    loop {
        if let EngineEvent::PortError { message } = next_event(&mut events).await {
            assert!(message.contains("unplugged"));
            break;
        }
    }
    loop {
        if let EngineEvent::PortClose { port } = next_event(&mut events).await {
            assert_eq!(port, "/dev/ttyMOCK0");
            break;
        }
    }
}
