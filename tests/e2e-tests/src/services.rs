//! Service objects hosted by the E2E scenarios

use hsu_common::Value;
use hsu_registry_client::{arg, EventPublisher, MethodTable, RemoteService};

pub const ECHO_TYPE: &str = "Echo";

/// Answers pings, echoes its first argument and raises events on demand.
#[derive(Default)]
pub struct EchoService {
    publisher: Option<EventPublisher>,
}

impl RemoteService for EchoService {
    fn service_type(&self) -> &str {
        ECHO_TYPE
    }

    fn methods(table: &mut MethodTable<Self>) {
        table
            .method("Ping", |_, _| Ok(Value::from("pong")))
            .method("Echo", |_, args| Ok(arg(&args, 0, "Echo")?.clone()))
            .method("Announce", |echo, args| {
                let payload = arg(&args, 0, "Announce")?.clone();
                let sent = echo
                    .publisher
                    .as_ref()
                    .map(|publisher| publisher.publish(payload))
                    .unwrap_or(false);
                Ok(Value::Bool(sent))
            });
    }

    fn attach_publisher(&mut self, publisher: EventPublisher) {
        self.publisher = Some(publisher);
    }
}
