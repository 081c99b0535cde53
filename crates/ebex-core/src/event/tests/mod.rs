#[cfg(test)]
mod middleware_tests;
#[cfg(test)]
mod queue_tests;

/// Shared helpers for the event tests.
#[cfg(test)]
pub(crate) mod common {
    use std::sync::{Arc, Mutex};

    use crate::event::diagnostics::{DiagnosticSink, DispatchFailure};
    use crate::event::types::HandlerId;
    use crate::event::{EventBus, EventCallback, EventData, sync_handler};

    pub type Log = Arc<Mutex<Vec<String>>>;

    pub fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    pub fn entries(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    /// Handler that appends `label` to `log` every time it runs.
    pub fn recorder(log: &Log, label: &str) -> EventCallback {
        let log = Arc::clone(log);
        let label = label.to_string();
        sync_handler(move |_data: &EventData| {
            log.lock().unwrap().push(label.clone());
            Ok(())
        })
    }

    #[derive(Debug, Clone, PartialEq)]
    pub struct Reported {
        pub event: String,
        pub origin: String,
        pub handler_id: Option<HandlerId>,
        pub message: String,
    }

    /// Sink that keeps every failure for later assertions.
    #[derive(Default)]
    pub struct RecordingSink {
        failures: Mutex<Vec<Reported>>,
    }

    impl RecordingSink {
        pub fn failures(&self) -> Vec<Reported> {
            self.failures.lock().unwrap().clone()
        }
    }

    impl DiagnosticSink for RecordingSink {
        fn report(&self, failure: &DispatchFailure) {
            self.failures.lock().unwrap().push(Reported {
                event: failure.event.to_string(),
                origin: failure.origin.to_string(),
                handler_id: failure.handler_id,
                message: failure.error.to_string(),
            });
        }
    }

    pub fn bus_with_recording_sink() -> (EventBus, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let bus = EventBus::with_sink(sink.clone());
        (bus, sink)
    }
}

#[cfg(test)]
mod tests {
    use crate::event::{EventBus, RegisterParams};
    use super::common::{entries, new_log, recorder};

    #[tokio::test]
    async fn test_event_dispatch() {
        let bus = EventBus::new();
        let log = new_log();

        bus.on(RegisterParams::new("test_event", recorder(&log, "called")).need_await(true))
            .unwrap();
        bus.emit("test_event", None).await.unwrap();

        assert_eq!(entries(&log), vec!["called"], "Handler should have been called");
    }
}
