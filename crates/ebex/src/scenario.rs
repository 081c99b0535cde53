//! Scenario files for the `ebex` binary.
//!
//! A scenario declares handlers, global middleware and batches of emissions.
//! [`Scenario::build`] turns it into a live [`EventBus`] whose handlers print
//! one line per invocation, so the dispatch order can be read off stdout.
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use ebex_core::config::load_file;
use ebex_core::event::{
    DiagnosticSink, DispatchFailure, EventBus, EventCallback, EventData, EventName, LogSink, Middleware,
    MiddlewareContext, Priority, RegisterParams, Stage, StageCallback, sync_handler, sync_middleware,
};
use ebex_core::{BusConfig, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::sync::watch;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub handlers: Vec<HandlerDecl>,
    #[serde(default)]
    pub global: Vec<MiddlewareDecl>,
    #[serde(default)]
    pub batches: Vec<Batch>,
}

#[derive(Debug, Deserialize)]
pub struct HandlerDecl {
    /// Kept untyped so a non-string name fails with the bus's own error.
    pub event: Value,
    pub label: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub need_await: bool,
    #[serde(default)]
    pub once: bool,
    /// Return an error instead of succeeding
    #[serde(default)]
    pub fail: bool,
    /// Stages of per-handler middleware that announce themselves
    #[serde(default)]
    pub middleware: Vec<StageName>,
}

#[derive(Debug, Deserialize)]
pub struct MiddlewareDecl {
    pub label: String,
    pub stages: Vec<StageName>,
}

#[derive(Debug, Deserialize)]
pub struct Batch {
    pub emit: Vec<Emission>,
}

#[derive(Debug, Deserialize)]
pub struct Emission {
    pub event: Value,
    #[serde(default)]
    pub data: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageName {
    Before,
    Processing,
    After,
}

impl From<StageName> for Stage {
    fn from(name: StageName) -> Self {
        match name {
            StageName::Before => Stage::Before,
            StageName::Processing => Stage::Processing,
            StageName::After => Stage::After,
        }
    }
}

/// Counts reported failures and forwards them to the log.
#[derive(Debug, Default)]
pub struct CountingSink {
    failures: AtomicUsize,
}

impl CountingSink {
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

impl DiagnosticSink for CountingSink {
    fn report(&self, failure: &DispatchFailure) {
        self.failures.fetch_add(1, Ordering::SeqCst);
        LogSink.report(failure);
    }
}

/// Number of entries between their `before` and `after` stages. Detached
/// handlers keep running after `emit` returns; the runner waits for this to
/// drop back to zero before printing the summary.
#[derive(Debug)]
pub struct InFlight {
    count: watch::Sender<usize>,
}

impl InFlight {
    fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self { count }
    }

    fn middleware(self: &Arc<Self>) -> Middleware {
        let enter = Arc::clone(self);
        let leave = Arc::clone(self);
        Middleware::new()
            .with_before(sync_middleware(move |_ctx: &MiddlewareContext| {
                enter.count.send_modify(|count| *count += 1);
                Ok(())
            }))
            .with_after(sync_middleware(move |_ctx: &MiddlewareContext| {
                leave.count.send_modify(|count| *count = count.saturating_sub(1));
                Ok(())
            }))
    }

    pub async fn settled(&self) {
        let mut count = self.count.subscribe();
        if count.wait_for(|count| *count == 0).await.is_err() {
            log::warn!("in-flight counter closed while waiting");
        }
    }
}

/// A bus wired up from a scenario, plus the counters the runner reports.
pub struct Harness {
    pub bus: EventBus,
    pub sink: Arc<CountingSink>,
    pub invocations: Arc<AtomicUsize>,
    pub in_flight: Arc<InFlight>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        Ok(load_file(path)?)
    }

    /// Register every declared handler and global middleware on a new bus.
    pub fn build(&self) -> Result<Harness> {
        let sink = Arc::new(CountingSink::default());
        let bus = EventBus::builder()
            .config(self.bus.clone())
            .sink(Arc::clone(&sink) as Arc<dyn DiagnosticSink>)
            .build();
        let invocations = Arc::new(AtomicUsize::new(0));

        for decl in &self.handlers {
            let event = EventName::from_value(&decl.event)?;
            let mut params = RegisterParams::new(event.as_str(), announcing_handler(decl, &event, &invocations))
                .priority(decl.priority)
                .need_await(decl.need_await);
            if !decl.middleware.is_empty() {
                params = params.middleware(announcing_middleware(&decl.label, &decl.middleware));
            }
            if decl.once {
                bus.once(params)?;
            } else {
                bus.on(params)?;
            }
        }

        for decl in &self.global {
            bus.use_middleware(announcing_middleware(&decl.label, &decl.stages));
        }

        let in_flight = Arc::new(InFlight::new());
        bus.use_middleware(in_flight.middleware());

        Ok(Harness {
            bus,
            sink,
            invocations,
            in_flight,
        })
    }
}

impl Emission {
    pub fn event_name(&self) -> Result<EventName> {
        Ok(EventName::from_value(&self.event)?)
    }

    pub fn payload(&self) -> EventData {
        self.data.clone().map(EventData::from).unwrap_or_default()
    }
}

fn announcing_handler(decl: &HandlerDecl, event: &EventName, invocations: &Arc<AtomicUsize>) -> EventCallback {
    let label = decl.label.clone();
    let event = event.clone();
    let fail = decl.fail;
    let invocations = Arc::clone(invocations);
    sync_handler(move |data: &EventData| {
        invocations.fetch_add(1, Ordering::SeqCst);
        if data.is_empty() {
            println!("{label} <- {event}");
        } else {
            println!("{label} <- {event} {}", Value::Object(data.snapshot()));
        }
        if fail {
            return Err(format!("{label} failed on purpose").into());
        }
        Ok(())
    })
}

fn announcing_middleware(label: &str, stages: &[StageName]) -> Middleware {
    stages.iter().fold(Middleware::new(), |middleware, &stage| {
        let stage = Stage::from(stage);
        middleware.with_stage(stage, announcing_stage(label, stage))
    })
}

fn announcing_stage(label: &str, stage: Stage) -> StageCallback {
    let label = label.to_string();
    sync_middleware(move |ctx: &MiddlewareContext| {
        println!("{label}:{stage} <- {}", ctx.event);
        Ok(())
    })
}
