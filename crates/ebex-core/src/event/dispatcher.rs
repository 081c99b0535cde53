use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::config::BusConfig;
use crate::event::diagnostics::{DiagnosticSink, DispatchFailure, FailureOrigin, LogSink};
use crate::event::error::EventSystemError;
use crate::event::middleware::{GlobalMiddleware, Middleware, MiddlewareContext, MiddlewareId, Stage, StageCallback};
use crate::event::queue::{PriorityQueue, QueueEntry};
use crate::event::registry::{Handler, HandlerRegistry};
use crate::event::types::{EventData, EventName, HandlerId, Priority};
use crate::event::{CallbackResult, EventCallback, EventHandler};

tokio::task_local! {
    /// Engines whose drain loop is driving the current call stack.
    static DRAINING: Vec<u64>;
}

static NEXT_ENGINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    Idle,
    Draining,
}

/// Everything the engine mutates, guarded by one lock that is never held
/// across an `.await`.
#[derive(Debug, Default)]
struct EngineState {
    registry: HandlerRegistry,
    queue: PriorityQueue<QueueEntry>,
    globals: GlobalMiddleware,
}

/// Registration request as the engine sees it, after name and priority
/// normalization.
pub(crate) struct NewHandler {
    pub id: HandlerId,
    pub priority: Priority,
    pub need_await: bool,
    pub original: EventCallback,
    pub invoke: EventCallback,
    pub middleware: Option<Middleware>,
}

/// Registry, queue and middleware of one bus, plus the drain loop that
/// feeds queued entries through the middleware pipeline.
///
/// Entries leave the queue strictly by priority across every event. Only one
/// drain loop runs per engine; an emission that finds one running leaves its
/// entries for that loop.
pub struct DispatchEngine {
    id: u64,
    name: Arc<str>,
    cooperative_yield: bool,
    state: Mutex<EngineState>,
    drain: watch::Sender<DrainState>,
    sink: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("DispatchEngine")
            .field("name", &self.name)
            .field("draining", &self.is_draining())
            .field("registry", &state.registry)
            .field("queue", &state.queue)
            .field("globals", &state.globals)
            .finish()
    }
}

impl DispatchEngine {
    pub fn new(config: BusConfig, sink: Option<Arc<dyn DiagnosticSink>>) -> Self {
        let (drain, _) = watch::channel(DrainState::Idle);
        Self {
            id: NEXT_ENGINE_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(config.name),
            cooperative_yield: config.cooperative_yield,
            state: Mutex::new(EngineState::default()),
            drain,
            sink: sink.unwrap_or_else(|| Arc::new(LogSink)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        // Callbacks never run under this lock, so a poisoned guard still
        // holds consistent data.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    //--------------------------------------------------
    // Registry operations
    //--------------------------------------------------

    pub(crate) fn register(&self, event: EventName, incoming: NewHandler) {
        log::debug!(
            "[{}] registering {} on '{}' (priority {}, need_await {})",
            self.name, incoming.id, event, incoming.priority, incoming.need_await
        );
        let handler = Handler {
            id: incoming.id,
            priority: incoming.priority,
            need_await: incoming.need_await,
            original: incoming.original,
            invoke: incoming.invoke,
            middleware: incoming.middleware.filter(|m| !m.is_empty()).map(Arc::new),
        };
        self.state().registry.register(event, handler);
    }

    pub fn remove_handler(&self, event: &EventName, id: HandlerId) -> bool {
        let removed = self.state().registry.remove_by_id(event.as_str(), id);
        if removed {
            log::debug!("[{}] removed {} from '{}'", self.name, id, event);
        }
        removed
    }

    pub fn remove_by_callback(&self, event: &EventName, callback: &EventCallback) -> usize {
        let removed = self.state().registry.remove_by_callback(event.as_str(), callback);
        log::debug!("[{}] removed {} handler(s) from '{}' by callback", self.name, removed, event);
        removed
    }

    pub fn remove_all(&self, event: &EventName) -> usize {
        let removed = self.state().registry.remove_all(event.as_str());
        log::debug!("[{}] removed all {} handler(s) from '{}'", self.name, removed, event);
        removed
    }

    pub fn resolve(&self, event: &EventName, id: HandlerId) -> Option<Arc<Handler>> {
        self.state().registry.resolve(event.as_str(), id)
    }

    pub fn listener_count(&self, event: Option<&EventName>) -> usize {
        self.state().registry.count(event.map(EventName::as_str))
    }

    pub fn has_listeners(&self, event: Option<&EventName>) -> bool {
        self.state().registry.exists(event.map(EventName::as_str))
    }

    pub fn events(&self) -> Vec<EventName> {
        self.state().registry.events()
    }

    pub(crate) fn add_global(&self, stage: Stage, callback: StageCallback) -> MiddlewareId {
        self.state().globals.add(stage, callback)
    }

    pub(crate) fn remove_global(&self, stage: Stage, id: MiddlewareId) -> bool {
        self.state().globals.remove(stage, id)
    }

    pub fn global_middleware_count(&self, stage: Stage) -> usize {
        self.state().globals.len(stage)
    }

    pub fn queued(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_draining(&self) -> bool {
        *self.drain.borrow() == DrainState::Draining
    }

    /// Drop every handler, every global stage callback and every pending
    /// entry. Pending entries are discarded without being run.
    pub fn clear(&self) {
        let mut state = self.state();
        let dropped = state.queue.len();
        state.registry.clear();
        state.globals.clear();
        state.queue.clear();
        log::debug!("[{}] cleared (discarded {} queued entries)", self.name, dropped);
    }

    //--------------------------------------------------
    // Emission and the drain loop
    //--------------------------------------------------

    /// Queue one entry per handler currently on `event`, then make sure the
    /// queue gets drained.
    ///
    /// Outside a drain loop of this engine the returned future resolves once
    /// the queue is empty. Called from a handler or middleware that this
    /// engine's drain loop is awaiting, it resolves as soon as the entries are
    /// queued: the running loop picks them up, and waiting for it here would
    /// wait on ourselves.
    pub async fn emit(self: &Arc<Self>, event: EventName, data: EventData) {
        let started = {
            let mut state = self.state();
            let handlers = state.registry.snapshot(event.as_str());
            if handlers.is_empty() {
                log::trace!("[{}] no listeners for '{}'", self.name, event);
                return;
            }
            log::trace!("[{}] emitting '{}' to {} handler(s)", self.name, event, handlers.len());
            for handler in handlers {
                state.queue.push(QueueEntry {
                    event: event.clone(),
                    data: data.clone(),
                    handler_id: handler.id,
                    priority: handler.priority,
                    need_await: handler.need_await,
                });
            }
            // Decided under the state lock so it cannot interleave with the
            // running loop's final empty check.
            self.drain.send_if_modified(|drain| {
                if *drain == DrainState::Idle {
                    *drain = DrainState::Draining;
                    true
                } else {
                    false
                }
            })
        };

        if started {
            self.run_drain().await;
        } else if !self.inside_own_drain() {
            self.wait_idle().await;
        }
    }

    fn inside_own_drain(&self) -> bool {
        DRAINING
            .try_with(|engines| engines.contains(&self.id))
            .unwrap_or(false)
    }

    async fn wait_idle(&self) {
        let mut idle = self.drain.subscribe();
        if idle.wait_for(|drain| *drain == DrainState::Idle).await.is_err() {
            log::warn!("[{}] drain state channel closed while waiting", self.name);
        }
    }

    async fn run_drain(self: &Arc<Self>) {
        log::trace!("[{}] drain loop started", self.name);
        let mut engines = DRAINING.try_with(Clone::clone).unwrap_or_default();
        engines.push(self.id);

        let mut guard = DrainGuard { engine: self, finished: false };
        DRAINING.scope(engines, self.drain_queue()).await;
        guard.finished = true;
        log::trace!("[{}] drain loop idle", self.name);
    }

    async fn drain_queue(self: &Arc<Self>) {
        loop {
            let next = {
                let mut state = self.state();
                match state.queue.pop() {
                    Some(entry) => {
                        let handler = state.registry.resolve(entry.event.as_str(), entry.handler_id);
                        Some((entry, handler))
                    }
                    None => {
                        // Emitters push under this same lock, so nothing can
                        // slip in between the empty check and going idle.
                        self.drain.send_replace(DrainState::Idle);
                        None
                    }
                }
            };

            let Some((entry, handler)) = next else {
                break;
            };
            let Some(handler) = handler else {
                log::trace!(
                    "[{}] skipping entry for removed {} on '{}'",
                    self.name, entry.handler_id, entry.event
                );
                continue;
            };
            self.dispatch_entry(handler, entry).await;
        }
    }

    async fn dispatch_entry(self: &Arc<Self>, handler: Arc<Handler>, entry: QueueEntry) {
        let context = MiddlewareContext {
            event: entry.event,
            data: entry.data,
            need_await: entry.need_await,
            priority: entry.priority,
            handler_id: handler.id,
        };

        self.run_stage(&handler, &context, Stage::Before).await;

        if self.cooperative_yield {
            tokio::task::yield_now().await;
        }

        if context.need_await {
            Arc::clone(self).execute(handler, context).await;
            return;
        }

        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(Arc::clone(self).execute(handler, context));
            }
            Err(_) => {
                log::debug!(
                    "[{}] no Tokio runtime for detached {}, running it inline",
                    self.name, handler.id
                );
                Arc::clone(self).execute(handler, context).await;
            }
        }
    }

    /// `processing` stage, handler body and `after` stage: the unit that is
    /// either awaited or detached depending on `need_await`.
    async fn execute(self: Arc<Self>, handler: Arc<Handler>, context: MiddlewareContext) {
        self.run_stage(&handler, &context, Stage::Processing).await;

        if let Err(error) = guarded(handler.invoke.handle(context.data.clone())).await {
            self.report(&context, FailureOrigin::Handler, error);
        }

        self.run_stage(&handler, &context, Stage::After).await;
    }

    async fn run_stage(&self, handler: &Handler, context: &MiddlewareContext, stage: Stage) {
        if let Some(callback) = handler.middleware.as_ref().and_then(|m| m.stage(stage)) {
            if let Err(error) = guarded(callback.call(context.clone())).await {
                self.report(context, FailureOrigin::Middleware(stage), error);
            }
        }

        let globals = self.state().globals.snapshot(stage);
        for callback in globals {
            if let Err(error) = guarded(callback.call(context.clone())).await {
                self.report(context, FailureOrigin::Global(stage), error);
            }
        }
    }

    fn report(&self, context: &MiddlewareContext, origin: FailureOrigin, error: EventSystemError) {
        let failure = DispatchFailure {
            bus: Arc::clone(&self.name),
            event: context.event.clone(),
            handler_id: Some(context.handler_id),
            origin,
            error,
        };
        if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| self.sink.report(&failure))) {
            log::error!(
                "[{}] diagnostic sink panicked while reporting {}: {}",
                self.name,
                failure,
                panic_message(panic.as_ref())
            );
        }
    }
}

/// Keeps the engine usable if the future driving its drain loop is dropped
/// part way through: the state goes back to idle and whatever is still
/// queued gets a fresh loop on the current runtime.
struct DrainGuard<'a> {
    engine: &'a Arc<DispatchEngine>,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pending = {
            let state = self.engine.state();
            self.engine.drain.send_replace(DrainState::Idle);
            state.queue.len()
        };
        log::warn!(
            "[{}] drain loop cancelled with {} entries pending",
            self.engine.name, pending
        );
        if pending == 0 {
            return;
        }
        if let Ok(runtime) = Handle::try_current() {
            let engine = Arc::clone(self.engine);
            runtime.spawn(async move { engine.resume_drain().await });
        }
    }
}

impl DispatchEngine {
    async fn resume_drain(self: Arc<Self>) {
        let started = {
            let _state = self.state();
            self.drain.send_if_modified(|drain| {
                if *drain == DrainState::Idle {
                    *drain = DrainState::Draining;
                    true
                } else {
                    false
                }
            })
        };
        if started {
            self.run_drain().await;
        }
    }
}

/// Await a callback future, turning both a returned error and a panic into
/// an [`EventSystemError`].
async fn guarded<F>(callback: F) -> Result<(), EventSystemError>
where
    F: Future<Output = CallbackResult>,
{
    match AssertUnwindSafe(callback).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(source)) => Err(EventSystemError::Callback { source }),
        Err(panic) => Err(EventSystemError::CallbackPanicked {
            message: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

//--------------------------------------------------
// Helper Functions
//--------------------------------------------------

struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(EventData) -> Fut + Send + Sync,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    async fn handle(&self, data: EventData) -> CallbackResult {
        (self.f)(data).await
    }
}

/// Wrap an async closure as an [`EventCallback`].
pub fn handler_fn<F, Fut>(f: F) -> EventCallback
where
    F: Fn(EventData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Helper function to create synchronous handlers that are compatible with async system
pub fn sync_handler<F>(f: F) -> EventCallback
where
    F: Fn(&EventData) -> CallbackResult + Send + Sync + 'static,
{
    handler_fn(move |data: EventData| {
        let result = f(&data);
        async move { result }
    })
}
