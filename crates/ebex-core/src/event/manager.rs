use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;

use crate::config::BusConfig;
use crate::event::diagnostics::DiagnosticSink;
use crate::event::dispatcher::{DispatchEngine, NewHandler};
use crate::event::error::EventSystemError;
use crate::event::middleware::{Middleware, MiddlewareId, Stage};
use crate::event::types::{EventData, EventName, HandlerId, Priority};
use crate::event::{CallbackResult, EventCallback, EventHandler};

/// Parameters for registering a handler with [`EventBus::on`] or
/// [`EventBus::once`].
///
/// Defaults: priority 0, not awaited, no per-handler middleware.
#[derive(Clone)]
pub struct RegisterParams {
    pub event: String,
    pub callback: EventCallback,
    pub priority: Priority,
    pub need_await: bool,
    pub middleware: Option<Middleware>,
}

impl RegisterParams {
    pub fn new(event: impl Into<String>, callback: EventCallback) -> Self {
        Self {
            event: event.into(),
            callback,
            priority: Priority::ZERO,
            need_await: false,
            middleware: None,
        }
    }

    pub fn priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Whether the drain loop waits for this handler to finish before it
    /// dequeues the next entry.
    pub fn need_await(mut self, need_await: bool) -> Self {
        self.need_await = need_await;
        self
    }

    pub fn middleware(mut self, middleware: Middleware) -> Self {
        self.middleware = Some(middleware);
        self
    }
}

impl fmt::Debug for RegisterParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterParams")
            .field("event", &self.event)
            .field("priority", &self.priority)
            .field("need_await", &self.need_await)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

/// Handle returned by [`EventBus::on`] and [`EventBus::once`].
///
/// Unsubscribing is idempotent and only stops future deliveries: entries
/// already queued for the handler are skipped when they come up. Dropping
/// the handle does not unsubscribe.
#[derive(Clone)]
pub struct Subscription {
    engine: Weak<DispatchEngine>,
    event: EventName,
    id: HandlerId,
    /// Set for `once` handlers; cleared by the first delivery or unsubscribe
    armed: Option<Arc<AtomicBool>>,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        if let Some(armed) = &self.armed {
            if !armed.swap(false, Ordering::SeqCst) {
                return;
            }
        }
        if let Some(engine) = self.engine.upgrade() {
            engine.remove_handler(&self.event, self.id);
        }
    }

    pub fn id(&self) -> HandlerId {
        self.id
    }

    pub fn event(&self) -> &EventName {
        &self.event
    }

    /// True while the handler is still registered.
    pub fn is_active(&self) -> bool {
        self.engine
            .upgrade()
            .is_some_and(|engine| engine.resolve(&self.event, self.id).is_some())
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("event", &self.event)
            .field("id", &self.id)
            .field("once", &self.armed.is_some())
            .finish()
    }
}

/// Handle returned by [`EventBus::use_middleware`]. `remove` takes out
/// exactly the stage callbacks that call installed; calling it again does
/// nothing.
pub struct MiddlewareRegistration {
    engine: Weak<DispatchEngine>,
    installed: Mutex<Vec<(Stage, MiddlewareId)>>,
}

impl MiddlewareRegistration {
    pub fn remove(&self) {
        let installed = std::mem::take(
            &mut *self.installed.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let Some(engine) = self.engine.upgrade() else {
            return;
        };
        for (stage, id) in installed {
            engine.remove_global(stage, id);
        }
    }

    /// Stages this registration still has installed.
    pub fn stages(&self) -> Vec<Stage> {
        self.installed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(stage, _)| *stage)
            .collect()
    }
}

impl fmt::Debug for MiddlewareRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MiddlewareRegistration")
            .field("stages", &self.stages())
            .finish()
    }
}

/// Wrapper installed by `once`: the first call disarms and unsubscribes
/// before the caller's callback runs, later calls do nothing.
struct OnceHandler {
    armed: Arc<AtomicBool>,
    subscription: Subscription,
    callback: EventCallback,
}

#[async_trait]
impl EventHandler for OnceHandler {
    async fn handle(&self, data: EventData) -> CallbackResult {
        if !self.armed.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.subscription.unsubscribe();
        self.callback.handle(data).await
    }
}

/// Priority-ordered event bus.
///
/// Cloning gives another handle to the same bus. Every bus owns its
/// registry, queue and middleware; nothing is shared between instances.
///
/// ```
/// use ebex_core::event::{EventBus, EventData, RegisterParams, sync_handler};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), ebex_core::event::EventSystemError> {
/// let bus = EventBus::new();
/// let greet = sync_handler(|data: &EventData| {
///     println!("hello {:?}", data.get("name"));
///     Ok(())
/// });
/// let subscription = bus.on(RegisterParams::new("greet", greet).priority(5).need_await(true))?;
///
/// let data = EventData::new();
/// data.insert("name", "world");
/// bus.emit("greet", Some(data)).await?;
///
/// subscription.unsubscribe();
/// assert!(!bus.has_listeners(Some("greet"))?);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct EventBus {
    engine: Arc<DispatchEngine>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn from_config(config: BusConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self::builder().sink(sink).build()
    }

    pub fn builder() -> EventBusBuilder {
        EventBusBuilder::default()
    }

    /// Get a reference to the underlying engine
    pub fn engine(&self) -> &Arc<DispatchEngine> {
        &self.engine
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// Register a handler.
    ///
    /// Fails only if the event name is empty after trimming.
    pub fn on(&self, params: RegisterParams) -> Result<Subscription, EventSystemError> {
        let event = EventName::parse(&params.event)?;
        let id = HandlerId::next();
        self.engine.register(
            event.clone(),
            NewHandler {
                id,
                priority: params.priority,
                need_await: params.need_await,
                original: Arc::clone(&params.callback),
                invoke: params.callback,
                middleware: params.middleware,
            },
        );
        Ok(self.subscription(event, id, None))
    }

    /// Register a handler that fires at most once.
    ///
    /// The handler removes itself before the callback starts, so emissions
    /// issued from inside the callback (or already queued) cannot reach it
    /// again. The registry holds the wrapping handler, not `callback`, so
    /// `off(event, Some(&callback))` leaves it in place; remove it early
    /// through the returned handle or with `off(event, None)`.
    pub fn once(&self, params: RegisterParams) -> Result<Subscription, EventSystemError> {
        let event = EventName::parse(&params.event)?;
        let id = HandlerId::next();
        let armed = Arc::new(AtomicBool::new(true));
        let wrapper: EventCallback = Arc::new(OnceHandler {
            armed: Arc::clone(&armed),
            subscription: self.subscription(event.clone(), id, None),
            callback: params.callback,
        });
        self.engine.register(
            event.clone(),
            NewHandler {
                id,
                priority: params.priority,
                need_await: params.need_await,
                original: Arc::clone(&wrapper),
                invoke: wrapper,
                middleware: params.middleware,
            },
        );
        Ok(self.subscription(event, id, Some(armed)))
    }

    /// Remove every handler on `event`, or only those registered with
    /// `callback`.
    pub fn off(&self, event: &str, callback: Option<&EventCallback>) -> Result<(), EventSystemError> {
        let event = EventName::parse(event)?;
        match callback {
            Some(callback) => self.engine.remove_by_callback(&event, callback),
            None => self.engine.remove_all(&event),
        };
        Ok(())
    }

    /// Install global stage callbacks. They run after each handler's own
    /// middleware for the same stage, in installation order.
    pub fn use_middleware(&self, middleware: Middleware) -> MiddlewareRegistration {
        let installed = Stage::ALL
            .into_iter()
            .filter_map(|stage| {
                middleware
                    .stage(stage)
                    .map(|callback| (stage, self.engine.add_global(stage, Arc::clone(callback))))
            })
            .collect();
        MiddlewareRegistration {
            engine: Arc::downgrade(&self.engine),
            installed: Mutex::new(installed),
        }
    }

    /// Deliver `data` (an empty record if `None`) to every handler currently
    /// registered on `event`.
    ///
    /// Emitting an event nobody listens to is not an error. Handler and
    /// middleware failures go to the diagnostic sink and never surface here.
    /// See [`DispatchEngine::emit`] for when the returned future resolves.
    pub async fn emit(&self, event: &str, data: Option<EventData>) -> Result<(), EventSystemError> {
        let event = EventName::parse(event)?;
        let data = data.unwrap_or_default();
        self.engine.emit(event, data).await;
        Ok(())
    }

    pub fn listener_count(&self, event: Option<&str>) -> Result<usize, EventSystemError> {
        let event = event.map(EventName::parse).transpose()?;
        Ok(self.engine.listener_count(event.as_ref()))
    }

    pub fn has_listeners(&self, event: Option<&str>) -> Result<bool, EventSystemError> {
        let event = event.map(EventName::parse).transpose()?;
        Ok(self.engine.has_listeners(event.as_ref()))
    }

    /// Names with at least one handler, sorted.
    pub fn events(&self) -> Vec<EventName> {
        self.engine.events()
    }

    /// Number of entries waiting in the queue.
    pub fn queued(&self) -> usize {
        self.engine.queued()
    }

    /// Remove all handlers and global middleware and empty the queue.
    pub fn clear(&self) {
        self.engine.clear();
    }

    fn subscription(&self, event: EventName, id: HandlerId, armed: Option<Arc<AtomicBool>>) -> Subscription {
        Subscription {
            engine: Arc::downgrade(&self.engine),
            event,
            id,
            armed,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.engine.name())
            .field("listeners", &self.engine.listener_count(None))
            .field("queued", &self.engine.queued())
            .finish()
    }
}

/// Builder for [`EventBus`].
#[derive(Default)]
pub struct EventBusBuilder {
    config: BusConfig,
    sink: Option<Arc<dyn DiagnosticSink>>,
}

impl EventBusBuilder {
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    pub fn cooperative_yield(mut self, enabled: bool) -> Self {
        self.config.cooperative_yield = enabled;
        self
    }

    /// Receiver for swallowed handler/middleware failures. Defaults to
    /// [`LogSink`](crate::event::LogSink).
    pub fn sink(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn build(self) -> EventBus {
        EventBus {
            engine: Arc::new(DispatchEngine::new(self.config, self.sink)),
        }
    }
}
