use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::event::CallbackResult;
use crate::event::types::{EventData, EventName, HandlerId, Priority};

/// One of the three points in the pipeline around a handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Runs before the handler is started
    Before,
    /// Runs right before the handler body, in the same execution unit
    Processing,
    /// Runs once the handler body has finished
    After,
}

impl Stage {
    pub const ALL: [Stage; 3] = [Stage::Before, Stage::Processing, Stage::After];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Before => "before",
            Stage::Processing => "processing",
            Stage::After => "after",
        }
    }

    fn index(self) -> usize {
        match self {
            Stage::Before => 0,
            Stage::Processing => 1,
            Stage::After => 2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a middleware callback gets to see about the entry it wraps.
#[derive(Debug, Clone)]
pub struct MiddlewareContext {
    pub event: EventName,
    pub data: EventData,
    pub need_await: bool,
    pub priority: Priority,
    pub handler_id: HandlerId,
}

#[async_trait]
pub trait MiddlewareCallback: Send + Sync {
    async fn call(&self, context: MiddlewareContext) -> CallbackResult;
}

pub type StageCallback = Arc<dyn MiddlewareCallback>;

/// A set of optional stage callbacks, attached to one handler or installed
/// globally through [`EventBus::use_middleware`](crate::event::EventBus::use_middleware).
#[derive(Clone, Default)]
pub struct Middleware {
    pub before: Option<StageCallback>,
    pub processing: Option<StageCallback>,
    pub after: Option<StageCallback>,
}

impl Middleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_before(mut self, callback: StageCallback) -> Self {
        self.before = Some(callback);
        self
    }

    pub fn with_processing(mut self, callback: StageCallback) -> Self {
        self.processing = Some(callback);
        self
    }

    pub fn with_after(mut self, callback: StageCallback) -> Self {
        self.after = Some(callback);
        self
    }

    pub fn with_stage(mut self, stage: Stage, callback: StageCallback) -> Self {
        match stage {
            Stage::Before => self.before = Some(callback),
            Stage::Processing => self.processing = Some(callback),
            Stage::After => self.after = Some(callback),
        }
        self
    }

    pub fn stage(&self, stage: Stage) -> Option<&StageCallback> {
        match stage {
            Stage::Before => self.before.as_ref(),
            Stage::Processing => self.processing.as_ref(),
            Stage::After => self.after.as_ref(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_none() && self.processing.is_none() && self.after.is_none()
    }
}

impl fmt::Debug for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Middleware")
            .field("before", &self.before.is_some())
            .field("processing", &self.processing.is_some())
            .field("after", &self.after.is_some())
            .finish()
    }
}

/// Key of one globally installed stage callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

static NEXT_MIDDLEWARE_ID: AtomicU64 = AtomicU64::new(1);

impl MiddlewareId {
    fn next() -> Self {
        MiddlewareId(NEXT_MIDDLEWARE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Process-wide stage callbacks of one engine, kept in installation order.
#[derive(Default)]
pub struct GlobalMiddleware {
    stages: [Vec<(MiddlewareId, StageCallback)>; 3],
}

impl GlobalMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, stage: Stage, callback: StageCallback) -> MiddlewareId {
        let id = MiddlewareId::next();
        self.stages[stage.index()].push((id, callback));
        id
    }

    pub fn remove(&mut self, stage: Stage, id: MiddlewareId) -> bool {
        let bucket = &mut self.stages[stage.index()];
        let before = bucket.len();
        bucket.retain(|(existing, _)| *existing != id);
        bucket.len() < before
    }

    /// Callbacks installed for `stage` right now, cloned so they can be run
    /// without holding the engine lock.
    pub fn snapshot(&self, stage: Stage) -> Vec<StageCallback> {
        self.stages[stage.index()]
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect()
    }

    pub fn len(&self, stage: Stage) -> usize {
        self.stages[stage.index()].len()
    }

    pub fn clear(&mut self) {
        self.stages.iter_mut().for_each(Vec::clear);
    }
}

impl fmt::Debug for GlobalMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GlobalMiddleware")
            .field("before", &self.len(Stage::Before))
            .field("processing", &self.len(Stage::Processing))
            .field("after", &self.len(Stage::After))
            .finish()
    }
}

struct FnMiddleware<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> MiddlewareCallback for FnMiddleware<F>
where
    F: Fn(MiddlewareContext) -> Fut + Send + Sync,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    async fn call(&self, context: MiddlewareContext) -> CallbackResult {
        (self.f)(context).await
    }
}

/// Adapt an async closure into a stage callback.
pub fn middleware_fn<F, Fut>(f: F) -> StageCallback
where
    F: Fn(MiddlewareContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CallbackResult> + Send + 'static,
{
    Arc::new(FnMiddleware { f })
}

/// Adapt a plain closure into a stage callback.
pub fn sync_middleware<F>(f: F) -> StageCallback
where
    F: Fn(&MiddlewareContext) -> CallbackResult + Send + Sync + 'static,
{
    middleware_fn(move |context: MiddlewareContext| {
        let result = f(&context);
        async move { result }
    })
}
