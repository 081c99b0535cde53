use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::event::middleware::Middleware;
use crate::event::types::{EventName, HandlerId, Priority};
use crate::event::{EventCallback, same_callback};

/// A registered handler. Owned by the registry; queue entries only carry
/// its id.
pub struct Handler {
    pub id: HandlerId,
    pub priority: Priority,
    pub need_await: bool,
    /// Callback the caller registered, matched by [`HandlerRegistry::remove_by_callback`]
    pub original: EventCallback,
    /// Callback the engine actually invokes (differs from `original` for `once`)
    pub invoke: EventCallback,
    pub middleware: Option<Arc<Middleware>>,
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("need_await", &self.need_await)
            .field("middleware", &self.middleware)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct EventHandlers {
    /// Priority-descending; equal priorities keep registration order
    ordered: Vec<Arc<Handler>>,
    lookup: HashMap<HandlerId, Arc<Handler>>,
}

/// Handlers per event name.
///
/// An event's entry disappears as soon as its last handler does, so the key
/// set only ever holds events that have listeners.
#[derive(Default)]
pub struct HandlerRegistry {
    events: HashMap<EventName, EventHandlers>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event: EventName, handler: Handler) -> Arc<Handler> {
        let handler = Arc::new(handler);
        let entry = self.events.entry(event).or_default();
        let at = entry
            .ordered
            .partition_point(|existing| existing.priority >= handler.priority);
        entry.ordered.insert(at, Arc::clone(&handler));
        entry.lookup.insert(handler.id, Arc::clone(&handler));
        handler
    }

    /// Remove one handler. Unknown ids are ignored.
    pub fn remove_by_id(&mut self, event: &str, id: HandlerId) -> bool {
        let Some(entry) = self.events.get_mut(event) else {
            return false;
        };
        let removed = entry.lookup.remove(&id).is_some();
        if removed {
            entry.ordered.retain(|handler| handler.id != id);
        }
        if entry.ordered.is_empty() {
            self.events.remove(event);
        }
        removed
    }

    /// Remove every handler on `event` registered with `callback`. Returns
    /// how many went away.
    pub fn remove_by_callback(&mut self, event: &str, callback: &EventCallback) -> usize {
        let targets: Vec<HandlerId> = match self.events.get(event) {
            Some(entry) => entry
                .ordered
                .iter()
                .filter(|handler| same_callback(&handler.original, callback))
                .map(|handler| handler.id)
                .collect(),
            None => return 0,
        };
        targets
            .into_iter()
            .filter(|id| self.remove_by_id(event, *id))
            .count()
    }

    pub fn remove_all(&mut self, event: &str) -> usize {
        self.events
            .remove(event)
            .map(|entry| entry.ordered.len())
            .unwrap_or(0)
    }

    pub fn resolve(&self, event: &str, id: HandlerId) -> Option<Arc<Handler>> {
        self.events
            .get(event)
            .and_then(|entry| entry.lookup.get(&id))
            .cloned()
    }

    /// Handlers for `event` in dispatch order, as of now.
    pub fn snapshot(&self, event: &str) -> Vec<Arc<Handler>> {
        self.events
            .get(event)
            .map(|entry| entry.ordered.clone())
            .unwrap_or_default()
    }

    /// Handler count for one event, or across all events.
    pub fn count(&self, event: Option<&str>) -> usize {
        match event {
            Some(event) => self.events.get(event).map_or(0, |entry| entry.ordered.len()),
            None => self.events.values().map(|entry| entry.ordered.len()).sum(),
        }
    }

    pub fn exists(&self, event: Option<&str>) -> bool {
        match event {
            Some(event) => self.events.get(event).is_some_and(|entry| !entry.ordered.is_empty()),
            None => self.events.values().any(|entry| !entry.ordered.is_empty()),
        }
    }

    /// Names that currently have at least one handler, sorted.
    pub fn events(&self) -> Vec<EventName> {
        let mut names: Vec<EventName> = self.events.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("events", &self.events.len())
            .field("handlers", &self.count(None))
            .finish()
    }
}
