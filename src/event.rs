//! Synchronous publish/subscribe used by pools, requests and clients.
//!
//! Every subject (a pool, a request, a client) owns an [`EventDispatcher`]. Listeners
//! subscribe to one event name or to every event, and are invoked in priority order
//! (higher first, registration order within a priority). Dispatch works on a snapshot
//! of the listener list, so a listener may unsubscribe itself or others mid-dispatch
//! without affecting the pass in progress.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::command::Command;
use crate::error::{Result, VolleyError};
use crate::http::HttpResponse;
use crate::pool::TransferPool;
use crate::request::Request;
use crate::transfer::TransferMessage;

/// Callback invoked for a dispatched event.
pub type Listener = Arc<dyn Fn(&Event) -> Result<()> + Send + Sync>;

/// Identifies one subscription so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Payload carried by an event.
#[derive(Debug, Clone)]
pub enum EventContext {
    None,
    Request(Request),
    Requests(Vec<Request>),
    Response {
        request: Request,
        response: HttpResponse,
    },
    Polling {
        pool: TransferPool,
        request: Request,
    },
    Exception {
        error: Arc<VolleyError>,
        all: Vec<Arc<VolleyError>>,
    },
    Message(TransferMessage),
    Command(Command),
}

/// A named notification with its context.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: &'static str,
    pub context: EventContext,
}

impl Event {
    pub fn new(name: &'static str, context: EventContext) -> Self {
        Self { name, context }
    }

    /// An event that carries no context.
    pub fn bare(name: &'static str) -> Self {
        Self::new(name, EventContext::None)
    }

    /// The request this event is about, if any.
    pub fn request(&self) -> Option<&Request> {
        match &self.context {
            EventContext::Request(request)
            | EventContext::Response { request, .. }
            | EventContext::Polling { request, .. } => Some(request),
            _ => None,
        }
    }

    pub fn response(&self) -> Option<&HttpResponse> {
        match &self.context {
            EventContext::Response { response, .. } => Some(response),
            _ => None,
        }
    }

    pub fn pool(&self) -> Option<&TransferPool> {
        match &self.context {
            EventContext::Polling { pool, .. } => Some(pool),
            _ => None,
        }
    }

    pub fn command(&self) -> Option<&Command> {
        match &self.context {
            EventContext::Command(command) => Some(command),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&Arc<VolleyError>> {
        match &self.context {
            EventContext::Exception { error, .. } => Some(error),
            _ => None,
        }
    }
}

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every event
    event: Option<String>,
    priority: i32,
    listener: Listener,
}

/// Registry of event name → ordered listeners.
#[derive(Default)]
pub struct EventDispatcher {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to a single event name with the default priority (0).
    pub fn subscribe<F>(&self, event: &str, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(Some(event.to_string()), 0, Arc::new(listener))
    }

    /// Subscribe to a single event name. Higher priorities run first.
    pub fn subscribe_with_priority<F>(&self, event: &str, priority: i32, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(Some(event.to_string()), priority, Arc::new(listener))
    }

    /// Subscribe to every event dispatched by this subject.
    pub fn subscribe_all<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.insert(None, 0, Arc::new(listener))
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Whether anything would be notified for `event`.
    pub fn has_listeners(&self, event: &str) -> bool {
        self.subscriptions
            .lock()
            .iter()
            .any(|s| s.event.as_deref().is_none_or(|name| name == event))
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    /// Notify every matching listener in order.
    ///
    /// Stops at the first listener error and returns it; listeners after it are not called.
    pub fn dispatch(&self, event: &Event) -> Result<()> {
        let listeners: Vec<Listener> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.event.as_deref().is_none_or(|name| name == event.name))
            .map(|s| s.listener.clone())
            .collect();

        for listener in listeners {
            listener(event)?;
        }
        Ok(())
    }

    fn insert(&self, event: Option<String>, priority: i32, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscriptions = self.subscriptions.lock();
        // Keep the list sorted: higher priority first, then registration order
        let pos = subscriptions
            .iter()
            .position(|s| s.priority < priority)
            .unwrap_or(subscriptions.len());
        subscriptions.insert(
            pos,
            Subscription {
                id,
                event,
                priority,
                listener,
            },
        );
        id
    }
}

impl fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("subscriptions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Listener) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |tag: &'static str| -> Listener {
            let log = log_clone.clone();
            Arc::new(move |event: &Event| {
                log.lock().push(format!("{}:{}", tag, event.name));
                Ok(())
            })
        };
        (log, make)
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        let first = make("first");
        let second = make("second");
        dispatcher.subscribe("complete", move |e| first(e));
        dispatcher.subscribe("complete", move |e| second(e));

        dispatcher.dispatch(&Event::bare("complete")).unwrap();
        dispatcher.dispatch(&Event::bare("polling")).unwrap();

        assert_eq!(*log.lock(), vec!["first:complete", "second:complete"]);
    }

    #[test]
    fn test_priority_orders_listeners() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        let low = make("low");
        let normal = make("normal");
        let high = make("high");
        dispatcher.subscribe_with_priority("complete", -99999, move |e| low(e));
        dispatcher.subscribe("complete", move |e| normal(e));
        dispatcher.subscribe_with_priority("complete", 10, move |e| high(e));

        dispatcher.dispatch(&Event::bare("complete")).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["high:complete", "normal:complete", "low:complete"]
        );
    }

    #[test]
    fn test_wildcard_receives_every_event() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        let all = make("all");
        dispatcher.subscribe_all(move |e| all(e));

        dispatcher.dispatch(&Event::bare("add_request")).unwrap();
        dispatcher.dispatch(&Event::bare("reset")).unwrap();

        assert_eq!(*log.lock(), vec!["all:add_request", "all:reset"]);
        assert!(dispatcher.has_listeners("anything"));
    }

    #[test]
    fn test_unsubscribe_during_dispatch_keeps_current_pass() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let (log, make) = recorder();
        let second = make("second");

        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let slot_clone = slot.clone();
        let dispatcher_clone = dispatcher.clone();
        dispatcher.subscribe("tick", move |_| {
            if let Some(id) = *slot_clone.lock() {
                dispatcher_clone.unsubscribe(id);
            }
            Ok(())
        });
        let id = dispatcher.subscribe("tick", move |e| second(e));
        *slot.lock() = Some(id);

        // The second listener was detached mid-dispatch but still sees this pass
        dispatcher.dispatch(&Event::bare("tick")).unwrap();
        dispatcher.dispatch(&Event::bare("tick")).unwrap();

        assert_eq!(*log.lock(), vec!["second:tick"]);
        assert_eq!(dispatcher.len(), 1);
    }

    #[test]
    fn test_listener_error_stops_dispatch() {
        let dispatcher = EventDispatcher::new();
        let (log, make) = recorder();
        let after = make("after");
        dispatcher.subscribe("complete", |_| {
            Err(VolleyError::Protocol("observer failed".to_string()))
        });
        dispatcher.subscribe("complete", move |e| after(e));

        let err = dispatcher.dispatch(&Event::bare("complete")).unwrap_err();
        assert!(matches!(err, VolleyError::Protocol(_)));
        assert!(log.lock().is_empty());
    }
}
