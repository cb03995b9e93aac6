//! Synchronous publish/handle event bus.
//!
//! Handlers run in subscription order at publish time with mutable access
//! to a caller-supplied context. A handler that errors or panics is
//! recorded as a [`HandlerFailure`] and the remaining handlers still run.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::policy::Action;

/// Event kinds map one-to-one onto actions.
pub type EventKind = Action;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub kind: EventKind,
    pub cycle: u64,
    /// Priority of the class that fired, 0 for fallbacks.
    pub priority: u8,
    pub signal: f64,
    pub target: String,
    /// Plan step the target was taken from, if any.
    #[serde(default)]
    pub source_step: Option<u64>,
    pub timestamp: u64,
    pub handled: bool,
}

impl Event {
    pub fn new(kind: EventKind, cycle: u64, target: impl Into<String>, timestamp: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            cycle,
            priority: 0,
            signal: 0.0,
            target: target.into(),
            source_step: None,
            timestamp,
            handled: false,
        }
    }

    pub fn with_priority(mut self, priority: u8, signal: f64) -> Self {
        self.priority = priority;
        self.signal = signal;
        self
    }

    pub fn with_source_step(mut self, step: Option<u64>) -> Self {
        self.source_step = step;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandlerFailure {
    pub event_id: Uuid,
    pub kind: EventKind,
    pub cycle: u64,
    pub subscription: SubscriptionId,
    pub message: String,
    pub panicked: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PublishReport {
    pub event_id: Uuid,
    pub delivered: usize,
    pub failed: usize,
    pub handled: bool,
}

pub type Handler<C> = Box<dyn FnMut(&Event, &mut C) -> Result<(), HandlerError> + Send>;

struct Subscription<C> {
    id: SubscriptionId,
    /// `None` receives every kind.
    kind: Option<EventKind>,
    handler: Handler<C>,
}

pub struct EventBus<C> {
    subscriptions: Vec<Subscription<C>>,
    next_subscription: u64,
    history: VecDeque<Event>,
    failures: VecDeque<HandlerFailure>,
    capacity: usize,
}

impl<C> EventBus<C> {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscriptions: Vec::new(),
            next_subscription: 1,
            history: VecDeque::new(),
            failures: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event, &mut C) -> Result<(), HandlerError> + Send + 'static,
    {
        self.add_subscription(Some(kind), Box::new(handler))
    }

    /// Subscribe to every event kind.
    pub fn subscribe_all<F>(&mut self, handler: F) -> SubscriptionId
    where
        F: FnMut(&Event, &mut C) -> Result<(), HandlerError> + Send + 'static,
    {
        self.add_subscription(None, Box::new(handler))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.id != id);
        self.subscriptions.len() != before
    }

    fn add_subscription(&mut self, kind: Option<EventKind>, handler: Handler<C>) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscriptions.push(Subscription { id, kind, handler });
        id
    }

    /// Deliver `event` to matching handlers and record it in history.
    /// The event is marked handled when at least one handler succeeded.
    pub fn publish(&mut self, mut event: Event, ctx: &mut C) -> PublishReport {
        let mut delivered = 0;
        let mut failed = 0;

        for sub in self.subscriptions.iter_mut() {
            if sub.kind.is_some_and(|k| k != event.kind) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (sub.handler)(&event, ctx)));
            let failure = match outcome {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(err)) => (err.0, false),
                Err(payload) => (panic_message(payload.as_ref()), true),
            };
            failed += 1;
            tracing::warn!(
                kind = %event.kind,
                cycle = event.cycle,
                subscription = sub.id.0,
                panicked = failure.1,
                error = %failure.0,
                "event handler failed"
            );
            if self.failures.len() == self.capacity {
                self.failures.pop_front();
            }
            self.failures.push_back(HandlerFailure {
                event_id: event.id,
                kind: event.kind,
                cycle: event.cycle,
                subscription: sub.id,
                message: failure.0,
                panicked: failure.1,
            });
        }

        event.handled = delivered > 0;
        let report = PublishReport {
            event_id: event.id,
            delivered,
            failed,
            handled: event.handled,
        };
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(event);
        report
    }

    /// Unhandled events at or above the priority threshold, oldest first.
    pub fn pending(&self, priority_threshold: u8) -> Vec<Event> {
        self.history
            .iter()
            .filter(|e| !e.handled && e.priority >= priority_threshold)
            .cloned()
            .collect()
    }

    pub fn mark_handled(&mut self, event_id: Uuid) -> bool {
        match self.history.iter_mut().find(|e| e.id == event_id) {
            Some(event) if !event.handled => {
                event.handled = true;
                true
            }
            _ => false,
        }
    }

    pub fn history(&self) -> impl Iterator<Item = &Event> {
        self.history.iter()
    }

    pub fn failures(&self) -> impl Iterator<Item = &HandlerFailure> {
        self.failures.iter()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
