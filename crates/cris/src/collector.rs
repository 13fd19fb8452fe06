//! Append-only event collector with live notification.
//!
//! The collector is single-writer: only the runner executing the owning
//! command appends. Any number of readers may take snapshots or follow the
//! collector as a stream. Events are never mutated or removed after append,
//! and the length only grows, so a reader that has seen index `n` can always
//! read `0..n` again.

use std::fmt;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;

use crate::error::{CrisError, Result};

type Subscriber<E> = Arc<dyn Fn(&Arc<E>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct CollectorState {
    len: usize,
    closed: bool,
}

struct Inner<E> {
    events: RwLock<Vec<Arc<E>>>,
    state: watch::Sender<CollectorState>,
    subscribers: Mutex<Vec<Subscriber<E>>>,
}

/// Ordered, append-only sequence of events with an "item added" notification.
pub struct EventCollector<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for EventCollector<E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<E> Default for EventCollector<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for EventCollector<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.inner.state.borrow();
        f.debug_struct("EventCollector")
            .field("len", &state.len)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<E> EventCollector<E> {
    pub fn new() -> Self {
        let (state, _rx) = watch::channel(CollectorState::default());
        Self {
            inner: Arc::new(Inner {
                events: RwLock::new(Vec::new()),
                state,
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Append an event and notify subscribers on the caller's path.
    ///
    /// Subscribers run before this returns, so a slow subscriber slows the
    /// appending runner.
    pub fn append(&self, event: E) -> Result<Arc<E>> {
        let event = Arc::new(event);
        {
            let mut events = self.inner.events.write();
            if self.inner.state.borrow().closed {
                return Err(CrisError::Closed {
                    what: "event collector",
                });
            }
            events.push(event.clone());
        }
        self.inner.state.send_modify(|state| state.len += 1);

        let subscribers = self.inner.subscribers.lock().clone();
        for subscriber in subscribers {
            subscriber(&event);
        }
        Ok(event)
    }

    /// Register a callback for every event appended from now on.
    pub fn subscribe<F>(&self, f: F)
    where
        F: Fn(&Arc<E>) + Send + Sync + 'static,
    {
        self.inner.subscribers.lock().push(Arc::new(f));
    }

    /// Reject further appends. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let _events = self.inner.events.write();
        self.inner.state.send_if_modified(|state| {
            if state.closed {
                false
            } else {
                state.closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    pub fn len(&self) -> usize {
        self.inner.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<E>> {
        self.inner.events.read().clone()
    }

    /// Wait until the collector is closed and return everything it holds.
    pub async fn closed(&self) -> Vec<Arc<E>> {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|state| state.closed).await;
        self.snapshot()
    }
}

impl<E: Send + Sync + 'static> EventCollector<E> {
    /// Follow the collector from the first event until it is closed.
    pub fn stream(&self) -> BoxStream<'static, Arc<E>> {
        let inner = self.inner.clone();
        let rx = inner.state.subscribe();
        stream::unfold((inner, rx, 0usize), |(inner, mut rx, index)| async move {
            loop {
                // Mark the state seen before reading, so an append racing
                // with this check still wakes `changed()` below.
                let state = *rx.borrow_and_update();
                let next = inner.events.read().get(index).cloned();
                if let Some(event) = next {
                    return Some((event, (inner, rx, index + 1)));
                }
                if state.closed {
                    return None;
                }
                if rx.changed().await.is_err() {
                    return None;
                }
            }
        })
        .boxed()
    }
}
