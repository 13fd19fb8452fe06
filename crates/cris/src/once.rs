//! Write-once, awaitable slots.
//!
//! Every future exposed by an executing command is backed by a [`OnceSlot`].
//! A slot is set at most once; a second `set` fails with
//! [`CrisError::AlreadyResolved`] instead of overwriting the first value.

use std::sync::Arc;

use tokio::sync::watch;

use crate::error::{CrisError, Result};

pub(crate) struct OnceSlot<T> {
    what: &'static str,
    tx: watch::Sender<Option<Arc<T>>>,
}

impl<T: Send + Sync> OnceSlot<T> {
    pub(crate) fn new(what: &'static str) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { what, tx }
    }

    pub(crate) fn set(&self, value: T) -> Result<Arc<T>> {
        let value = Arc::new(value);
        let mut stored = false;
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value.clone());
            stored = true;
            true
        });

        if stored {
            Ok(value)
        } else {
            Err(CrisError::AlreadyResolved { what: self.what })
        }
    }

    pub(crate) fn get(&self) -> Option<Arc<T>> {
        self.tx.borrow().clone()
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    pub(crate) async fn wait(&self) -> Result<Arc<T>> {
        self.waiter().wait().await
    }

    /// A detached waiter that outlives the slot's owner.
    ///
    /// If the slot is dropped unresolved, the waiter fails with
    /// [`CrisError::Closed`].
    pub(crate) fn waiter(&self) -> OnceWaiter<T> {
        OnceWaiter {
            what: self.what,
            rx: self.tx.subscribe(),
        }
    }
}

pub(crate) struct OnceWaiter<T> {
    what: &'static str,
    rx: watch::Receiver<Option<Arc<T>>>,
}

impl<T> OnceWaiter<T> {
    pub(crate) async fn wait(mut self) -> Result<Arc<T>> {
        let what = self.what;
        match self.rx.wait_for(Option::is_some).await {
            Ok(value) => value.clone().ok_or(CrisError::Closed { what }),
            Err(_) => Err(CrisError::Closed { what }),
        }
    }
}
