//! Single-flight coalescing of origin fetches.
//!
//! The first request for a key becomes the [`FlightLeader`] and performs the
//! fetch; requests arriving while it is outstanding get a [`FlightWaiter`] and
//! receive a clone of the leader's result.
//!
//! A leader dropped without calling [`FlightLeader::complete`] (panic, task
//! cancellation) still clears its registration; its waiters then resolve with
//! [`CacheError::Flight`] instead of hanging.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CacheError, CacheResult};

type Registry<T> = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<T>>>>>;

/// In-flight registry keyed by resource key.
#[derive(Debug)]
pub struct SingleFlight<T> {
    registry: Registry<T>,
}

impl<T> Default for SingleFlight<T> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// Result of [`SingleFlight::begin`].
#[derive(Debug)]
pub enum Flight<T: Clone> {
    /// No fetch was outstanding; the caller must fetch and complete.
    Leader(FlightLeader<T>),
    /// A fetch is outstanding; await its result.
    Waiter(FlightWaiter<T>),
}

impl<T: Clone> SingleFlight<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in `key`.
    pub fn begin(&self, key: &str) -> Flight<T> {
        let mut registry = self.registry.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(waiters) = registry.get_mut(key) {
            let (tx, rx) = oneshot::channel();
            waiters.push(tx);
            debug!(key, waiters = waiters.len(), "coalesced onto in-flight fetch");
            return Flight::Waiter(FlightWaiter {
                key: key.to_string(),
                rx,
            });
        }

        registry.insert(key.to_string(), Vec::new());
        Flight::Leader(FlightLeader {
            key: key.to_string(),
            registry: Arc::clone(&self.registry),
            completed: false,
        })
    }

    /// Number of keys with an outstanding fetch.
    pub fn in_flight(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Handle owned by the request performing the origin fetch.
#[derive(Debug)]
pub struct FlightLeader<T: Clone> {
    key: String,
    registry: Registry<T>,
    completed: bool,
}

impl<T: Clone> FlightLeader<T> {
    /// Deliver `value` to every waiter, in registration order, and clear the key.
    /// Returns the number of waiters served.
    pub fn complete(mut self, value: T) -> usize {
        self.completed = true;
        let waiters = self.take_waiters();
        let count = waiters.len();
        for tx in waiters {
            // A waiter that gave up has dropped its receiver; nothing to do.
            let _ = tx.send(value.clone());
        }
        count
    }

    fn take_waiters(&self) -> Vec<oneshot::Sender<T>> {
        self.registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key)
            .unwrap_or_default()
    }
}

impl<T: Clone> Drop for FlightLeader<T> {
    fn drop(&mut self) {
        if !self.completed {
            let waiters = self.take_waiters();
            warn!(
                key = %self.key,
                waiters = waiters.len(),
                "fetch abandoned before completion"
            );
        }
    }
}

/// Handle for a request coalesced onto another request's fetch.
#[derive(Debug)]
pub struct FlightWaiter<T> {
    key: String,
    rx: oneshot::Receiver<T>,
}

impl<T> FlightWaiter<T> {
    pub async fn wait(self) -> CacheResult<T> {
        self.rx
            .await
            .map_err(|_| CacheError::Flight { key: self.key })
    }
}
