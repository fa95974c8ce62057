/// Single-flight table for provider calls
///
/// The first caller for a signature becomes the leader and calls the
/// provider; later callers for the same signature wait for the leader's
/// result instead of calling the provider themselves.
use crate::config::types::Explanation;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Result shared with followers. `None` means the provider failed.
type Shared = Option<Explanation>;

#[derive(Default)]
pub struct Flight {
    result: Mutex<Option<Shared>>,
    done: Condvar,
}

impl Flight {
    /// Block until the leader completes
    pub fn wait(&self) -> Shared {
        let mut result = self.result.lock();
        loop {
            if let Some(shared) = result.as_ref() {
                return shared.clone();
            }
            self.done.wait(&mut result);
        }
    }

    fn complete(&self, shared: Shared) {
        *self.result.lock() = Some(shared);
        self.done.notify_all();
    }
}

pub enum Role<'a> {
    Leader(LeaderGuard<'a>),
    Follower(Arc<Flight>),
}

#[derive(Default)]
pub struct InFlight {
    flights: DashMap<String, Arc<Flight>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, signature: &str) -> Role<'_> {
        match self.flights.entry(signature.to_string()) {
            Entry::Occupied(occupied) => Role::Follower(Arc::clone(occupied.get())),
            Entry::Vacant(vacant) => {
                let flight = Arc::new(Flight::default());
                vacant.insert(Arc::clone(&flight));
                Role::Leader(LeaderGuard {
                    table: self,
                    signature: signature.to_string(),
                    flight,
                    completed: false,
                })
            }
        }
    }

    /// Signatures currently being resolved
    pub fn len(&self) -> usize {
        self.flights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flights.is_empty()
    }
}

/// Held by the leader. Dropping it without `complete` releases followers
/// with a failure result.
pub struct LeaderGuard<'a> {
    table: &'a InFlight,
    signature: String,
    flight: Arc<Flight>,
    completed: bool,
}

impl LeaderGuard<'_> {
    pub fn complete(mut self, shared: Shared) {
        self.finish(shared);
    }

    fn finish(&mut self, shared: Shared) {
        if self.completed {
            return;
        }
        self.completed = true;
        self.flight.complete(shared);
        self.table.flights.remove(&self.signature);
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        self.finish(None);
    }
}
