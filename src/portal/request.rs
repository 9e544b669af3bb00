//! Correlation of portal request handles with their `Response` signals.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::oneshot;
use tracing::{debug, trace, warn};
use zbus::zvariant::OwnedObjectPath;

use super::{HandshakeStep, Response};

struct PendingEntry {
    step: HandshakeStep,
    deadline: Instant,
    sender: oneshot::Sender<Response>,
}

/// Upper bound on buffered responses nobody was waiting for.
const MAX_UNCLAIMED: usize = 16;

#[derive(Default)]
struct Table {
    waiters: HashMap<OwnedObjectPath, PendingEntry>,
    /// Responses that arrived for a path with no waiter. Kept briefly so a
    /// waiter re-keyed onto that path can still claim it.
    unclaimed: HashMap<OwnedObjectPath, Response>,
}

/// Waiters keyed by request object path.
///
/// An entry is consumed by whichever comes first: [`complete`](Self::complete)
/// or [`cancel`](Self::cancel). Anything arriving afterwards for the same
/// path never reaches the waiter.
#[derive(Default)]
pub struct PendingRequests {
    table: Mutex<Table>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiter for `path`. Must be called before the method that
    /// creates the request is dispatched.
    pub fn register(
        &self,
        path: OwnedObjectPath,
        step: HandshakeStep,
        timeout: Duration,
    ) -> oneshot::Receiver<Response> {
        let (sender, receiver) = oneshot::channel();
        let entry = PendingEntry {
            step,
            deadline: Instant::now() + timeout,
            sender,
        };
        if self.lock().waiters.insert(path.clone(), entry).is_some() {
            warn!(request = %path, %step, "Replacing an outstanding waiter");
        }
        trace!(request = %path, %step, "Registered request waiter");
        receiver
    }

    /// Delivers `response` to the waiter for `path`. Returns `false` when no
    /// waiter exists (already completed, cancelled, or never registered).
    pub fn complete(&self, path: &OwnedObjectPath, response: Response) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.waiters.remove(path) else {
            debug!(request = %path, status = response.status, "No waiter for response");
            if table.unclaimed.len() >= MAX_UNCLAIMED {
                table.unclaimed.clear();
            }
            table.unclaimed.insert(path.clone(), response);
            return false;
        };
        drop(table);

        let late = Instant::now() > entry.deadline;
        debug!(
            request = %path,
            step = %entry.step,
            status = response.status,
            late,
            "Request completed"
        );
        entry.sender.send(response).is_ok()
    }

    /// Drops the waiter for `path`; its receiver observes a closed channel.
    pub fn cancel(&self, path: &OwnedObjectPath) -> bool {
        let removed = self.lock().waiters.remove(path);
        if let Some(entry) = &removed {
            debug!(request = %path, step = %entry.step, "Cancelled request waiter");
        }
        removed.is_some()
    }

    /// Moves the waiter registered under `from` to `to`.
    ///
    /// Used when the portal hands back a request path that differs from the
    /// predicted one. A response that already arrived under `to` is handed to
    /// the waiter immediately.
    pub fn rekey(&self, from: &OwnedObjectPath, to: OwnedObjectPath) -> bool {
        let mut table = self.lock();
        let Some(entry) = table.waiters.remove(from) else {
            return false;
        };
        debug!(from = %from, to = %to, "Re-keying request waiter");
        match table.unclaimed.remove(&to) {
            Some(response) => entry.sender.send(response).is_ok(),
            None => {
                table.waiters.insert(to, entry);
                true
            }
        }
    }

    /// True while a waiter is registered under `path`.
    pub fn contains(&self, path: &OwnedObjectPath) -> bool {
        self.lock().waiters.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.lock().waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn path(token: &str) -> OwnedObjectPath {
        OwnedObjectPath::try_from(format!("/org/freedesktop/portal/desktop/request/1_42/{token}"))
            .unwrap()
    }

    fn response(status: u32) -> Response {
        Response {
            status,
            results: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn completion_reaches_registered_waiter() {
        let pending = PendingRequests::new();
        let receiver = pending.register(path("a"), HandshakeStep::Start, Duration::from_secs(1));

        assert!(pending.complete(&path("a"), response(0)));
        assert_eq!(receiver.await.unwrap().status, 0);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn completion_is_delivered_at_most_once() {
        let pending = PendingRequests::new();
        let receiver = pending.register(path("a"), HandshakeStep::Start, Duration::from_secs(1));

        assert!(pending.complete(&path("a"), response(1)));
        assert!(!pending.complete(&path("a"), response(0)));
        assert_eq!(receiver.await.unwrap().status, 1);
    }

    #[tokio::test]
    async fn late_completion_after_cancel_is_discarded() {
        let pending = PendingRequests::new();
        let receiver =
            pending.register(path("slow"), HandshakeStep::SelectDevices, Duration::ZERO);

        assert!(pending.cancel(&path("slow")));
        assert!(!pending.complete(&path("slow"), response(0)));
        assert!(receiver.await.is_err());
    }

    #[tokio::test]
    async fn rekey_moves_the_waiter() {
        let pending = PendingRequests::new();
        let receiver =
            pending.register(
                path("predicted"),
                HandshakeStep::CreateSession,
                Duration::from_secs(1),
            );

        assert!(pending.rekey(&path("predicted"), path("actual")));
        assert!(!pending.contains(&path("predicted")));
        assert!(pending.complete(&path("actual"), response(0)));
        assert!(receiver.await.is_ok());
    }

    #[tokio::test]
    async fn rekey_claims_a_response_that_arrived_first() {
        let pending = PendingRequests::new();
        let receiver =
            pending.register(path("predicted"), HandshakeStep::Start, Duration::from_secs(1));

        assert!(!pending.complete(&path("actual"), response(2)));
        assert!(pending.rekey(&path("predicted"), path("actual")));
        assert_eq!(receiver.await.unwrap().status, 2);
        assert!(pending.is_empty());
    }
}
