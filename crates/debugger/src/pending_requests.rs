//! Tracking pending requests and matching responses
//!
//! When a request is sent, a single-use delivery point is registered under
//! its sequence number. Each entry is settled exactly once: by the matching
//! response, or with [`Error::ConnectionClosed`] when the connection goes
//! away.

use std::collections::HashMap;

use tokio::sync::oneshot;
use transport::{Response, Seq};

use crate::error::{Error, Result};

pub(crate) type ResponseReceiver = oneshot::Receiver<Result<Response>>;

/// Tracker for in-flight DAP requests.
pub(crate) struct PendingRequests {
    pending: HashMap<Seq, oneshot::Sender<Result<Response>>>,
    closed: bool,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self {
            pending: HashMap::new(),
            closed: false,
        }
    }

    /// Register interest in the response to `seq`.
    ///
    /// Fails once the table has been closed, so nothing registered after
    /// teardown can wait forever.
    pub(crate) fn register(&mut self, seq: Seq) -> Result<ResponseReceiver> {
        if self.closed {
            return Err(Error::ConnectionClosed);
        }
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);
        Ok(rx)
    }

    /// Deliver a response to whoever is waiting on its `request_seq`.
    ///
    /// Returns false when no entry matched.
    pub(crate) fn resolve(&mut self, response: Response) -> bool {
        let seq = response.request_seq;
        self.settle(seq, Ok(response))
    }

    /// Drop the entry for `seq` without delivering anything.
    pub(crate) fn cancel(&mut self, seq: Seq) {
        self.pending.remove(&seq);
    }

    /// Fail every outstanding entry and refuse new ones. Returns how many
    /// callers were released.
    pub(crate) fn close(&mut self) -> usize {
        self.closed = true;
        let seqs: Vec<Seq> = self.pending.keys().copied().collect();
        seqs.into_iter()
            .filter(|seq| self.settle(*seq, Err(Error::ConnectionClosed)))
            .count()
    }

    fn settle(&mut self, seq: Seq, outcome: Result<Response>) -> bool {
        match self.pending.remove(&seq) {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    tracing::debug!(seq, "caller stopped waiting for response");
                }
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_seq: Seq) -> Response {
        Response {
            seq: 100 + request_seq,
            request_seq,
            success: true,
            command: "threads".to_string(),
            message: None,
            body: None,
        }
    }

    #[tokio::test]
    async fn resolves_matching_entry_once() {
        let mut pending = PendingRequests::new();
        let rx = pending.register(1).unwrap();

        assert!(pending.resolve(response(1)));
        assert!(!pending.resolve(response(1)));

        let delivered = rx.await.unwrap().unwrap();
        assert_eq!(delivered.request_seq, 1);
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn unknown_response_is_reported() {
        let mut pending = PendingRequests::new();
        assert!(!pending.resolve(response(9)));
    }

    #[tokio::test]
    async fn close_fails_everything_and_refuses_new_entries() {
        let mut pending = PendingRequests::new();
        let a = pending.register(1).unwrap();
        let b = pending.register(2).unwrap();

        assert_eq!(pending.close(), 2);
        assert!(matches!(a.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(b.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(pending.register(3), Err(Error::ConnectionClosed)));
        assert_eq!(pending.close(), 0);
    }

    #[test]
    fn resolving_for_a_dropped_caller_still_removes_entry() {
        let mut pending = PendingRequests::new();
        drop(pending.register(4).unwrap());

        assert!(pending.resolve(response(4)));
        assert_eq!(pending.len(), 0);
    }
}
