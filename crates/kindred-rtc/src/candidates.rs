//! Buffer for remote candidates that arrive before the remote description.

use std::collections::{HashSet, VecDeque};
use std::future::Future;

use kindred_common::models::Candidate;
use tracing::warn;

use crate::error::EngineError;

/// Result of a [`CandidateQueue::flush`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub applied: usize,
    pub failed: usize,
}

/// FIFO of pending candidates with content-based dedupe.
///
/// A candidate is "known" from the moment it is queued or successfully
/// applied; known candidates are rejected on redelivery. A candidate whose
/// application failed is forgotten so a later copy can try again.
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: VecDeque<Candidate>,
    seen: HashSet<String>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn is_known(&self, candidate: &Candidate) -> bool {
        self.seen.contains(&candidate.signature())
    }

    /// Buffer a candidate. Returns false for a duplicate.
    pub fn enqueue(&mut self, candidate: Candidate) -> bool {
        if !self.seen.insert(candidate.signature()) {
            return false;
        }
        self.pending.push_back(candidate);
        true
    }

    /// Record a candidate applied directly, bypassing the buffer. Returns
    /// false for a duplicate.
    pub fn mark_applied(&mut self, candidate: &Candidate) -> bool {
        self.seen.insert(candidate.signature())
    }

    /// Drop a candidate from the known set after a failed application.
    pub fn forget(&mut self, candidate: &Candidate) {
        self.seen.remove(&candidate.signature());
    }

    /// Apply every buffered candidate in arrival order, then clear the buffer.
    /// Failures are logged and do not stop the flush.
    pub async fn flush<F, Fut>(&mut self, mut apply: F) -> FlushReport
    where
        F: FnMut(Candidate) -> Fut,
        Fut: Future<Output = Result<(), EngineError>>,
    {
        let mut report = FlushReport::default();
        let batch: Vec<Candidate> = self.pending.drain(..).collect();
        for candidate in batch {
            let signature = candidate.signature();
            match apply(candidate).await {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(error = %e, "Buffered candidate rejected");
                    self.seen.remove(&signature);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Drop buffered candidates and forget everything seen.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn candidate(n: u16) -> Candidate {
        Candidate::new(
            format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"),
            Some("0".into()),
            Some(0),
        )
    }

    #[tokio::test]
    async fn flush_applies_in_arrival_order_once() {
        let mut queue = CandidateQueue::new();
        for n in [3, 1, 2] {
            assert!(queue.enqueue(candidate(n)));
        }

        let applied = Arc::new(Mutex::new(Vec::new()));
        let sink = applied.clone();
        let report = queue
            .flush(|c| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(c);
                    Ok(())
                }
            })
            .await;

        assert_eq!(report, FlushReport { applied: 3, failed: 0 });
        assert_eq!(*applied.lock().unwrap(), vec![candidate(3), candidate(1), candidate(2)]);
        assert!(queue.is_empty());

        let again = queue.flush(|_| async { Ok(()) }).await;
        assert_eq!(again, FlushReport::default());
    }

    #[test]
    fn duplicates_are_rejected() {
        let mut queue = CandidateQueue::new();
        assert!(queue.enqueue(candidate(1)));
        assert!(!queue.enqueue(candidate(1)));
        assert!(!queue.mark_applied(&candidate(1)));
        assert_eq!(queue.len(), 1);

        assert!(queue.mark_applied(&candidate(2)));
        assert!(queue.is_known(&candidate(2)));
    }

    #[tokio::test]
    async fn failures_do_not_abort_the_flush() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.enqueue(candidate(2));
        queue.enqueue(candidate(3));

        let report = queue
            .flush(|c| async move {
                if c == candidate(2) {
                    Err(EngineError::operation("addIceCandidate", "bad candidate"))
                } else {
                    Ok(())
                }
            })
            .await;

        assert_eq!(report, FlushReport { applied: 2, failed: 1 });
        // The failed one may be retried on redelivery.
        assert!(!queue.is_known(&candidate(2)));
        assert!(queue.is_known(&candidate(1)));
    }

    #[test]
    fn clear_forgets_everything() {
        let mut queue = CandidateQueue::new();
        queue.enqueue(candidate(1));
        queue.clear();
        assert!(queue.is_empty());
        assert!(queue.enqueue(candidate(1)));
    }
}
