//! Per-subscriber batching.
//!
//! A batch is flushed when it holds `batch_size` messages or when
//! `flush_delay` has passed since its first message, whichever is first.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::codec::PushEnvelope;

/// Collects queued envelopes into frames.
///
/// Partial batches live in the batcher, not in the future, so
/// [`Batcher::next_batch`] can be dropped inside `select!` without losing
/// messages.
#[derive(Debug)]
pub struct Batcher {
    batch_size: usize,
    flush_delay: Duration,
    pending: Vec<PushEnvelope>,
    deadline: Option<Instant>,
}

impl Batcher {
    pub fn new(batch_size: usize, flush_delay: Duration) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            flush_delay,
            pending: Vec::with_capacity(batch_size),
            deadline: None,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Add one envelope. Returns `true` when the batch is full.
    pub fn push(&mut self, envelope: PushEnvelope, now: Instant) -> bool {
        if self.pending.is_empty() {
            self.deadline = Some(now + self.flush_delay);
        }
        self.pending.push(envelope);
        self.pending.len() >= self.batch_size
    }

    pub fn take(&mut self) -> Vec<PushEnvelope> {
        self.deadline = None;
        std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size))
    }

    /// Wait for the next batch to be due. Returns `None` once the queue is
    /// closed and nothing is left to send.
    pub async fn next_batch(
        &mut self,
        rx: &mut mpsc::Receiver<PushEnvelope>,
    ) -> Option<Vec<PushEnvelope>> {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                received = rx.recv() => match received {
                    Some(envelope) => {
                        if self.push(envelope, Instant::now()) {
                            return Some(self.take());
                        }
                    }
                    None if self.pending.is_empty() => return None,
                    None => return Some(self.take()),
                },
                _ = crate::sleep_until_opt(deadline) => return Some(self.take()),
            }
        }
    }

    /// Everything still buffered or queued, for a final flush on shutdown
    pub fn drain(&mut self, rx: &mut mpsc::Receiver<PushEnvelope>) -> Vec<PushEnvelope> {
        while let Ok(envelope) = rx.try_recv() {
            self.pending.push(envelope);
        }
        self.take()
    }
}
