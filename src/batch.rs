// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Batch Accumulation
//!
//! Buffers deliveries of a batch consumer until either `size` envelopes are
//! collected or the deadline armed by the first envelope elapses.
//!
//! ```text
//! Idle ──push──► Accumulating ──size reached──► flushed batch, Idle
//!                     │
//!                     └──deadline elapsed──► flushed (partial) batch, Idle
//! ```
//!
//! The accumulator owns no timer. The dispatch loop sleeps until
//! [`BatchAccumulator::deadline`] and calls [`BatchAccumulator::flush_expired`];
//! a size flush clears the deadline, so no stale wakeup can flush twice.

use crate::envelope::DeliveryEnvelope;
use std::time::Duration;
use tokio::time::Instant;

/// Flush deadline used when a batch consumer sets a size but no timeout.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Envelopes flushed together, in arrival order.
#[derive(Debug)]
pub struct Batch {
    pub envelopes: Vec<DeliveryEnvelope>,
    pub deadline: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.envelopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty()
    }
}

#[derive(Debug)]
pub struct BatchAccumulator {
    size: usize,
    timeout: Duration,
    pending: Option<Batch>,
}

impl BatchAccumulator {
    pub fn new(size: usize, timeout: Duration) -> Self {
        BatchAccumulator {
            size: size.max(1),
            timeout,
            pending: None,
        }
    }

    /// Adds `envelope`; returns the batch when it reached its size.
    pub fn push(&mut self, envelope: DeliveryEnvelope, now: Instant) -> Option<Batch> {
        let timeout = self.timeout;
        let batch = self.pending.get_or_insert_with(|| Batch {
            envelopes: Vec::new(),
            deadline: now + timeout,
        });

        batch.envelopes.push(envelope);

        if batch.envelopes.len() >= self.size {
            return self.pending.take();
        }

        None
    }

    /// Deadline of the batch being accumulated, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending.as_ref().map(|batch| batch.deadline)
    }

    /// Returns the pending batch if its deadline elapsed at `now`.
    pub fn flush_expired(&mut self, now: Instant) -> Option<Batch> {
        match &self.pending {
            Some(batch) if batch.deadline <= now => self.pending.take(),
            _ => None,
        }
    }

    /// Takes whatever is pending, regardless of deadline.
    pub fn take(&mut self) -> Option<Batch> {
        self.pending.take()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, Batch::len)
    }
}
