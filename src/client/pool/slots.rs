use std::time::{Duration, Instant};

use tracing::trace;

use crate::client::conn::Connection;

#[derive(Debug)]
struct Idle<T> {
    at: Instant,
    inner: T,
}

impl<T> Idle<T> {
    fn new(inner: T) -> Self {
        Self {
            at: Instant::now(),
            inner,
        }
    }
}

/// Bounded LIFO queue of connection slots.
///
/// A slot holds either an idle connection or a placeholder (`None`) standing for a
/// connection which has not been created yet. A new queue is full of placeholders, so
/// the number of slots plus the number of checked out connections is the pool size.
#[derive(Debug)]
pub(super) struct Slots {
    inner: Vec<Idle<Option<Connection>>>,
    capacity: usize,
}

impl Slots {
    pub(super) fn with_placeholders(capacity: usize) -> Self {
        let inner = (0..capacity).map(|_| Idle::new(None)).collect();
        Self { inner, capacity }
    }

    /// Take the most recently returned slot.
    ///
    /// Connections idle for longer than `idle_timeout` are reset, so they reconnect
    /// before use.
    pub(super) fn pop(&mut self, idle_timeout: Option<Duration>) -> Option<Option<Connection>> {
        let entry = self.inner.pop()?;
        let expired = idle_timeout
            .filter(|timeout| !timeout.is_zero())
            .map_or(false, |timeout| entry.at.elapsed() > timeout);

        let mut slot = entry.inner;
        if let Some(conn) = slot.as_mut() {
            if expired && conn.is_connected() {
                trace!("found expired connection");
                conn.reset();
            } else {
                trace!("found idle connection");
            }
        }
        Some(slot)
    }

    /// Return a slot. Fails with the slot when the queue is already full.
    pub(super) fn push(&mut self, slot: Option<Connection>) -> Result<(), Option<Connection>> {
        if self.inner.len() >= self.capacity {
            return Err(slot);
        }
        self.inner.push(Idle::new(slot));
        Ok(())
    }

    pub(super) fn len(&self) -> usize {
        self.inner.len()
    }

    /// Remove every connection, leaving the queue empty.
    pub(super) fn drain(&mut self) -> impl Iterator<Item = Connection> + '_ {
        self.inner.drain(..).filter_map(|idle| idle.inner)
    }
}
