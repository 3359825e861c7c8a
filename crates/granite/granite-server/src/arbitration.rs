//! Ownership of the single IBKR TWS session.
//!
//! ```text
//!            acquire (not downloading)
//!   FREE ───────────────────────────────► HELD(owner)
//!    ▲   ◄─── release(owner) ───────────      │
//!    │   ◄─── owner disconnects ────────      │ acquire(other)   → CONFLICT
//!    │   ◄─── session lost (push) ──────      │ release(other)   → CONFLICT
//!    └── release → BAD_REQUEST                │ acquire(owner)   → acquired
//! ```
//!
//! The state lives behind one mutex. Collaborator side effects are decided
//! here but performed by the caller, off the lock.

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::protocol::release_requested_line;

pub type ConnId = u64;

/// Outbound line queue of one connection, bounded by the outbox depth.
pub type Outbox = mpsc::Sender<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Free,
    Held(ConnId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Ownership moved to the caller; the collaborator must disconnect.
    Acquired,
    AlreadyOwner,
    Denied,
    Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// Back to FREE; the collaborator must reconnect.
    Released,
    NotHeld,
    NotOwner,
}

struct Holder {
    conn: ConnId,
    outbox: Outbox,
}

#[derive(Default)]
pub struct Arbiter {
    holder: Mutex<Option<Holder>>,
}

impl Arbiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ownership(&self) -> Ownership {
        match &*self.holder.lock() {
            Some(h) => Ownership::Held(h.conn),
            None => Ownership::Free,
        }
    }

    /// `downloading` is consulted only when the session is free.
    pub fn acquire(
        &self,
        conn: ConnId,
        outbox: &Outbox,
        downloading: impl FnOnce() -> bool,
    ) -> AcquireOutcome {
        let mut holder = self.holder.lock();
        match &*holder {
            Some(h) if h.conn == conn => AcquireOutcome::AlreadyOwner,
            Some(_) => AcquireOutcome::Conflict,
            None if downloading() => AcquireOutcome::Denied,
            None => {
                *holder = Some(Holder {
                    conn,
                    outbox: outbox.clone(),
                });
                AcquireOutcome::Acquired
            }
        }
    }

    pub fn release(&self, conn: ConnId) -> ReleaseOutcome {
        let mut holder = self.holder.lock();
        match &*holder {
            None => ReleaseOutcome::NotHeld,
            Some(h) if h.conn != conn => ReleaseOutcome::NotOwner,
            Some(_) => {
                *holder = None;
                ReleaseOutcome::Released
            }
        }
    }

    /// Session lost under the owner: push `release_requested` to it and go
    /// FREE. Returns the former owner. The push never waits; it is dropped
    /// when the owner's outbox is full.
    pub fn connection_lost(&self) -> Option<ConnId> {
        let h = self.holder.lock().take()?;
        match h.outbox.try_send(release_requested_line()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(conn = h.conn, "owner outbox full; release_requested dropped");
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(conn = h.conn, "owner gone before release_requested push");
            }
        }
        Some(h.conn)
    }

    /// Connection `conn` closed. True when it was the owner.
    pub fn disconnected(&self, conn: ConnId) -> bool {
        let mut holder = self.holder.lock();
        if holder.as_ref().is_some_and(|h| h.conn == conn) {
            *holder = None;
            return true;
        }
        false
    }
}
