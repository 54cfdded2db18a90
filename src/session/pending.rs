//! Single-slot request/response correlation
//!
//! A caller installs a [`PendingRequest`] describing which message kinds it
//! waits for, publishes its command, then blocks in [`RequestSlot::wait`].
//! The router offers every decoded message to the slot. Install, offer,
//! cancel, abort and the waiter's teardown all happen under one mutex, so
//! exactly one of them decides the outcome.

use crate::error::SessionError;
use crate::mqtt::message_manager::{DeviceMessage, MessageKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

// Deadline used when `now + timeout` does not fit in an `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Message kinds a pending request waits for, each seen once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Predicate {
    kinds: Vec<MessageKind>,
}

impl Predicate {
    pub fn kind(kind: MessageKind) -> Self {
        Self { kinds: vec![kind] }
    }

    pub fn all_of(kinds: impl IntoIterator<Item = MessageKind>) -> Self {
        let mut unique = Vec::new();
        for kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        Self { kinds: unique }
    }

    pub fn matches(&self, kind: MessageKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> &[MessageKind] {
        &self.kinds
    }
}

/// Messages collected for one request
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub messages: Vec<DeviceMessage>,
    /// Every kind named by the predicate arrived before the deadline
    pub complete: bool,
}

impl Delivery {
    pub fn first(&self, kind: MessageKind) -> Option<&DeviceMessage> {
        self.messages.iter().find(|m| m.kind() == kind)
    }
}

/// Handle identifying the caller's registration
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    id: u64,
    deadline: Instant,
    timeout: Duration,
}

impl Ticket {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[derive(Debug)]
struct PendingRequest {
    id: u64,
    predicate: Predicate,
    deadline: Instant,
    delivered: Vec<DeviceMessage>,
    aborted: bool,
}

impl PendingRequest {
    fn has(&self, kind: MessageKind) -> bool {
        self.delivered.iter().any(|m| m.kind() == kind)
    }

    fn is_satisfied(&self) -> bool {
        self.predicate.kinds().iter().all(|kind| self.has(*kind))
    }
}

/// The session's single pending-request slot
#[derive(Debug, Default)]
pub struct RequestSlot {
    pending: Mutex<Option<PendingRequest>>,
    signal: Condvar,
    next_id: AtomicU64,
}

impl RequestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a new request, failing fast while another one is in flight
    pub fn install(&self, predicate: Predicate, timeout: Duration) -> Result<Ticket, SessionError> {
        let mut pending = self.lock();
        if pending.is_some() {
            warn!("Rejecting request, another one is still pending");
            return Err(SessionError::Busy);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or_else(|| {
            debug!("Timeout {:?} exceeds the clock range, clamping", timeout);
            now + FAR_FUTURE
        });
        debug!(
            "Installed request {} waiting for {:?} within {:?}",
            id,
            predicate.kinds(),
            timeout
        );
        *pending = Some(PendingRequest {
            id,
            predicate,
            deadline,
            delivered: Vec::new(),
            aborted: false,
        });

        Ok(Ticket {
            id,
            deadline,
            timeout,
        })
    }

    /// Offers a routed message to the pending request
    ///
    /// Returns true when the message was recorded. A kind that was already
    /// delivered, a message past the deadline, or no request at all are
    /// no-ops.
    pub fn offer(&self, message: &DeviceMessage) -> bool {
        let mut pending = self.lock();
        let Some(request) = pending.as_mut() else {
            return false;
        };

        let kind = message.kind();
        if request.aborted
            || Instant::now() >= request.deadline
            || !request.predicate.matches(kind)
            || request.has(kind)
        {
            return false;
        }

        request.delivered.push(message.clone());
        debug!("Delivered {:?} to request {}", kind, request.id);
        if request.is_satisfied() {
            self.signal.notify_all();
        }
        true
    }

    /// Blocks until the request is satisfied, aborted, cancelled or expired
    ///
    /// The registration is always torn down before returning. Reaching the
    /// deadline with nothing delivered is a [`SessionError::Timeout`]; with
    /// some but not all kinds delivered it is an incomplete [`Delivery`].
    pub fn wait(&self, ticket: &Ticket) -> Result<Delivery, SessionError> {
        let mut pending = self.lock();
        loop {
            let Some(request) = pending.as_ref().filter(|r| r.id == ticket.id) else {
                debug!("Request {} was cancelled while waiting", ticket.id);
                return Err(SessionError::Cancelled);
            };
            if request.aborted || request.is_satisfied() {
                break;
            }

            let now = Instant::now();
            if now >= ticket.deadline {
                break;
            }
            let (guard, _) = self
                .signal
                .wait_timeout(pending, ticket.deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            pending = guard;
        }

        let Some(request) = pending.take() else {
            return Err(SessionError::Cancelled);
        };
        drop(pending);

        if request.aborted {
            info!("Request {} aborted by disconnect", request.id);
            return Err(SessionError::Disconnected);
        }

        let complete = request.is_satisfied();
        if request.delivered.is_empty() {
            info!("Request {} timed out after {:?}", request.id, ticket.timeout);
            return Err(SessionError::Timeout(ticket.timeout));
        }
        if !complete {
            warn!(
                "Request {} expired with {} of {} expected messages",
                request.id,
                request.delivered.len(),
                request.predicate.kinds().len()
            );
        }

        Ok(Delivery {
            messages: request.delivered,
            complete,
        })
    }

    /// Removes the registration if it still belongs to `ticket_id`
    pub fn cancel(&self, ticket_id: u64) -> bool {
        let mut pending = self.lock();
        if pending.as_ref().is_some_and(|r| r.id == ticket_id) {
            *pending = None;
            self.signal.notify_all();
            debug!("Cancelled request {}", ticket_id);
            true
        } else {
            false
        }
    }

    /// Fails the pending request, if any, with [`SessionError::Disconnected`]
    pub fn abort(&self) {
        let mut pending = self.lock();
        if let Some(request) = pending.as_mut() {
            request.aborted = true;
            self.signal.notify_all();
            info!("Aborting pending request {}", request.id);
        }
    }

    pub fn is_pending(&self) -> bool {
        self.lock().is_some()
    }
}

/// Cancels a registration when dropped, used by async callers that may give up early
#[derive(Debug)]
pub(crate) struct CancelOnDrop {
    slot: Arc<RequestSlot>,
    ticket_id: u64,
}

impl CancelOnDrop {
    pub(crate) fn new(slot: Arc<RequestSlot>, ticket_id: u64) -> Self {
        Self { slot, ticket_id }
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.slot.cancel(self.ticket_id);
    }
}
