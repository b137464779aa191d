//! Routing of acks between connections.
//!
//! A receiver's acks are preferably carried inside the data frames that flow in the opposite
//!  direction. The envelope's `partner_index` tells the process receiving such a frame which of
//!  its senders the ack belongs to, and the [PiggybackRegistry] maps that index to the sender's
//!  inbox.
//!
//! Acks are passed as immutable values through an inbox rather than applied to the target
//!  sender directly. A receive loop that dispatches an ack therefore never touches another
//!  connection's lock, which rules out lock ordering problems between connections.

use crate::ack::AckBlock;
use crate::frame_header::PiggybackEnvelope;
use anyhow::bail;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

pub type AckInbox = mpsc::UnboundedReceiver<AckBlock>;

#[derive(Default)]
pub struct PiggybackRegistry {
    next_index: AtomicU32,
    inboxes: RwLock<FxHashMap<u32, mpsc::UnboundedSender<AckBlock>>>,
}

impl PiggybackRegistry {
    pub fn new() -> PiggybackRegistry {
        Default::default()
    }

    /// Allocate a partner index for a new connection. The index is communicated to the peer
    ///  during connection setup, and the peer puts it into the envelopes it sends.
    pub fn allocate_index(&self) -> u32 {
        loop {
            let index = self.next_index.fetch_add(1, Ordering::Relaxed);
            if index != PiggybackEnvelope::NO_PARTNER {
                return index;
            }
        }
    }

    pub fn register(&self, index: u32) -> anyhow::Result<AckInbox> {
        if index == PiggybackEnvelope::NO_PARTNER {
            bail!("partner index {} is reserved for frames without ack", index);
        }

        let mut inboxes = self.inboxes.write().unwrap_or_else(PoisonError::into_inner);
        if inboxes.contains_key(&index) {
            bail!("partner index {} is already registered", index);
        }

        let (send, recv) = mpsc::unbounded_channel();
        inboxes.insert(index, send);
        debug!("registered partner index {}", index);
        Ok(recv)
    }

    pub fn deregister(&self, index: u32) {
        if self.inboxes.write().unwrap_or_else(PoisonError::into_inner).remove(&index).is_some() {
            debug!("deregistered partner index {}", index);
        }
    }

    /// Forward an ack to the sender registered for the envelope's partner index. Returns
    ///  `false` if there is no such sender: the ack is dropped then, and the peer's receiver
    ///  will report the same information again later.
    pub fn dispatch(&self, envelope: &PiggybackEnvelope) -> bool {
        if envelope.is_empty() {
            return true;
        }

        let inbox = self.inboxes.read().unwrap_or_else(PoisonError::into_inner)
            .get(&envelope.partner_index)
            .cloned();

        match inbox {
            Some(inbox) => {
                if inbox.send(envelope.ack).is_ok() {
                    trace!("dispatched ack {:?} to partner index {}", envelope.ack, envelope.partner_index);
                    true
                }
                else {
                    debug!("inbox for partner index {} is closed - dropping ack", envelope.partner_index);
                    false
                }
            }
            None => {
                debug!("no sender registered for partner index {} - dropping ack", envelope.partner_index);
                false
            }
        }
    }
}

/// The place where a receiver leaves its most recent ack for the next data frame sent in the
///  opposite direction. There is room for one envelope only: a newer ack always supersedes an
///  older one.
#[derive(Default)]
pub struct PiggybackSlot {
    pending: Mutex<Option<PiggybackEnvelope>>,
}

impl PiggybackSlot {
    pub fn offer(&self, envelope: PiggybackEnvelope) {
        *self.pending.lock().unwrap_or_else(PoisonError::into_inner) = Some(envelope);
    }

    pub fn take(&self) -> Option<PiggybackEnvelope> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Put back an envelope that was taken but could not be sent, unless a newer one was
    ///  offered in the meantime
    pub fn restore_if_empty(&self, envelope: PiggybackEnvelope) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if pending.is_none() {
            *pending = Some(envelope);
        }
    }
}
