//! Nonce manager for signed transactions.
//!
//! Lighter keeps one nonce sequence per (account, API key index). The
//! exchange holds the authoritative "next nonce"; the connector mirrors it
//! locally so concurrent submissions can allocate without a round trip.
//!
//! # Guarantees
//! - Each key index issues strictly increasing, never repeated values
//! - No value is issued before the sequence has been synchronized with
//!   the exchange
//! - Synchronization only ever moves the local counter forward

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use lighter_core::BoxFuture;
use tracing::{debug, warn};

use crate::error::{SigningError, SigningResult};

/// Source of the exchange's authoritative next nonce.
pub trait NonceSource: Send + Sync {
    fn fetch_next_nonce(&self, account_index: u64, api_key_index: u8)
        -> BoxFuture<'_, SigningResult<u64>>;
}

#[derive(Debug, Default)]
struct NonceSlot {
    /// Next value to hand out.
    next: AtomicU64,
    synced: AtomicBool,
}

/// Per-key-index nonce sequences.
#[derive(Debug, Default)]
pub struct NonceManager {
    slots: DashMap<u8, Arc<NonceSlot>>,
}

impl NonceManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, api_key_index: u8) -> Arc<NonceSlot> {
        self.slots
            .entry(api_key_index)
            .or_insert_with(|| Arc::new(NonceSlot::default()))
            .clone()
    }

    /// Adopt the exchange's next nonce for `api_key_index`.
    ///
    /// Returns the value the next allocation will produce. If the exchange
    /// reports a value below what has already been issued locally the local
    /// counter is kept, since those values may already be signed.
    pub fn sync(&self, api_key_index: u8, exchange_next: u64) -> u64 {
        let slot = self.slot(api_key_index);
        let mut current = slot.next.load(Ordering::Acquire);
        loop {
            if exchange_next <= current {
                if exchange_next < current && slot.synced.load(Ordering::Acquire) {
                    warn!(
                        api_key_index,
                        exchange_next,
                        local_next = current,
                        "Exchange nonce behind local sequence, keeping local"
                    );
                }
                break;
            }
            match slot.next.compare_exchange_weak(
                current,
                exchange_next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    current = exchange_next;
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        slot.synced.store(true, Ordering::Release);
        debug!(api_key_index, next_nonce = current, "Nonce sequence synchronized");
        current
    }

    /// Allocate the next nonce for `api_key_index`.
    ///
    /// Thread-safe via CAS loop; concurrent callers observe one serialized
    /// sequence.
    pub fn next(&self, api_key_index: u8) -> SigningResult<u64> {
        let slot = self.slot(api_key_index);
        if !slot.synced.load(Ordering::Acquire) {
            return Err(SigningError::NonceNotSynced { api_key_index });
        }

        loop {
            let current = slot.next.load(Ordering::Acquire);
            let following = current
                .checked_add(1)
                .ok_or(SigningError::NonceExhausted { api_key_index })?;

            if slot
                .next
                .compare_exchange_weak(current, following, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current);
            }
        }
    }

    /// Return `nonce` to the sequence if it is the most recent allocation.
    ///
    /// Only valid when nothing carrying it reached the exchange. Returns false if another
    /// allocation happened in between, in which case the value is skipped.
    pub fn release(&self, api_key_index: u8, nonce: u64) -> bool {
        let Some(after) = nonce.checked_add(1) else {
            return false;
        };
        let slot = self.slot(api_key_index);
        let released = slot
            .next
            .compare_exchange(after, nonce, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if !released {
            debug!(api_key_index, nonce, "Nonce not released, sequence moved on");
        }
        released
    }

    /// Block further allocation until the next `sync`.
    pub fn invalidate(&self, api_key_index: u8) {
        self.slot(api_key_index)
            .synced
            .store(false, Ordering::Release);
    }

    #[must_use]
    pub fn is_synced(&self, api_key_index: u8) -> bool {
        self.slots
            .get(&api_key_index)
            .map(|s| s.synced.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Value the next allocation would return, without allocating.
    #[must_use]
    pub fn peek(&self, api_key_index: u8) -> Option<u64> {
        self.slots
            .get(&api_key_index)
            .filter(|s| s.synced.load(Ordering::Acquire))
            .map(|s| s.next.load(Ordering::Acquire))
    }
}
