//! Quota reservations
//!
//! A reservation is debited from the token before dispatch and later either
//! settled against the real cost or refunded in full. Whichever of the two
//! claims the reservation first does the work; later calls are no-ops, so a
//! reservation can never be returned twice.
//!
//! Ledger totals satisfy `reserved == settled + refunded + outstanding` at all
//! quiescent points. Overage beyond the reservation is tracked separately.

use crate::model::TokenId;
use crate::store::{StoreError, TokenStore};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("token {token_id} cannot cover {requested} quota")]
    InsufficientQuota { token_id: TokenId, requested: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handle to quota held for one relay attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    id: u64,
    token_id: TokenId,
    amount: i64,
}

impl Reservation {
    pub fn token_id(&self) -> TokenId {
        self.token_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }
}

/// What a settlement did to the token balance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Settlement {
    /// Total debited for the request, reservation included
    pub charged: i64,

    /// Part of the reservation given back
    pub refunded: i64,

    /// Cost that could not be collected from a drained balance
    pub unpaid: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LedgerTotals {
    pub reserved: i64,
    pub settled: i64,
    pub refunded: i64,
    pub overage_charged: i64,
    pub overage_unpaid: i64,
    pub outstanding: i64,
}

#[derive(Default)]
struct Counters {
    reserved: AtomicI64,
    settled: AtomicI64,
    refunded: AtomicI64,
    overage_charged: AtomicI64,
    overage_unpaid: AtomicI64,
    outstanding: AtomicI64,
}

pub struct QuotaLedger {
    store: Arc<dyn TokenStore>,
    open: DashMap<u64, Reservation>,
    next_id: AtomicU64,
    counters: Counters,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self {
            store,
            open: DashMap::new(),
            next_id: AtomicU64::new(1),
            counters: Counters::default(),
        }
    }

    /// Debit `estimate` from the token, failing with the balance untouched
    /// when a limited token cannot cover it. Negative estimates reserve zero.
    pub async fn reserve(
        &self,
        token_id: TokenId,
        estimate: i64,
    ) -> Result<Reservation, LedgerError> {
        let amount = estimate.max(0);
        if amount > 0 && !self.store.try_debit(token_id, amount).await? {
            debug!("Token {} cannot cover reservation of {}", token_id, amount);
            return Err(LedgerError::InsufficientQuota {
                token_id,
                requested: amount,
            });
        }

        let reservation = Reservation {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            token_id,
            amount,
        };
        self.counters.reserved.fetch_add(amount, Ordering::AcqRel);
        self.counters.outstanding.fetch_add(amount, Ordering::AcqRel);
        self.open.insert(reservation.id, reservation.clone());
        Ok(reservation)
    }

    /// Reserve and wrap the result in a guard that refunds on drop
    pub async fn reserve_guarded(
        self: &Arc<Self>,
        token_id: TokenId,
        estimate: i64,
    ) -> Result<ReservationGuard, LedgerError> {
        let reservation = self.reserve(token_id, estimate).await?;
        Ok(ReservationGuard {
            ledger: Arc::clone(self),
            reservation: Some(reservation),
        })
    }

    fn claim(&self, reservation: &Reservation) -> Option<Reservation> {
        let (_, claimed) = self.open.remove(&reservation.id)?;
        self.counters
            .outstanding
            .fetch_sub(claimed.amount, Ordering::AcqRel);
        Some(claimed)
    }

    /// Convert the reservation into a charge of `actual`.
    ///
    /// Returns `None` when the reservation was already settled or refunded.
    pub async fn settle(
        &self,
        reservation: &Reservation,
        actual: i64,
    ) -> Result<Option<Settlement>, LedgerError> {
        let Some(claimed) = self.claim(reservation) else {
            return Ok(None);
        };
        let actual = actual.max(0);
        let token_id = claimed.token_id;

        let settlement = if actual <= claimed.amount {
            let excess = claimed.amount - actual;
            if excess > 0 {
                if let Err(e) = self.store.credit(token_id, excess).await {
                    // The balance kept the whole reservation
                    self.counters
                        .settled
                        .fetch_add(claimed.amount, Ordering::AcqRel);
                    error!("Failed to return {} quota to token {}: {}", excess, token_id, e);
                    return Err(e.into());
                }
            }
            self.counters.settled.fetch_add(actual, Ordering::AcqRel);
            self.counters.refunded.fetch_add(excess, Ordering::AcqRel);
            Settlement {
                charged: actual,
                refunded: excess,
                unpaid: 0,
            }
        } else {
            self.counters
                .settled
                .fetch_add(claimed.amount, Ordering::AcqRel);
            let overage = actual - claimed.amount;
            let collected = self.store.debit_up_to(token_id, overage).await?;
            self.counters
                .overage_charged
                .fetch_add(collected, Ordering::AcqRel);
            let unpaid = overage - collected;
            if unpaid > 0 {
                self.counters
                    .overage_unpaid
                    .fetch_add(unpaid, Ordering::AcqRel);
                warn!(
                    "Token {} could not cover {} of {} quota overage",
                    token_id, unpaid, overage
                );
            }
            Settlement {
                charged: claimed.amount + collected,
                refunded: 0,
                unpaid,
            }
        };

        if self.store.mark_exhausted_if_empty(token_id).await? {
            info!("Token {} quota exhausted", token_id);
        }
        Ok(Some(settlement))
    }

    /// Return the whole reservation. Returns `false` if it was already claimed.
    pub async fn refund(&self, reservation: &Reservation) -> Result<bool, LedgerError> {
        let Some(claimed) = self.claim(reservation) else {
            return Ok(false);
        };
        if claimed.amount > 0 {
            if let Err(e) = self.store.credit(claimed.token_id, claimed.amount).await {
                self.counters
                    .settled
                    .fetch_add(claimed.amount, Ordering::AcqRel);
                error!(
                    "Failed to refund {} quota to token {}: {}",
                    claimed.amount, claimed.token_id, e
                );
                return Err(e.into());
            }
        }
        self.counters
            .refunded
            .fetch_add(claimed.amount, Ordering::AcqRel);
        Ok(true)
    }

    pub fn totals(&self) -> LedgerTotals {
        LedgerTotals {
            reserved: self.counters.reserved.load(Ordering::Acquire),
            settled: self.counters.settled.load(Ordering::Acquire),
            refunded: self.counters.refunded.load(Ordering::Acquire),
            overage_charged: self.counters.overage_charged.load(Ordering::Acquire),
            overage_unpaid: self.counters.overage_unpaid.load(Ordering::Acquire),
            outstanding: self.counters.outstanding.load(Ordering::Acquire),
        }
    }

    /// Number of reservations neither settled nor refunded yet
    pub fn open_reservations(&self) -> usize {
        self.open.len()
    }
}

impl std::fmt::Debug for QuotaLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuotaLedger")
            .field("open", &self.open.len())
            .field("totals", &self.totals())
            .finish()
    }
}

/// Owns a reservation and refunds it when dropped unclaimed
#[derive(Debug)]
pub struct ReservationGuard {
    ledger: Arc<QuotaLedger>,
    reservation: Option<Reservation>,
}

impl ReservationGuard {
    pub fn amount(&self) -> i64 {
        self.reservation.as_ref().map_or(0, Reservation::amount)
    }

    pub async fn settle(mut self, actual: i64) -> Result<Option<Settlement>, LedgerError> {
        match self.reservation.take() {
            Some(reservation) => self.ledger.settle(&reservation, actual).await,
            None => Ok(None),
        }
    }

    pub async fn refund(mut self) -> Result<bool, LedgerError> {
        match self.reservation.take() {
            Some(reservation) => self.ledger.refund(&reservation).await,
            None => Ok(false),
        }
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ledger = Arc::clone(&self.ledger);
                handle.spawn(async move {
                    if let Err(e) = ledger.refund(&reservation).await {
                        error!("Refund of dropped reservation failed: {}", e);
                    }
                });
            }
            Err(_) => warn!(
                "Reservation of {} for token {} dropped outside a runtime; left outstanding",
                reservation.amount, reservation.token_id
            ),
        }
    }
}
