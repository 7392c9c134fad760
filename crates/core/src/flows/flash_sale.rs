use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::flash_sale::{FlashSaleProposal, NewProposal, ProposalId, ProposalStatus};
use crate::errors::ErrorCode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlashSaleEvent {
    Accept,
    Reject,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FlashSaleError {
    #[error("flash sale proposal {0} was not found")]
    NotFound(ProposalId),
    #[error("flash sale proposal {id} is already {status:?}")]
    AlreadyResolved { id: ProposalId, status: ProposalStatus },
    #[error("flash sale proposal {0} has expired")]
    Expired(ProposalId),
}

impl FlashSaleError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound(_) => ErrorCode::ProposalNotFound,
            Self::AlreadyResolved { .. } => ErrorCode::AlreadyResolved,
            Self::Expired(_) => ErrorCode::ProposalExpired,
        }
    }
}

/// Lazy expiry: a pending proposal whose `expires_at` has passed reads as
/// expired regardless of earlier pending reads.
pub fn effective_status(proposal: &FlashSaleProposal, now: DateTime<Utc>) -> ProposalStatus {
    match proposal.status {
        ProposalStatus::Pending if proposal.is_past_expiry(now) => ProposalStatus::Expired,
        status => status,
    }
}

/// Pure transition over an already refreshed status.
pub fn transition(
    id: &ProposalId,
    current: ProposalStatus,
    event: FlashSaleEvent,
) -> Result<ProposalStatus, FlashSaleError> {
    match (current, event) {
        (ProposalStatus::Pending, FlashSaleEvent::Accept) => Ok(ProposalStatus::Accepted),
        (ProposalStatus::Pending, FlashSaleEvent::Reject) => Ok(ProposalStatus::Rejected),
        (ProposalStatus::Expired, _) => Err(FlashSaleError::Expired(id.clone())),
        (status, _) => Err(FlashSaleError::AlreadyResolved { id: id.clone(), status }),
    }
}

/// Owns every proposal for the duration of its lifecycle. Each proposal sits
/// behind its own lock so transitions on one id never interleave while
/// distinct ids proceed independently.
#[derive(Debug)]
pub struct FlashSaleBook {
    proposal_ttl: Duration,
    proposals: Mutex<HashMap<ProposalId, Arc<Mutex<FlashSaleProposal>>>>,
}

impl Default for FlashSaleBook {
    fn default() -> Self {
        Self::new(Duration::hours(24))
    }
}

impl FlashSaleBook {
    pub fn new(proposal_ttl: Duration) -> Self {
        Self { proposal_ttl, proposals: Mutex::new(HashMap::new()) }
    }

    pub fn proposal_ttl(&self) -> Duration {
        self.proposal_ttl
    }

    /// Create-or-get: an open proposal for the same supplier and product is
    /// returned instead of opening a duplicate.
    pub fn propose(&self, request: NewProposal, now: DateTime<Utc>) -> FlashSaleProposal {
        self.open(self.draft(request, now), now)
    }

    /// Builds a pending proposal without storing it, or returns the open
    /// proposal already held for the same supplier and product.
    pub fn draft(&self, request: NewProposal, now: DateTime<Utc>) -> FlashSaleProposal {
        if let Some(existing) = self.find_open(&request.supplier_id, &request.product_ref, now) {
            return existing;
        }
        FlashSaleProposal {
            id: ProposalId(format!("fs-{}", Uuid::new_v4().simple())),
            supplier_id: request.supplier_id,
            product_ref: request.product_ref,
            proposed_price: request.proposed_price,
            discount_percent: request.discount_percent,
            status: ProposalStatus::Pending,
            created_at: now,
            expires_at: now + self.proposal_ttl,
            resolved_at: None,
        }
    }

    pub fn find_open(
        &self,
        supplier_id: &str,
        product_ref: &str,
        now: DateTime<Utc>,
    ) -> Option<FlashSaleProposal> {
        let proposals = lock(&self.proposals);
        open_match(&proposals, supplier_id, product_ref, now)
    }

    /// Stores a drafted proposal. If another open proposal for the same
    /// supplier and product landed first, that one wins and is returned.
    pub fn open(&self, proposal: FlashSaleProposal, now: DateTime<Utc>) -> FlashSaleProposal {
        let mut proposals = lock(&self.proposals);
        if let Some(existing) = proposals.get(&proposal.id) {
            return lock(existing).clone();
        }
        if let Some(existing) =
            open_match(&proposals, &proposal.supplier_id, &proposal.product_ref, now)
        {
            return existing;
        }

        info!(
            event_name = "flash_sale.proposed",
            proposal_id = %proposal.id,
            supplier_id = %proposal.supplier_id,
            product_ref = %proposal.product_ref,
            "flash sale proposal created"
        );
        proposals.insert(proposal.id.clone(), Arc::new(Mutex::new(proposal.clone())));
        proposal
    }

    /// Reads a proposal, applying lazy expiry first.
    pub fn get(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<FlashSaleProposal, FlashSaleError> {
        let slot = self.slot(id)?;
        let mut proposal = lock(&slot);
        refresh(&mut proposal, now);
        Ok(proposal.clone())
    }

    pub fn accept(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<FlashSaleProposal, FlashSaleError> {
        self.resolve(id, FlashSaleEvent::Accept, now)
    }

    pub fn reject(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<FlashSaleProposal, FlashSaleError> {
        self.resolve(id, FlashSaleEvent::Reject, now)
    }

    /// Passive transition; a no-op unless the proposal is pending and past
    /// `expires_at`.
    pub fn expire(
        &self,
        id: &ProposalId,
        now: DateTime<Utc>,
    ) -> Result<FlashSaleProposal, FlashSaleError> {
        self.get(id, now)
    }

    pub fn list_for_supplier(
        &self,
        supplier_id: &str,
        status: Option<ProposalStatus>,
        now: DateTime<Utc>,
    ) -> Vec<FlashSaleProposal> {
        let slots = lock(&self.proposals).values().cloned().collect::<Vec<_>>();
        let mut matches = slots
            .iter()
            .filter_map(|slot| {
                let mut proposal = lock(slot);
                refresh(&mut proposal, now);
                let wanted = proposal.supplier_id == supplier_id
                    && status.map_or(true, |status| proposal.status == status);
                wanted.then(|| proposal.clone())
            })
            .collect::<Vec<_>>();
        matches.sort_by(|left, right| {
            left.created_at.cmp(&right.created_at).then_with(|| left.id.cmp(&right.id))
        });
        matches
    }

    pub fn len(&self) -> usize {
        lock(&self.proposals).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs the transition without storing it and returns the proposal as it
    /// would read afterwards.
    pub fn preview(
        &self,
        id: &ProposalId,
        event: FlashSaleEvent,
        now: DateTime<Utc>,
    ) -> Result<FlashSaleProposal, FlashSaleError> {
        let mut proposal = self.get(id, now)?;
        proposal.status = transition(id, proposal.status, event)?;
        proposal.resolved_at = Some(now);
        Ok(proposal)
    }

    pub fn resolve(
        &self,
        id: &ProposalId,
        event: FlashSaleEvent,
        now: DateTime<Utc>,
    ) -> Result<FlashSaleProposal, FlashSaleError> {
        let slot = self.slot(id)?;
        let mut proposal = lock(&slot);
        refresh(&mut proposal, now);

        let next = transition(id, proposal.status, event)?;
        proposal.status = next;
        proposal.resolved_at = Some(now);
        info!(
            event_name = "flash_sale.resolved",
            proposal_id = %id,
            status = next.as_str(),
            "flash sale proposal resolved"
        );
        Ok(proposal.clone())
    }

    fn slot(&self, id: &ProposalId) -> Result<Arc<Mutex<FlashSaleProposal>>, FlashSaleError> {
        lock(&self.proposals).get(id).cloned().ok_or_else(|| FlashSaleError::NotFound(id.clone()))
    }
}

fn open_match(
    proposals: &HashMap<ProposalId, Arc<Mutex<FlashSaleProposal>>>,
    supplier_id: &str,
    product_ref: &str,
    now: DateTime<Utc>,
) -> Option<FlashSaleProposal> {
    proposals.values().find_map(|slot| {
        let mut existing = lock(slot);
        refresh(&mut existing, now);
        let open = existing.status == ProposalStatus::Pending
            && existing.supplier_id == supplier_id
            && existing.product_ref == product_ref;
        open.then(|| existing.clone())
    })
}

fn refresh(proposal: &mut FlashSaleProposal, now: DateTime<Utc>) {
    let status = effective_status(proposal, now);
    if status != proposal.status {
        proposal.status = status;
        proposal.resolved_at = Some(proposal.expires_at);
        info!(
            event_name = "flash_sale.expired",
            proposal_id = %proposal.id,
            "flash sale proposal expired"
        );
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
