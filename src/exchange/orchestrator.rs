use crate::error::{DuplicateArrival, StorageError};
use crate::transport::{ReadStatus, TransportEngine, ValidationStatus};
use crate::types::{PeerId, PieceData};
use std::collections::{BTreeSet, HashMap};
use std::time::SystemTime;
use tracing::debug;

/// Buyers waiting on one storage read
#[derive(Debug, Clone)]
struct PendingLoad {
    waiters: BTreeSet<PeerId>,
    requested_at: SystemTime,
}

/// Seller whose bytes are being hash checked
#[derive(Debug, Clone)]
struct PendingArrival {
    owner: PeerId,
    submitted_at: SystemTime,
}

/// What happened to a load request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    /// A read for this index was already outstanding
    Joined,
    /// A new read was issued
    Issued,
    /// The new read finished inside the request
    Completed(Vec<LoadDelivery>),
}

/// Read result owed to one waiting buyer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadDelivery {
    pub peer: PeerId,
    pub index: u32,
    pub result: Result<PieceData, StorageError>,
}

/// What happened to a submitted piece
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArrivalSubmission {
    Submitted,
    /// Hash check finished inside the submission
    Validated(ArrivalOutcome),
}

/// Hash check result, attributed when a tracked seller supplied the bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrivalOutcome {
    Attributed { peer: PeerId, index: u32, valid: bool },
    Unattributed { index: u32, valid: bool },
}

/// What `purge_for_peer` removed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    /// Loads the peer stopped waiting on
    pub loads_left: Vec<u32>,
    /// Arrivals the peer owned
    pub arrivals_dropped: Vec<u32>,
}

/// Deduplicates piece reads (selling) and tracks piece validations (buying)
/// against the transport's asynchronous storage.
///
/// Bookkeeping is always updated before the transport is called, since the
/// transport may complete the request before returning.
#[derive(Debug, Default)]
pub struct PieceExchangeOrchestrator {
    pending_loads: HashMap<u32, PendingLoad>,
    pending_arrivals: HashMap<u32, PendingArrival>,
}

impl PieceExchangeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask for piece `index` on behalf of `peer`, reading storage at most once per index
    pub fn request_load(
        &mut self,
        peer: PeerId,
        index: u32,
        storage: &mut dyn TransportEngine,
    ) -> LoadRequest {
        if let Some(pending) = self.pending_loads.get_mut(&index) {
            pending.waiters.insert(peer);
            debug!(%peer, index, waiters = pending.waiters.len(), "joining outstanding piece read");
            return LoadRequest::Joined;
        }

        self.pending_loads.insert(
            index,
            PendingLoad {
                waiters: BTreeSet::from([peer]),
                requested_at: SystemTime::now(),
            },
        );
        debug!(%peer, index, "reading piece");

        match storage.read_piece(index) {
            ReadStatus::Queued => LoadRequest::Issued,
            ReadStatus::Completed(result) => LoadRequest::Completed(self.on_load_complete(index, result)),
        }
    }

    /// Fan a finished read out to every waiter. Reads nobody tracks are ignored.
    pub fn on_load_complete(
        &mut self,
        index: u32,
        result: Result<PieceData, StorageError>,
    ) -> Vec<LoadDelivery> {
        let Some(pending) = self.pending_loads.remove(&index) else {
            debug!(index, "ignoring piece read, not requested by a buyer");
            return Vec::new();
        };

        let elapsed = pending.requested_at.elapsed().unwrap_or_default();
        debug!(index, waiters = pending.waiters.len(), ?elapsed, ok = result.is_ok(), "piece read finished");

        pending
            .waiters
            .into_iter()
            .map(|peer| LoadDelivery {
                peer,
                index,
                result: result.clone(),
            })
            .collect()
    }

    /// Hand a full piece from `peer` to the transport's integrity check
    pub fn submit_arrival(
        &mut self,
        peer: PeerId,
        data: PieceData,
        index: u32,
        storage: &mut dyn TransportEngine,
    ) -> Result<ArrivalSubmission, DuplicateArrival> {
        // storage ignores bytes for a piece it already has and never reports back
        if storage.has_local_piece(index) {
            debug!(%peer, index, "piece already held, accepting without storing");
            return Ok(ArrivalSubmission::Validated(ArrivalOutcome::Attributed {
                peer,
                index,
                valid: true,
            }));
        }

        if let Some(existing) = self.pending_arrivals.get(&index) {
            return Err(DuplicateArrival {
                index,
                owner: existing.owner,
            });
        }

        self.pending_arrivals.insert(
            index,
            PendingArrival {
                owner: peer,
                submitted_at: SystemTime::now(),
            },
        );
        debug!(%peer, index, bytes = data.len(), "submitting piece for validation");

        match storage.add_piece(index, data) {
            ValidationStatus::Queued => Ok(ArrivalSubmission::Submitted),
            ValidationStatus::Completed { valid } => {
                Ok(ArrivalSubmission::Validated(self.on_arrival_validated(index, valid)))
            }
        }
    }

    pub fn on_arrival_validated(&mut self, index: u32, valid: bool) -> ArrivalOutcome {
        match self.pending_arrivals.remove(&index) {
            Some(arrival) => {
                let elapsed = arrival.submitted_at.elapsed().unwrap_or_default();
                debug!(peer = %arrival.owner, index, valid, ?elapsed, "piece validation finished");
                ArrivalOutcome::Attributed {
                    peer: arrival.owner,
                    index,
                    valid,
                }
            }
            None => ArrivalOutcome::Unattributed { index, valid },
        }
    }

    /// Forget everything `peer` was waiting on or owned.
    ///
    /// Outstanding reads keep running; their entries stay until they complete.
    pub fn purge_for_peer(&mut self, peer: &PeerId) -> PurgeSummary {
        let mut summary = PurgeSummary::default();

        for (index, pending) in self.pending_loads.iter_mut() {
            if pending.waiters.remove(peer) {
                summary.loads_left.push(*index);
            }
        }

        self.pending_arrivals.retain(|index, arrival| {
            if arrival.owner == *peer {
                summary.arrivals_dropped.push(*index);
                false
            } else {
                true
            }
        });

        summary.loads_left.sort_unstable();
        summary.arrivals_dropped.sort_unstable();
        summary
    }

    pub fn clear_loads(&mut self) {
        if !self.pending_loads.is_empty() {
            debug!(count = self.pending_loads.len(), "discarding pending piece reads");
        }
        self.pending_loads.clear();
    }

    pub fn clear_arrivals(&mut self) {
        if !self.pending_arrivals.is_empty() {
            debug!(count = self.pending_arrivals.len(), "discarding pending piece validations");
        }
        self.pending_arrivals.clear();
    }

    /// Discard all state without notifying anyone
    pub fn clear_all(&mut self) {
        self.clear_loads();
        self.clear_arrivals();
    }

    pub fn load_waiters(&self, index: u32) -> Option<&BTreeSet<PeerId>> {
        self.pending_loads.get(&index).map(|p| &p.waiters)
    }

    pub fn arrival_owner(&self, index: u32) -> Option<PeerId> {
        self.pending_arrivals.get(&index).map(|a| a.owner)
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.len()
    }

    pub fn pending_arrival_count(&self) -> usize {
        self.pending_arrivals.len()
    }
}
