//! Optimistic read-state mutations.
//!
//! Every mutation changes the reconciler first and is tracked as a ticket until
//! the persistence call resolves: `Pending -> Confirmed | Reverted | Kept`.

use crate::error::{SyncError, SyncResult};
use crate::reconciler::Reconciler;
use inkstream_core::NotificationId;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub type MutationTicket = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationState {
    Pending,
    Confirmed,
    /// Persistence failed and the local change was undone.
    Reverted,
    /// Persistence failed; the local change stays (delete, mark-all).
    Kept,
    /// Nothing to do, no request was sent.
    Unchanged,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::Confirmed => "confirmed",
            MutationState::Reverted => "reverted",
            MutationState::Kept => "kept",
            MutationState::Unchanged => "unchanged",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    MarkRead(NotificationId),
    MarkAllRead(Vec<NotificationId>),
    Delete(NotificationId),
}

impl MutationKind {
    pub fn operation(&self) -> &'static str {
        match self {
            MutationKind::MarkRead(_) => "mark_read",
            MutationKind::MarkAllRead(_) => "mark_all_read",
            MutationKind::Delete(_) => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMutation {
    pub ticket: MutationTicket,
    pub kind: MutationKind,
    pub state: MutationState,
    superseded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub ticket: MutationTicket,
    pub kind: MutationKind,
    pub state: MutationState,
    /// Set when the persistence call failed; always `MutationConflict`.
    pub error: Option<SyncError>,
}

#[derive(Debug, Default)]
pub struct ReadStateMutator {
    next_ticket: MutationTicket,
    pending: BTreeMap<MutationTicket, PendingMutation>,
}

impl ReadStateMutator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, ticket: MutationTicket) -> Option<&PendingMutation> {
        self.pending.get(&ticket)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// `Ok(None)` when the entry is already read: no local change, no request.
    pub fn mark_read(
        &mut self,
        reconciler: &mut Reconciler,
        id: NotificationId,
    ) -> SyncResult<Option<MutationTicket>> {
        let item = reconciler.get(id).ok_or(SyncError::NotFound(id))?;
        if item.is_read {
            debug!("mark_read_noop id={id}");
            return Ok(None);
        }
        reconciler.apply_read_locally(id);
        Ok(Some(self.register(MutationKind::MarkRead(id))))
    }

    /// Always issues the request: the server may hold unread entries beyond
    /// the loaded page.
    pub fn mark_all_read(&mut self, reconciler: &mut Reconciler) -> MutationTicket {
        let flipped = reconciler.apply_read_all_locally();
        self.register(MutationKind::MarkAllRead(flipped))
    }

    pub fn delete(
        &mut self,
        reconciler: &mut Reconciler,
        id: NotificationId,
    ) -> SyncResult<MutationTicket> {
        reconciler
            .apply_delete_locally(id)
            .ok_or(SyncError::NotFound(id))?;
        Ok(self.register(MutationKind::Delete(id)))
    }

    /// A live event for `id` arrived after we flipped it; it wins over a
    /// later rollback or reload.
    pub fn observe_live(&mut self, id: NotificationId) {
        for pending in self.pending.values_mut() {
            match &mut pending.kind {
                MutationKind::MarkRead(target) if *target == id => pending.superseded = true,
                MutationKind::MarkAllRead(ids) => ids.retain(|flipped| *flipped != id),
                _ => {}
            }
        }
    }

    /// Puts in-flight local changes back over a freshly loaded snapshot,
    /// which may predate them.
    pub fn reapply_pending(&self, reconciler: &mut Reconciler) {
        for pending in self.pending.values() {
            match &pending.kind {
                MutationKind::MarkRead(id) if !pending.superseded => {
                    reconciler.apply_read_locally(*id);
                }
                MutationKind::MarkRead(_) => {}
                MutationKind::MarkAllRead(ids) => {
                    for id in ids {
                        reconciler.apply_read_locally(*id);
                    }
                }
                MutationKind::Delete(id) => {
                    reconciler.apply_delete_locally(*id);
                }
            }
        }
    }

    pub fn resolve(
        &mut self,
        reconciler: &mut Reconciler,
        ticket: MutationTicket,
        result: SyncResult<()>,
    ) -> Option<Resolution> {
        let pending = self.pending.remove(&ticket)?;
        let operation = pending.kind.operation();
        let err = match result {
            Ok(()) => {
                debug!("mutation_confirmed op={operation} ticket={ticket}");
                return Some(Resolution {
                    ticket,
                    kind: pending.kind,
                    state: MutationState::Confirmed,
                    error: None,
                });
            }
            Err(err) => err,
        };
        let state = match &pending.kind {
            MutationKind::MarkRead(id) if !pending.superseded => {
                reconciler.revert_read_locally(*id);
                warn!("mutation_reverted op={operation} id={id}: {err}");
                MutationState::Reverted
            }
            MutationKind::MarkRead(id) => {
                warn!("mutation_failed_superseded op={operation} id={id}: {err}");
                MutationState::Kept
            }
            MutationKind::MarkAllRead(ids) => {
                warn!(
                    "mutation_failed_kept op={operation} local_ids={}: {err}",
                    ids.len()
                );
                MutationState::Kept
            }
            MutationKind::Delete(id) => {
                warn!("mutation_failed_kept op={operation} id={id}: {err}");
                MutationState::Kept
            }
        };
        Some(Resolution {
            ticket,
            kind: pending.kind,
            state,
            error: Some(SyncError::MutationConflict {
                operation,
                message: err.to_string(),
            }),
        })
    }

    /// Drops every pending ticket; their results no longer have a target.
    pub fn clear(&mut self) -> Vec<MutationTicket> {
        let tickets = self.pending.keys().copied().collect();
        self.pending.clear();
        tickets
    }

    fn register(&mut self, kind: MutationKind) -> MutationTicket {
        self.next_ticket += 1;
        let ticket = self.next_ticket;
        debug!("mutation_pending op={} ticket={ticket}", kind.operation());
        self.pending.insert(
            ticket,
            PendingMutation {
                ticket,
                kind,
                state: MutationState::Pending,
                superseded: false,
            },
        );
        ticket
    }
}
