use inkstream_core::{unread_count, Notification, NotificationId};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated { index: usize },
    /// Deleted locally this session; a late echo must not bring it back.
    Suppressed,
}

/// Single in-memory list per session: newest first, unique ids, derived
/// unread count.
///
/// Between a snapshot request and its reply every live merge is also kept in
/// `replay`, oldest first, so the reply cannot drop an event the server sent
/// after it built the page.
#[derive(Debug)]
pub struct Reconciler {
    items: Vec<Notification>,
    snapshot_loaded: bool,
    recording: bool,
    replay: Vec<Notification>,
    deleted: HashSet<NotificationId>,
    unread: usize,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            snapshot_loaded: false,
            // The first snapshot of a session is always outstanding.
            recording: true,
            replay: Vec::new(),
            deleted: HashSet::new(),
            unread: 0,
        }
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.unread
    }

    pub fn snapshot_loaded(&self) -> bool {
        self.snapshot_loaded
    }

    pub fn get(&self, id: NotificationId) -> Option<&Notification> {
        self.items.iter().find(|item| item.id == id)
    }

    /// A snapshot request went out; live merges from here on are kept for
    /// replay over its reply.
    pub fn begin_reload(&mut self) {
        self.recording = true;
    }

    /// The outstanding snapshot failed. After the first load the current
    /// list already holds every merge, so the replay log is dropped.
    pub fn abandon_reload(&mut self) {
        if self.snapshot_loaded {
            self.recording = false;
            self.replay.clear();
        }
    }

    /// Replaces the list wholesale, then replays the live events merged
    /// since the request went out, in arrival order.
    pub fn load_snapshot(&mut self, list: Vec<Notification>) {
        let mut seen = HashSet::with_capacity(list.len());
        self.items = list
            .into_iter()
            .filter(|item| !self.deleted.contains(&item.id) && seen.insert(item.id))
            .collect();
        self.snapshot_loaded = true;
        self.recording = false;
        for event in std::mem::take(&mut self.replay) {
            self.upsert(event);
        }
        self.recount();
    }

    pub fn merge_live(&mut self, event: Notification) -> MergeOutcome {
        if self.deleted.contains(&event.id) {
            return MergeOutcome::Suppressed;
        }
        if self.recording {
            self.replay.retain(|logged| logged.id != event.id);
            self.replay.push(event.clone());
        }
        let outcome = self.upsert(event);
        self.recount();
        outcome
    }

    pub fn apply_read_locally(&mut self, id: NotificationId) -> bool {
        self.set_read(id, true)
    }

    pub fn revert_read_locally(&mut self, id: NotificationId) -> bool {
        self.set_read(id, false)
    }

    pub fn apply_read_all_locally(&mut self) -> Vec<NotificationId> {
        let mut flipped = Vec::new();
        for item in self.items.iter_mut().filter(|item| item.is_unread()) {
            item.is_read = true;
            flipped.push(item.id);
        }
        for logged in &mut self.replay {
            logged.is_read = true;
        }
        self.recount();
        flipped
    }

    /// Only an entry that is actually in the list gets a tombstone.
    pub fn apply_delete_locally(&mut self, id: NotificationId) -> Option<Notification> {
        let index = self.position(id)?;
        self.deleted.insert(id);
        self.replay.retain(|logged| logged.id != id);
        let removed = self.items.remove(index);
        self.recount();
        Some(removed)
    }

    fn upsert(&mut self, event: Notification) -> MergeOutcome {
        match self.position(event.id) {
            Some(index) => {
                self.items[index] = event;
                MergeOutcome::Updated { index }
            }
            None => {
                self.items.insert(0, event);
                MergeOutcome::Inserted
            }
        }
    }

    fn set_read(&mut self, id: NotificationId, is_read: bool) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        if item.is_read == is_read {
            return false;
        }
        item.is_read = is_read;
        if let Some(logged) = self.replay.iter_mut().find(|logged| logged.id == id) {
            logged.is_read = is_read;
        }
        self.recount();
        true
    }

    fn position(&self, id: NotificationId) -> Option<usize> {
        self.items.iter().position(|item| item.id == id)
    }

    fn recount(&mut self) {
        self.unread = unread_count(&self.items);
    }
}
