//! The sync engine: one task owning the session state.
//!
//! Identity changes, snapshot responses, channel emissions, persistence
//! completions and surface commands all arrive on channels and are applied one
//! at a time. Each async continuation carries the epoch of the session that
//! issued it; anything from an older epoch is dropped on arrival.

use crate::api::NotificationApi;
use crate::channel::{ChannelEmission, ChannelEvent, ChannelManager, ChannelState, Epoch};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityGate, Principal};
use crate::mutator::{MutationKind, MutationState, MutationTicket, ReadStateMutator};
use crate::reconciler::{MergeOutcome, Reconciler};
use crate::snapshot::SnapshotLoader;
use inkstream_core::{Notification, NotificationId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

const COMMAND_BUFFER: usize = 64;
const EVENT_BUFFER: usize = 256;

type MutationReply = oneshot::Sender<SyncResult<MutationState>>;

/// Transient message for a failed user action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub operation: &'static str,
    pub message: String,
}

/// What surfaces render. Published after every applied input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationView {
    pub principal: Option<String>,
    pub epoch: Epoch,
    pub channel: ChannelState,
    pub loading: bool,
    pub items: Vec<Notification>,
    pub unread: usize,
    pub last_error: Option<String>,
    pub notice: Option<Notice>,
}

impl NotificationView {
    /// The bell dropdown shows only the head of the list.
    pub fn latest(&self, limit: usize) -> &[Notification] {
        &self.items[..self.items.len().min(limit)]
    }
}

#[derive(Debug)]
pub enum Command {
    MarkRead {
        id: NotificationId,
        reply: Option<MutationReply>,
    },
    MarkAllRead {
        reply: Option<MutationReply>,
    },
    Delete {
        id: NotificationId,
        reply: Option<MutationReply>,
    },
    Open {
        id: NotificationId,
        reply: oneshot::Sender<SyncResult<Option<String>>>,
    },
    Refresh,
    DismissNotice,
}

#[derive(Debug)]
pub(crate) enum Completion {
    Snapshot {
        epoch: Epoch,
        seq: u64,
        result: SyncResult<Vec<Notification>>,
    },
    Mutation {
        epoch: Epoch,
        ticket: MutationTicket,
        result: SyncResult<()>,
    },
}

struct Session {
    epoch: Epoch,
    principal: Principal,
    reconciler: Reconciler,
    mutator: ReadStateMutator,
    replies: HashMap<MutationTicket, MutationReply>,
    /// Latest snapshot request; older replies in the same epoch are dropped.
    snapshot_seq: u64,
    channel: ChannelState,
    loading: bool,
    last_error: Option<String>,
    notice: Option<Notice>,
}

impl Session {
    fn new(epoch: Epoch, principal: Principal) -> Self {
        Self {
            epoch,
            principal,
            reconciler: Reconciler::new(),
            mutator: ReadStateMutator::new(),
            replies: HashMap::new(),
            snapshot_seq: 0,
            channel: ChannelState::Disconnected,
            loading: false,
            last_error: None,
            notice: None,
        }
    }

    fn view(&self) -> NotificationView {
        NotificationView {
            principal: Some(self.principal.user_id().to_string()),
            epoch: self.epoch,
            channel: self.channel,
            loading: self.loading,
            items: self.reconciler.items().to_vec(),
            unread: self.reconciler.unread_count(),
            last_error: self.last_error.clone(),
            notice: self.notice.clone(),
        }
    }
}

pub struct SyncEngine {
    identity: IdentityGate,
    identity_rx: watch::Receiver<Option<Principal>>,
    api: Arc<dyn NotificationApi>,
    loader: SnapshotLoader,
    channel: ChannelManager,
    channel_rx: mpsc::Receiver<ChannelEmission>,
    commands_rx: mpsc::Receiver<Command>,
    completions_tx: mpsc::Sender<Completion>,
    completions_rx: mpsc::Receiver<Completion>,
    view_tx: watch::Sender<NotificationView>,
    epoch: Epoch,
    session: Option<Session>,
}

impl SyncEngine {
    pub fn new(
        config: &SyncConfig,
        api: Arc<dyn NotificationApi>,
        identity: IdentityGate,
    ) -> (Self, EngineHandle) {
        let (channel_tx, channel_rx) = mpsc::channel(EVENT_BUFFER);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (completions_tx, completions_rx) = mpsc::channel(EVENT_BUFFER);
        let (view_tx, view_rx) = watch::channel(NotificationView::default());
        let engine = Self {
            identity_rx: identity.subscribe(),
            identity: identity.clone(),
            loader: SnapshotLoader::new(api.clone(), config.page_size),
            api,
            channel: ChannelManager::new(
                config.channel_url.clone(),
                config.reconnect,
                channel_tx,
            ),
            channel_rx,
            commands_rx,
            completions_tx,
            completions_rx,
            view_tx,
            epoch: 0,
            session: None,
        };
        let handle = EngineHandle {
            commands: commands_tx,
            view: view_rx,
            identity,
        };
        (engine, handle)
    }

    /// Runs until every [`EngineHandle`] is dropped.
    pub async fn run(mut self) {
        let initial = self.identity_rx.borrow_and_update().clone();
        self.on_identity(initial);
        loop {
            tokio::select! {
                changed = self.identity_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = self.identity_rx.borrow_and_update().clone();
                    self.on_identity(next);
                }
                Some(emission) = self.channel_rx.recv() => self.on_channel(emission),
                Some(completion) = self.completions_rx.recv() => self.on_completion(completion),
                command = self.commands_rx.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
            }
        }
        self.end_session();
        self.publish();
        debug!("engine_stopped");
    }

    fn on_identity(&mut self, next: Option<Principal>) {
        let unchanged = match (&self.session, &next) {
            (Some(session), Some(principal)) => session.principal == *principal,
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            return;
        }
        self.end_session();
        self.epoch += 1;
        if let Some(principal) = next {
            info!(
                "session_start user={} epoch={}",
                principal.user_id(),
                self.epoch
            );
            let credential = principal.credential().clone();
            self.session = Some(Session::new(self.epoch, principal));
            // Snapshot first, then the live stream.
            self.request_snapshot();
            self.channel.open(self.epoch, credential);
        }
        self.publish();
    }

    fn end_session(&mut self) {
        self.channel.teardown();
        let Some(mut session) = self.session.take() else {
            return;
        };
        let dropped = session.mutator.clear();
        for (_, reply) in session.replies.drain() {
            let _ = reply.send(Err(SyncError::SessionEnded));
        }
        info!(
            "session_end user={} epoch={} pending_dropped={}",
            session.principal.user_id(),
            session.epoch,
            dropped.len()
        );
    }

    fn request_snapshot(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.loading = true;
        session.snapshot_seq += 1;
        session.reconciler.begin_reload();
        let epoch = session.epoch;
        let seq = session.snapshot_seq;
        let credential = session.principal.credential().clone();
        let loader = self.loader.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = loader.fetch_recent(&credential).await;
            let _ = tx.send(Completion::Snapshot { epoch, seq, result }).await;
        });
    }

    fn spawn_mutation(&self, epoch: Epoch, ticket: MutationTicket, kind: MutationKind) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let credential = session.principal.credential().clone();
        let api = self.api.clone();
        let tx = self.completions_tx.clone();
        tokio::spawn(async move {
            let result = match kind {
                MutationKind::MarkRead(id) => api.mark_read(&credential, id).await,
                MutationKind::MarkAllRead(_) => api.mark_all_read(&credential).await,
                MutationKind::Delete(id) => api.delete(&credential, id).await,
            };
            let _ = tx
                .send(Completion::Mutation {
                    epoch,
                    ticket,
                    result,
                })
                .await;
        });
    }

    fn live_session(&mut self, epoch: Epoch) -> Option<&mut Session> {
        self.session
            .as_mut()
            .filter(|session| session.epoch == epoch)
    }

    /// Auth failures anywhere end the session through the identity gate.
    /// Whoever holds the gate afterwards (nobody, or a principal that logged
    /// in while the request was in flight) becomes the next session.
    fn reject_credential(&mut self, reason: &str) {
        if let Some(session) = self.session.as_ref() {
            let rejected = session.principal.clone();
            self.identity.invalidate(&rejected, reason);
        }
        let next = self.identity.current();
        self.on_identity(next);
    }

    pub(crate) fn on_channel(&mut self, emission: ChannelEmission) {
        let ChannelEmission { epoch, event } = emission;
        let Some(session) = self.live_session(epoch) else {
            debug!("channel_stale_emission epoch={epoch}");
            return;
        };
        match event {
            ChannelEvent::State(state) => {
                debug!("channel_state epoch={epoch} state={state}");
                session.channel = state;
            }
            ChannelEvent::Notification(notification) => {
                let id = notification.id;
                session.mutator.observe_live(id);
                match session.reconciler.merge_live(notification) {
                    MergeOutcome::Inserted => debug!("live_inserted id={id}"),
                    MergeOutcome::Updated { index } => {
                        debug!("live_updated id={id} index={index}")
                    }
                    MergeOutcome::Suppressed => debug!("live_suppressed id={id}"),
                }
            }
            ChannelEvent::AuthRejected(reason) => {
                self.reject_credential(&reason);
                return;
            }
        }
        self.publish();
    }

    pub(crate) fn on_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Snapshot { epoch, seq, result } => self.on_snapshot(epoch, seq, result),
            Completion::Mutation {
                epoch,
                ticket,
                result,
            } => self.on_mutation(epoch, ticket, result),
        }
    }

    fn on_snapshot(&mut self, epoch: Epoch, seq: u64, result: SyncResult<Vec<Notification>>) {
        let Some(session) = self.live_session(epoch) else {
            debug!("snapshot_stale_discarded epoch={epoch}");
            return;
        };
        if seq != session.snapshot_seq {
            debug!(
                "snapshot_superseded epoch={epoch} seq={seq} latest={}",
                session.snapshot_seq
            );
            return;
        }
        session.loading = false;
        match result {
            Ok(items) => {
                debug!("snapshot_loaded epoch={epoch} seq={seq} items={}", items.len());
                session.reconciler.load_snapshot(items);
                session.mutator.reapply_pending(&mut session.reconciler);
                session.last_error = None;
            }
            Err(SyncError::Auth(reason)) => {
                self.reject_credential(&reason);
                return;
            }
            Err(err) => {
                warn!("snapshot_fetch_error epoch={epoch} seq={seq}: {err}");
                session.reconciler.abandon_reload();
                session.last_error = Some(err.to_string());
            }
        }
        self.publish();
    }

    fn on_mutation(&mut self, epoch: Epoch, ticket: MutationTicket, result: SyncResult<()>) {
        let Some(session) = self.live_session(epoch) else {
            debug!("mutation_stale_discarded epoch={epoch} ticket={ticket}");
            return;
        };
        let auth_reason = match &result {
            Err(SyncError::Auth(reason)) => Some(reason.clone()),
            _ => None,
        };
        let Some(resolution) = session
            .mutator
            .resolve(&mut session.reconciler, ticket, result)
        else {
            return;
        };
        if let Some(SyncError::MutationConflict { operation, message }) = &resolution.error {
            session.notice = Some(Notice {
                operation: *operation,
                message: message.clone(),
            });
        }
        if let Some(reply) = session.replies.remove(&ticket) {
            let _ = reply.send(match resolution.error {
                Some(err) => Err(err),
                None => Ok(resolution.state),
            });
        }
        if let Some(reason) = auth_reason {
            self.reject_credential(&reason);
            return;
        }
        self.publish();
    }

    pub(crate) fn on_command(&mut self, command: Command) {
        match command {
            Command::MarkRead { id, reply } => {
                self.mark_read(id, reply);
            }
            Command::MarkAllRead { reply } => {
                let Some(session) = self.session.as_mut() else {
                    reply_err(reply, SyncError::NoPrincipal);
                    return;
                };
                let ticket = session.mutator.mark_all_read(&mut session.reconciler);
                let epoch = session.epoch;
                if let Some(reply) = reply {
                    session.replies.insert(ticket, reply);
                }
                self.spawn_mutation(epoch, ticket, MutationKind::MarkAllRead(Vec::new()));
            }
            Command::Delete { id, reply } => {
                let Some(session) = self.session.as_mut() else {
                    reply_err(reply, SyncError::NoPrincipal);
                    return;
                };
                match session.mutator.delete(&mut session.reconciler, id) {
                    Ok(ticket) => {
                        let epoch = session.epoch;
                        if let Some(reply) = reply {
                            session.replies.insert(ticket, reply);
                        }
                        self.spawn_mutation(epoch, ticket, MutationKind::Delete(id));
                    }
                    Err(err) => {
                        reply_err(reply, err);
                        return;
                    }
                }
            }
            Command::Open { id, reply } => {
                let url = match self.session.as_ref() {
                    None => Err(SyncError::NoPrincipal),
                    Some(session) => session
                        .reconciler
                        .get(id)
                        .map(|item| item.url.clone())
                        .ok_or(SyncError::NotFound(id)),
                };
                if url.is_ok() {
                    // Issued before navigation, never awaited by it.
                    self.mark_read(id, None);
                }
                let _ = reply.send(url);
            }
            Command::Refresh => {
                if self.session.is_none() {
                    return;
                }
                self.request_snapshot();
            }
            Command::DismissNotice => {
                if let Some(session) = self.session.as_mut() {
                    session.notice = None;
                }
            }
        }
        self.publish();
    }

    fn mark_read(&mut self, id: NotificationId, reply: Option<MutationReply>) {
        let Some(session) = self.session.as_mut() else {
            reply_err(reply, SyncError::NoPrincipal);
            return;
        };
        match session.mutator.mark_read(&mut session.reconciler, id) {
            Ok(Some(ticket)) => {
                let epoch = session.epoch;
                if let Some(reply) = reply {
                    session.replies.insert(ticket, reply);
                }
                self.spawn_mutation(epoch, ticket, MutationKind::MarkRead(id));
            }
            Ok(None) => {
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(MutationState::Unchanged));
                }
            }
            Err(err) => reply_err(reply, err),
        }
    }

    fn publish(&self) {
        let view = match &self.session {
            Some(session) => session.view(),
            None => NotificationView {
                epoch: self.epoch,
                ..NotificationView::default()
            },
        };
        self.view_tx.send_replace(view);
    }
}

fn reply_err(reply: Option<MutationReply>, err: SyncError) {
    match reply {
        Some(reply) => {
            let _ = reply.send(Err(err));
        }
        None => debug!("command_rejected: {err}"),
    }
}

/// Presentation-side handle: read the view, request mutations.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    view: watch::Receiver<NotificationView>,
    identity: IdentityGate,
}

impl EngineHandle {
    pub fn identity(&self) -> &IdentityGate {
        &self.identity
    }

    pub fn view(&self) -> NotificationView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationView> {
        self.view.clone()
    }

    /// Resolves once the persistence call does; the list already shows the
    /// entry as read when this is called.
    pub async fn mark_read(&self, id: NotificationId) -> SyncResult<MutationState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MarkRead {
            id,
            reply: Some(reply),
        })
        .await?;
        rx.await.unwrap_or(Err(SyncError::SessionEnded))
    }

    pub async fn mark_all_read(&self) -> SyncResult<MutationState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::MarkAllRead { reply: Some(reply) })
            .await?;
        rx.await.unwrap_or(Err(SyncError::SessionEnded))
    }

    pub async fn delete(&self, id: NotificationId) -> SyncResult<MutationState> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Delete {
            id,
            reply: Some(reply),
        })
        .await?;
        rx.await.unwrap_or(Err(SyncError::SessionEnded))
    }

    /// Click-to-navigate: returns the target as soon as mark-read is issued.
    pub async fn open(&self, id: NotificationId) -> SyncResult<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Open { id, reply }).await?;
        rx.await.unwrap_or(Err(SyncError::SessionEnded))
    }

    pub async fn refresh(&self) -> SyncResult<()> {
        self.send(Command::Refresh).await
    }

    pub async fn dismiss_notice(&self) -> SyncResult<()> {
        self.send(Command::DismissNotice).await
    }

    async fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SyncError::EngineStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Credential;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use url::Url;

    #[derive(Default)]
    struct FakeApi {
        pages: Mutex<HashMap<String, SyncResult<Vec<Value>>>>,
        fail_mutations: AtomicBool,
        calls: Mutex<Vec<String>>,
    }

    impl FakeApi {
        fn with_page(self, token: &str, page: SyncResult<Vec<Value>>) -> Self {
            self.set_page(token, page);
            self
        }

        fn set_page(&self, token: &str, page: SyncResult<Vec<Value>>) {
            self.pages
                .lock()
                .expect("pages lock")
                .insert(token.to_string(), page);
        }

        fn record(&self, call: String) -> SyncResult<()> {
            self.calls.lock().expect("calls lock").push(call);
            if self.fail_mutations.load(Ordering::SeqCst) {
                return Err(SyncError::Transport("status 500".to_string()));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().expect("calls lock").clone()
        }
    }

    #[async_trait]
    impl NotificationApi for FakeApi {
        async fn list(
            &self,
            credential: &Credential,
            _page: u32,
            _page_size: u32,
        ) -> SyncResult<Vec<Value>> {
            self.calls
                .lock()
                .expect("calls lock")
                .push(format!("list:{}", credential.expose()));
            self.pages
                .lock()
                .expect("pages lock")
                .get(credential.expose())
                .cloned()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        async fn mark_read(&self, _: &Credential, id: NotificationId) -> SyncResult<()> {
            self.record(format!("read:{id}"))
        }

        async fn mark_all_read(&self, _: &Credential) -> SyncResult<()> {
            self.record("read-all".to_string())
        }

        async fn delete(&self, _: &Credential, id: NotificationId) -> SyncResult<()> {
            self.record(format!("delete:{id}"))
        }
    }

    fn record(id: NotificationId, is_read: bool) -> Value {
        json!({
            "id": id,
            "message": format!("notification {id}"),
            "url": format!("/comics/{id}"),
            "isRead": is_read,
            "createdAt": format!("2024-05-01T10:{:02}:00Z", id),
        })
    }

    fn live(id: NotificationId, is_read: bool) -> Notification {
        inkstream_core::normalize_value(&record(id, is_read), chrono::Utc::now())
            .expect("valid record")
    }

    fn engine(api: Arc<FakeApi>) -> SyncEngine {
        // Nothing listens on the discard port; channel attempts fail fast and
        // their emissions are never read by these tests.
        let api_base = Url::parse("http://127.0.0.1:9/api").expect("api url");
        let channel_url = Url::parse("ws://127.0.0.1:9/hubs/notifications").expect("channel url");
        let (engine, _handle) =
            SyncEngine::new(&SyncConfig::new(api_base, channel_url), api, IdentityGate::new());
        engine
    }

    async fn next_completion(engine: &mut SyncEngine) -> Completion {
        tokio::time::timeout(Duration::from_secs(5), engine.completions_rx.recv())
            .await
            .expect("completion in time")
            .expect("completion channel open")
    }

    async fn login(engine: &mut SyncEngine, user: &str, token: &str) {
        let principal = Principal::new(user, token);
        engine.identity.login(principal.clone());
        engine.on_identity(Some(principal));
        let completion = next_completion(engine).await;
        engine.on_completion(completion);
    }

    fn view(engine: &SyncEngine) -> NotificationView {
        engine.view_tx.borrow().clone()
    }

    fn ids(view: &NotificationView) -> Vec<NotificationId> {
        view.items.iter().map(|item| item.id).collect()
    }

    fn emission(engine: &SyncEngine, event: ChannelEvent) -> ChannelEmission {
        ChannelEmission {
            epoch: engine.epoch,
            event,
        }
    }

    #[tokio::test]
    async fn live_update_after_snapshot_updates_in_place() {
        let api = Arc::new(
            FakeApi::default().with_page("tok-a", Ok(vec![record(5, false), record(3, true)])),
        );
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;
        assert_eq!(view(&engine).unread, 1);
        assert!(!view(&engine).loading);

        let event = emission(&engine, ChannelEvent::Notification(live(5, true)));
        engine.on_channel(event);

        let view = view(&engine);
        assert_eq!(ids(&view), vec![5, 3]);
        assert!(view.items[0].is_read);
        assert_eq!(view.unread, 0);
    }

    #[tokio::test]
    async fn reconnect_then_live_event_does_not_duplicate() {
        let api = Arc::new(
            FakeApi::default().with_page("tok-a", Ok(vec![record(7, false), record(6, false)])),
        );
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        for state in [
            ChannelState::Connected,
            ChannelState::Reconnecting,
            ChannelState::Connected,
        ] {
            let event = emission(&engine, ChannelEvent::State(state));
            engine.on_channel(event);
        }
        assert_eq!(view(&engine).channel, ChannelState::Connected);

        let event = emission(&engine, ChannelEvent::Notification(live(6, false)));
        engine.on_channel(event);
        let view = view(&engine);
        assert_eq!(ids(&view), vec![7, 6]);
        assert_eq!(view.unread, 2);
    }

    #[tokio::test]
    async fn live_event_before_snapshot_is_kept() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        let mut engine = engine(api);
        let principal = Principal::new("reader-a", "tok-a");
        engine.on_identity(Some(principal));
        assert!(view(&engine).loading);

        let event = emission(&engine, ChannelEvent::Notification(live(2, false)));
        engine.on_channel(event);
        assert_eq!(ids(&view(&engine)), vec![2]);

        let completion = next_completion(&mut engine).await;
        engine.on_completion(completion);
        let view = view(&engine);
        assert_eq!(ids(&view), vec![2, 1]);
        assert_eq!(view.unread, 2);
    }

    #[tokio::test]
    async fn mark_all_read_is_optimistic() {
        let api = Arc::new(FakeApi::default().with_page(
            "tok-a",
            Ok(vec![
                record(5, false),
                record(4, true),
                record(3, false),
                record(2, true),
                record(1, false),
            ]),
        ));
        let mut engine = engine(api.clone());
        login(&mut engine, "reader-a", "tok-a").await;
        assert_eq!(view(&engine).unread, 3);

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::MarkAllRead { reply: Some(reply) });
        let optimistic = view(&engine);
        assert_eq!(optimistic.unread, 0);
        assert!(optimistic.items.iter().all(|item| item.is_read));

        let completion = next_completion(&mut engine).await;
        engine.on_completion(completion);
        assert_eq!(rx.await.expect("reply"), Ok(MutationState::Confirmed));
        assert!(api.calls().contains(&"read-all".to_string()));
    }

    #[tokio::test]
    async fn mark_read_twice_sends_one_request() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        let mut engine = engine(api.clone());
        login(&mut engine, "reader-a", "tok-a").await;

        let (first, first_rx) = oneshot::channel();
        engine.on_command(Command::MarkRead {
            id: 1,
            reply: Some(first),
        });
        let (second, second_rx) = oneshot::channel();
        engine.on_command(Command::MarkRead {
            id: 1,
            reply: Some(second),
        });
        assert_eq!(second_rx.await.expect("reply"), Ok(MutationState::Unchanged));

        let completion = next_completion(&mut engine).await;
        engine.on_completion(completion);
        assert_eq!(first_rx.await.expect("reply"), Ok(MutationState::Confirmed));

        let reads = api
            .calls()
            .into_iter()
            .filter(|call| call.starts_with("read:"))
            .count();
        assert_eq!(reads, 1);
        assert_eq!(view(&engine).unread, 0);
    }

    #[tokio::test]
    async fn failed_mark_read_reverts_and_notifies() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        api.fail_mutations.store(true, Ordering::SeqCst);
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::MarkRead {
            id: 1,
            reply: Some(reply),
        });
        assert_eq!(view(&engine).unread, 0);

        let completion = next_completion(&mut engine).await;
        engine.on_completion(completion);
        let result = rx.await.expect("reply");
        assert!(matches!(
            result,
            Err(SyncError::MutationConflict {
                operation: "mark_read",
                ..
            })
        ));
        let current = view(&engine);
        assert_eq!(current.unread, 1);
        assert_eq!(
            current.notice.as_ref().map(|notice| notice.operation),
            Some("mark_read")
        );

        engine.on_command(Command::DismissNotice);
        assert!(view(&engine).notice.is_none());
    }

    #[tokio::test]
    async fn failed_delete_stays_deleted() {
        let api = Arc::new(
            FakeApi::default().with_page("tok-a", Ok(vec![record(2, false), record(1, false)])),
        );
        api.fail_mutations.store(true, Ordering::SeqCst);
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        engine.on_command(Command::Delete { id: 2, reply: None });
        let completion = next_completion(&mut engine).await;
        engine.on_completion(completion);

        let view = view(&engine);
        assert_eq!(ids(&view), vec![1]);
        assert_eq!(view.unread, 1);
        assert!(view.notice.is_some());
    }

    #[tokio::test]
    async fn open_issues_mark_read_and_returns_target() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(4, false)])));
        let mut engine = engine(api.clone());
        login(&mut engine, "reader-a", "tok-a").await;

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::Open { id: 4, reply });
        assert_eq!(rx.await.expect("reply"), Ok(Some("/comics/4".to_string())));
        assert_eq!(view(&engine).unread, 0);

        let completion = next_completion(&mut engine).await;
        engine.on_completion(completion);
        assert!(api.calls().contains(&"read:4".to_string()));

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::Open { id: 99, reply });
        assert_eq!(rx.await.expect("reply"), Err(SyncError::NotFound(99)));
    }

    #[tokio::test]
    async fn slow_snapshot_of_previous_user_is_ignored() {
        let api = Arc::new(
            FakeApi::default()
                .with_page("tok-a", Ok(vec![record(1, false), record(2, false)]))
                .with_page("tok-b", Ok(vec![record(9, true)])),
        );
        let mut engine = engine(api);

        engine.on_identity(Some(Principal::new("reader-a", "tok-a")));
        let snapshot_a = next_completion(&mut engine).await;

        engine.on_identity(None);
        engine.on_identity(Some(Principal::new("reader-b", "tok-b")));
        let snapshot_b = next_completion(&mut engine).await;

        engine.on_completion(snapshot_a);
        let current = view(&engine);
        assert_eq!(current.principal.as_deref(), Some("reader-b"));
        assert!(current.items.is_empty());
        assert!(current.loading);

        engine.on_completion(snapshot_b);
        let current = view(&engine);
        assert_eq!(ids(&current), vec![9]);
        assert_eq!(current.unread, 0);
    }

    #[tokio::test]
    async fn stale_channel_and_mutation_results_are_dropped() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;
        let old_epoch = engine.epoch;

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::MarkRead {
            id: 1,
            reply: Some(reply),
        });
        let pending = next_completion(&mut engine).await;

        engine.on_identity(Some(Principal::new("reader-b", "tok-b")));
        assert_eq!(rx.await.expect("reply"), Err(SyncError::SessionEnded));

        engine.on_completion(pending);
        engine.on_channel(ChannelEmission {
            epoch: old_epoch,
            event: ChannelEvent::Notification(live(1, false)),
        });
        let current = view(&engine);
        assert_eq!(current.principal.as_deref(), Some("reader-b"));
        assert!(current.items.is_empty());
        assert!(current.notice.is_none());
    }

    #[tokio::test]
    async fn credential_rotation_rebuilds_session() {
        let api = Arc::new(
            FakeApi::default()
                .with_page("tok-1", Ok(vec![record(1, false)]))
                .with_page("tok-2", Ok(vec![record(2, false)])),
        );
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-1").await;
        let first_epoch = engine.epoch;
        assert_eq!(engine.channel.active_epoch(), Some(first_epoch));

        engine.on_identity(Some(Principal::new("reader-a", "tok-1")));
        assert_eq!(engine.epoch, first_epoch);

        login(&mut engine, "reader-a", "tok-2").await;
        assert_eq!(engine.epoch, first_epoch + 1);
        assert_eq!(engine.channel.active_epoch(), Some(first_epoch + 1));
        assert_eq!(ids(&view(&engine)), vec![2]);
    }

    #[tokio::test]
    async fn auth_error_on_snapshot_invalidates_identity() {
        let api = Arc::new(
            FakeApi::default().with_page("expired", Err(SyncError::Auth("status 401".to_string()))),
        );
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "expired").await;

        assert!(engine.identity.current().is_none());
        assert!(engine.session.is_none());
        assert_eq!(engine.channel.active_epoch(), None);
        assert_eq!(view(&engine).principal, None);
    }

    #[tokio::test]
    async fn channel_auth_rejection_invalidates_identity() {
        let api = Arc::new(FakeApi::default());
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        let event = emission(&engine, ChannelEvent::AuthRejected("handshake status 401".into()));
        engine.on_channel(event);
        assert!(engine.identity.current().is_none());
        assert_eq!(view(&engine).principal, None);
    }

    #[tokio::test]
    async fn rejected_snapshot_does_not_log_out_a_newer_principal() {
        let api = Arc::new(
            FakeApi::default()
                .with_page("expired", Err(SyncError::Auth("status 401".to_string())))
                .with_page("tok-b", Ok(vec![record(9, false)])),
        );
        let mut engine = engine(api);
        let reader_a = Principal::new("reader-a", "expired");
        engine.identity.login(reader_a.clone());
        engine.on_identity(Some(reader_a));
        let snapshot_a = next_completion(&mut engine).await;

        // reader-b signs in before the engine has seen A's 401.
        let reader_b = Principal::new("reader-b", "tok-b");
        engine.identity.login(reader_b.clone());
        engine.on_completion(snapshot_a);

        assert_eq!(engine.identity.current(), Some(reader_b.clone()));
        let current = view(&engine);
        assert_eq!(current.principal.as_deref(), Some("reader-b"));
        assert!(current.loading);

        // The gate change the run loop would see next is already applied.
        let epoch = engine.epoch;
        engine.on_identity(Some(reader_b));
        assert_eq!(engine.epoch, epoch);

        let snapshot_b = next_completion(&mut engine).await;
        engine.on_completion(snapshot_b);
        assert_eq!(ids(&view(&engine)), vec![9]);
    }

    #[tokio::test]
    async fn live_event_racing_a_refresh_is_kept() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        engine.on_command(Command::Refresh);
        assert!(view(&engine).loading);
        // The page is built before 42 reaches the channel.
        let refreshed = next_completion(&mut engine).await;
        let event = emission(&engine, ChannelEvent::Notification(live(42, false)));
        engine.on_channel(event);
        engine.on_completion(refreshed);

        let current = view(&engine);
        assert_eq!(ids(&current), vec![42, 1]);
        assert_eq!(current.unread, 2);
        assert!(!current.loading);
    }

    #[tokio::test]
    async fn refresh_keeps_pending_mark_read() {
        let api = Arc::new(
            FakeApi::default().with_page("tok-a", Ok(vec![record(2, false), record(1, false)])),
        );
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::MarkRead {
            id: 2,
            reply: Some(reply),
        });
        engine.on_command(Command::Refresh);

        let first = next_completion(&mut engine).await;
        let second = next_completion(&mut engine).await;
        let (snapshot, mutation) = match first {
            Completion::Snapshot { .. } => (first, second),
            Completion::Mutation { .. } => (second, first),
        };

        // The server still reports 2 as unread; the request is in flight.
        engine.on_completion(snapshot);
        let current = view(&engine);
        assert!(current.items[0].is_read);
        assert_eq!(current.unread, 1);

        engine.on_completion(mutation);
        assert_eq!(rx.await.expect("reply"), Ok(MutationState::Confirmed));
        assert_eq!(view(&engine).unread, 1);
    }

    #[tokio::test]
    async fn older_refresh_reply_is_dropped() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        let mut engine = engine(api.clone());
        login(&mut engine, "reader-a", "tok-a").await;

        engine.on_command(Command::Refresh);
        let older = next_completion(&mut engine).await;
        api.set_page("tok-a", Ok(vec![record(3, false), record(1, true)]));
        engine.on_command(Command::Refresh);
        let newer = next_completion(&mut engine).await;

        engine.on_completion(newer);
        let current = view(&engine);
        assert_eq!(ids(&current), vec![3, 1]);
        assert!(!current.loading);

        engine.on_completion(older);
        let current = view(&engine);
        assert_eq!(ids(&current), vec![3, 1]);
        assert_eq!(current.unread, 1);
    }

    #[tokio::test]
    async fn refresh_reply_behind_a_newer_request_leaves_loading_set() {
        let api = Arc::new(FakeApi::default().with_page("tok-a", Ok(vec![record(1, false)])));
        let mut engine = engine(api.clone());
        login(&mut engine, "reader-a", "tok-a").await;

        engine.on_command(Command::Refresh);
        let older = next_completion(&mut engine).await;
        engine.on_command(Command::Refresh);
        engine.on_completion(older);
        assert!(view(&engine).loading);

        let newer = next_completion(&mut engine).await;
        engine.on_completion(newer);
        assert!(!view(&engine).loading);
    }

    #[tokio::test]
    async fn transport_error_leaves_empty_list_with_error() {
        let api = Arc::new(FakeApi::default().with_page(
            "tok-a",
            Err(SyncError::Transport("connection refused".to_string())),
        ));
        let mut engine = engine(api);
        login(&mut engine, "reader-a", "tok-a").await;

        let current = view(&engine);
        assert!(current.items.is_empty());
        assert!(!current.loading);
        assert!(current
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("connection refused"));
        assert!(engine.identity.current().is_some());
    }

    #[tokio::test]
    async fn commands_without_principal_are_rejected() {
        let mut engine = engine(Arc::new(FakeApi::default()));
        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::MarkRead {
            id: 1,
            reply: Some(reply),
        });
        assert_eq!(rx.await.expect("reply"), Err(SyncError::NoPrincipal));

        let (reply, rx) = oneshot::channel();
        engine.on_command(Command::Open { id: 1, reply });
        assert_eq!(rx.await.expect("reply"), Err(SyncError::NoPrincipal));
    }

    #[test]
    fn latest_limits_bell_items() {
        let view = NotificationView {
            items: (1..=8).map(|id| live(id, false)).collect(),
            ..NotificationView::default()
        };
        assert_eq!(view.latest(5).len(), 5);
        assert_eq!(view.latest(50).len(), 8);
    }
}
