//! Push channel lifecycle.
//!
//! [`ChannelManager`] owns at most one connection task. The task is bound to
//! the credential it was opened with; a new principal always gets a new task.
//! Everything the task reports is tagged with the session epoch so late
//! emissions from a torn-down session can be told apart.

use crate::config::ReconnectPolicy;
use crate::error::{SyncError, SyncResult};
use crate::identity::Credential;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use inkstream_core::{decode_push_frame, Notification, PushFrame};
use serde::Serialize;
use std::fmt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

pub type Epoch = u64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const HELLO_PROTOCOL: &str = "json";
const HELLO_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSignal {
    Open,
    ConnectSucceeded,
    ConnectFailed,
    Dropped,
    Teardown,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Disconnected => "disconnected",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Reconnecting => "reconnecting",
        }
    }

    pub fn on(self, signal: ChannelSignal) -> ChannelState {
        use ChannelSignal::*;
        use ChannelState::*;
        match (self, signal) {
            (_, Teardown) => Disconnected,
            (Disconnected, Open) => Connecting,
            (Connecting, ConnectSucceeded) | (Reconnecting, ConnectSucceeded) => Connected,
            (Connecting, ConnectFailed) => Disconnected,
            (Connected, Dropped) | (Reconnecting, Dropped) | (Reconnecting, ConnectFailed) => {
                Reconnecting
            }
            (state, _) => state,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    State(ChannelState),
    Notification(Notification),
    AuthRejected(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEmission {
    pub epoch: Epoch,
    pub event: ChannelEvent,
}

struct ChannelSession {
    epoch: Epoch,
    shutdown: oneshot::Sender<()>,
}

pub struct ChannelManager {
    url: Url,
    reconnect: ReconnectPolicy,
    emissions: mpsc::Sender<ChannelEmission>,
    session: Option<ChannelSession>,
}

impl ChannelManager {
    pub fn new(
        url: Url,
        reconnect: ReconnectPolicy,
        emissions: mpsc::Sender<ChannelEmission>,
    ) -> Self {
        Self {
            url,
            reconnect,
            emissions,
            session: None,
        }
    }

    pub fn active_epoch(&self) -> Option<Epoch> {
        self.session.as_ref().map(|session| session.epoch)
    }

    /// Tears down any previous connection before starting a fresh one, so a
    /// session never has two readers feeding the same reconciler.
    pub fn open(&mut self, epoch: Epoch, credential: Credential) {
        self.teardown();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let ctx = ChannelContext {
            epoch,
            url: self.url.clone(),
            credential,
            reconnect: self.reconnect,
            emissions: self.emissions.clone(),
        };
        tokio::spawn(run_channel(ctx, shutdown_rx));
        debug!("channel_open epoch={epoch}");
        self.session = Some(ChannelSession {
            epoch,
            shutdown: shutdown_tx,
        });
    }

    pub fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown.send(());
            debug!("channel_teardown epoch={}", session.epoch);
        }
    }
}

impl Drop for ChannelManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

struct ChannelContext {
    epoch: Epoch,
    url: Url,
    credential: Credential,
    reconnect: ReconnectPolicy,
    emissions: mpsc::Sender<ChannelEmission>,
}

impl ChannelContext {
    async fn emit(&self, event: ChannelEvent) {
        let _ = self
            .emissions
            .send(ChannelEmission {
                epoch: self.epoch,
                event,
            })
            .await;
    }

    async fn transition(&self, state: &mut ChannelState, signal: ChannelSignal) {
        let next = state.on(signal);
        if next != *state {
            *state = next;
            self.emit(ChannelEvent::State(next)).await;
        }
    }

    async fn dispatch(&self, text: &str) {
        match decode_push_frame(text, Utc::now()) {
            Ok(PushFrame::Notifications(items)) => {
                for item in items {
                    match item {
                        Ok(notification) => {
                            self.emit(ChannelEvent::Notification(notification)).await
                        }
                        Err(err) => warn!("channel_malformed_event: {err}"),
                    }
                }
            }
            Ok(PushFrame::Other(event)) => debug!("channel_ignored_event: {event}"),
            Err(err) => warn!("channel_malformed_event: {err}"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum ReadExit {
    Shutdown,
    Dropped,
}

async fn run_channel(ctx: ChannelContext, mut shutdown: oneshot::Receiver<()>) {
    let mut state = ChannelState::Disconnected;
    let mut backoff = ctx.reconnect.initial;
    ctx.transition(&mut state, ChannelSignal::Open).await;

    loop {
        let attempt = tokio::select! {
            _ = &mut shutdown => return,
            attempt = connect(&ctx) => attempt,
        };
        match attempt {
            Ok(mut ws) => {
                backoff = ctx.reconnect.initial;
                ctx.transition(&mut state, ChannelSignal::ConnectSucceeded)
                    .await;
                info!("channel_connected epoch={}", ctx.epoch);
                if read_frames(&ctx, &mut ws, &mut shutdown).await == ReadExit::Shutdown {
                    let _ = ws.close(None).await;
                    return;
                }
                let _ = ws.close(None).await;
                ctx.transition(&mut state, ChannelSignal::Dropped).await;
            }
            Err(SyncError::Auth(reason)) => {
                warn!("channel_auth_rejected epoch={}: {reason}", ctx.epoch);
                ctx.transition(&mut state, ChannelSignal::Teardown).await;
                ctx.emit(ChannelEvent::AuthRejected(reason)).await;
                return;
            }
            Err(err) => {
                warn!("channel_connect_error epoch={}: {err}", ctx.epoch);
                ctx.transition(&mut state, ChannelSignal::ConnectFailed)
                    .await;
                if state == ChannelState::Disconnected {
                    return;
                }
            }
        }
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = ctx.reconnect.next(backoff);
    }
}

async fn connect(ctx: &ChannelContext) -> SyncResult<WsStream> {
    let request = handshake_request(&ctx.url, &ctx.credential)?;
    let (mut ws, _response) = connect_async(request).await.map_err(classify_ws_error)?;
    ws.send(Message::Text(hello_frame()))
        .await
        .map_err(classify_ws_error)?;
    Ok(ws)
}

async fn read_frames(
    ctx: &ChannelContext,
    ws: &mut WsStream,
    shutdown: &mut oneshot::Receiver<()>,
) -> ReadExit {
    loop {
        let frame = tokio::select! {
            _ = &mut *shutdown => return ReadExit::Shutdown,
            frame = ws.next() => frame,
        };
        match frame {
            Some(Ok(Message::Text(text))) => ctx.dispatch(&text).await,
            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                Ok(text) => ctx.dispatch(&text).await,
                Err(_) => warn!("channel_malformed_event: binary frame is not utf-8"),
            },
            Some(Ok(Message::Close(frame))) => {
                debug!("channel_closed_by_server epoch={}: {frame:?}", ctx.epoch);
                return ReadExit::Dropped;
            }
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                warn!("channel_read_error epoch={}: {err}", ctx.epoch);
                return ReadExit::Dropped;
            }
            None => return ReadExit::Dropped,
        }
    }
}

fn handshake_request(url: &Url, credential: &Credential) -> SyncResult<Request> {
    let mut url = url.clone();
    url.query_pairs_mut()
        .append_pair("access_token", credential.expose());
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|err| SyncError::Config(err.to_string()))?;
    let bearer = HeaderValue::from_str(&format!("Bearer {}", credential.expose()))
        .map_err(|_| SyncError::Auth("credential is not a valid header value".to_string()))?;
    request.headers_mut().insert(AUTHORIZATION, bearer);
    Ok(request)
}

fn hello_frame() -> String {
    serde_json::json!({
        "type": "hello",
        "protocol": HELLO_PROTOCOL,
        "version": HELLO_VERSION,
    })
    .to_string()
}

fn classify_ws_error(err: WsError) -> SyncError {
    if let WsError::Http(response) = &err {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return SyncError::Auth(format!("handshake status {status}"));
        }
    }
    SyncError::Transport(err.to_string())
}
