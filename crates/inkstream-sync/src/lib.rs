//! Client-side notification sync: snapshot plus live channel, reconciled into
//! one list per signed-in principal.

pub mod api;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod mutator;
pub mod reconciler;
pub mod snapshot;

pub use api::{HttpNotificationApi, NotificationApi};
pub use channel::{ChannelEmission, ChannelEvent, ChannelManager, ChannelState, Epoch};
pub use config::{derive_channel_url, ReconnectPolicy, SyncConfig};
pub use engine::{Command, EngineHandle, Notice, NotificationView, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use identity::{Credential, IdentityGate, Principal};
pub use mutator::{MutationState, MutationTicket};
pub use reconciler::{MergeOutcome, Reconciler};
pub use snapshot::SnapshotLoader;
