//! Identity gate: who is signed in, observed by the engine.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Bearer credential. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    user_id: String,
    credential: Credential,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            credential: Credential::new(credential),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

#[derive(Clone)]
pub struct IdentityGate {
    tx: Arc<watch::Sender<Option<Principal>>>,
}

impl Default for IdentityGate {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> Option<Principal> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.tx.subscribe()
    }

    /// Returns false when the same principal (and credential) is already set.
    pub fn login(&self, principal: Principal) -> bool {
        let user_id = principal.user_id.clone();
        let changed = self.replace(Some(principal));
        if changed {
            info!("identity_login user={user_id}");
        }
        changed
    }

    pub fn logout(&self) -> bool {
        let changed = self.replace(None);
        if changed {
            info!("identity_logout");
        }
        changed
    }

    /// Credential rejected upstream: drop the principal instead of retrying.
    ///
    /// Only clears when `rejected` is still the current principal; a login
    /// that raced the failing request survives it.
    pub fn invalidate(&self, rejected: &Principal, reason: &str) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if current.as_ref() != Some(rejected) {
                return false;
            }
            *current = None;
            true
        });
        if changed {
            warn!(
                "identity_invalidated user={}: {reason}",
                rejected.user_id()
            );
        } else {
            debug!(
                "identity_invalidate_skipped user={}: principal already replaced",
                rejected.user_id()
            );
        }
        changed
    }

    fn replace(&self, next: Option<Principal>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }
}
