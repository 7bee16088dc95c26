//! Authentication collaborator seam
//!
//! The sync layer never acquires or parses credentials itself. It asks an
//! injected [`TokenProvider`] for the current bearer token, and signals
//! refresh-worthy failures through [`AuthEvent`] notifications emitted by the
//! executor. `refresh_session` is only ever called in response to such a
//! notification, never proactively.

use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Events published by the executor on its auth channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthEvent {
    /// A request failed terminally with an auth classification; the session
    /// token likely needs a refresh
    RefreshNeeded,
}

/// Capability interface over the external auth collaborator
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// The bearer token to attach to the next request, if a session exists
    async fn current_token(&self) -> Option<String>;

    /// Attempt a session refresh, returning the new token
    async fn refresh_session(&self) -> Result<String>;

    /// Whether the given token is still usable
    ///
    /// Injected so the sync layer stays agnostic of the token format.
    fn is_token_fresh(&self, token: &str) -> bool {
        let _ = token;
        true
    }
}

/// Fixed-token provider for tests and simple embeddings
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: Mutex<Option<String>>,
}

impl StaticTokenProvider {
    /// Create a provider holding the given token
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: Mutex::new(Some(token.into())),
        }
    }

    /// Create a provider with no session
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Replace the stored token
    pub fn set_token(&self, token: impl Into<String>) {
        if let Ok(mut slot) = self.token.lock() {
            *slot = Some(token.into());
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn current_token(&self) -> Option<String> {
        self.token.lock().ok()?.clone()
    }

    async fn refresh_session(&self) -> Result<String> {
        Err(SyncError::new(
            crate::error::ErrorKind::Auth,
            "static token provider cannot refresh a session",
        ))
    }
}

/// Wire an auth-event subscription to a provider's refresh capability
///
/// Runs until the sending side is dropped. One task per subscription; the
/// executor's cooldown already bounds how often events arrive.
pub fn spawn_auth_refresh(
    mut events: broadcast::Receiver<AuthEvent>,
    provider: Arc<dyn TokenProvider>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AuthEvent::RefreshNeeded) => match provider.refresh_session().await {
                    Ok(_) => log::info!("session refreshed after auth failure"),
                    Err(e) => log::warn!("session refresh failed: {e}"),
                },
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::debug!("auth event stream lagged, skipped {skipped}");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
