//! Shared helpers for the integration tests
//!
//! Provides a scripted transport double so the full client pipeline can be
//! exercised without a network.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stride_sync::{
    BackoffPolicy, ExecutorConfig, KeyValueStore, MemoryStore, RawResponse, StaticTokenProvider,
    SyncClient, SyncClientConfig, Transport, TransportError,
};

/// Scripted outcome for one send
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub enum Script {
    /// Respond with this status and body
    Respond(u16, &'static str),
    /// Fail at the connection level
    ConnectError,
    /// Never respond, forcing the deadline to fire
    Hang,
}

/// Transport double replaying a fixed script
pub struct ScriptedTransport {
    script: Mutex<VecDeque<Script>>,
    sends: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            sends: AtomicUsize::new(0),
        }
    }

    pub fn sends(&self) -> usize {
        self.sends.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        _request: reqwest::Request,
    ) -> Result<RawResponse, TransportError> {
        self.sends.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent callers genuinely overlap
        tokio::time::sleep(Duration::from_millis(2)).await;
        let step = self
            .script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Script::Respond(200, "null"));
        match step {
            Script::Respond(status, body) => Ok(RawResponse {
                status,
                retry_after: None,
                body: body.to_string(),
            }),
            Script::ConnectError => Err(TransportError::Connect("connection refused".to_string())),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Other("unreachable".to_string()))
            }
        }
    }
}

/// Executor config without real delays
pub fn fast_executor_config() -> ExecutorConfig {
    ExecutorConfig {
        max_attempts: 3,
        backoff: BackoffPolicy {
            base: Duration::ZERO,
            ceiling: Duration::ZERO,
            max_jitter: Duration::ZERO,
        },
        auth_cooldown: Duration::from_millis(100),
        log_requests: true,
    }
}

/// A client over a scripted transport and in-memory storage
#[allow(dead_code)]
pub fn test_client(script: Vec<Script>) -> (Arc<SyncClient>, Arc<ScriptedTransport>) {
    test_client_with_storage(script, Arc::new(MemoryStore::new()))
}

/// Same, with caller-provided storage for persistence tests
#[allow(dead_code)]
pub fn test_client_with_storage(
    script: Vec<Script>,
    storage: Arc<dyn KeyValueStore>,
) -> (Arc<SyncClient>, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new(script));
    let mut config = SyncClientConfig::new("https://store.example.com", "anon-key");
    config.executor = fast_executor_config();
    config.reconnect_debounce = Duration::from_millis(10);
    let client = SyncClient::with_transport(
        config,
        transport.clone(),
        Arc::new(StaticTokenProvider::new("user-token")),
        storage,
    )
    .expect("valid test config");
    (Arc::new(client), transport)
}
