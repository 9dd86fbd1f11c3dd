//! Session manager: registry of per-peripheral sessions

use super::Session;
use crate::command::{BatchBuilder, BatchFailure, BatchId};
use crate::transport::GattTransport;
use ble_sequencer_shared::{timing, PeripheralAddress, SessionError};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, info};

/// Configuration shared by every session of a manager
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How long an operation may wait for its completion
    pub operation_timeout: Duration,
    /// How long a physical connect (handshake and discovery) may take
    pub connect_timeout: Duration,
    /// Capacity of each session's event channel
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_millis(timing::OPERATION_TIMEOUT_MS),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            event_capacity: timing::EVENT_CHANNEL_CAPACITY,
        }
    }
}

/// Owns one live session per peripheral address
///
/// Sessions run on the runtime captured at construction, so batches can be
/// posted from threads outside it.
pub struct SessionManager<T: GattTransport> {
    transport: Arc<T>,
    config: SessionConfig,
    runtime: Handle,
    sessions: RwLock<HashMap<PeripheralAddress, Session<T>>>,
}

impl<T: GattTransport> SessionManager<T> {
    /// Create a manager bound to the current Tokio runtime
    ///
    /// Must be called from within a runtime; use [`SessionManager::with_runtime`]
    /// otherwise.
    pub fn new(transport: Arc<T>, config: SessionConfig) -> Self {
        Self::with_runtime(transport, config, Handle::current())
    }

    pub fn with_runtime(transport: Arc<T>, config: SessionConfig, runtime: Handle) -> Self {
        Self {
            transport,
            config,
            runtime,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Live session of `address`, created on first use
    ///
    /// A retired session is replaced by a fresh one, which is how a
    /// peripheral gets reconnected after its link dropped.
    pub fn session(&self, address: &PeripheralAddress) -> Session<T> {
        if let Some(session) = self.get(address) {
            return session;
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = sessions.get(address) {
            if !session.is_retired() {
                return session.clone();
            }
            debug!("[SESSION] {} replacing retired session", address);
        }

        info!("[SESSION] {} session created", address);
        let session = Session::new(
            address.clone(),
            self.transport.clone(),
            &self.config,
            self.runtime.clone(),
        );
        sessions.insert(address.clone(), session.clone());
        session
    }

    /// Live session of `address` if one exists
    pub fn get(&self, address: &PeripheralAddress) -> Option<Session<T>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .filter(|s| !s.is_retired())
            .cloned()
    }

    /// Queue a batch on the session of `address`
    pub fn post<B, C, F>(&self, address: &PeripheralAddress, build: B, on_complete: C, on_failed: F) -> BatchId
    where
        B: FnOnce(BatchBuilder) -> BatchBuilder,
        C: FnOnce() + Send + 'static,
        F: FnOnce(usize, SessionError) + Send + 'static,
    {
        self.session(address).post(build, on_complete, on_failed)
    }

    /// Queue a batch on the session of `address` and wait for its outcome
    pub async fn request<B>(&self, address: &PeripheralAddress, build: B) -> Result<(), BatchFailure>
    where
        B: FnOnce(BatchBuilder) -> BatchBuilder,
    {
        let session = self.session(address);
        session.request(build).await
    }

    /// Connect `address` outside of any batch
    pub async fn connect(&self, address: &PeripheralAddress) -> Result<(), SessionError> {
        let session = self.session(address);
        session.connect().await
    }

    /// Dispose the session of `address`; returns whether one existed
    pub fn dispose(&self, address: &PeripheralAddress) -> bool {
        let removed = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(address);

        match removed {
            Some(session) => {
                session.dispose();
                true
            }
            None => false,
        }
    }

    pub fn dispose_all(&self) {
        let sessions: Vec<_> = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, s)| s)
            .collect();

        for session in sessions {
            session.dispose();
        }
    }

    /// Drop retired sessions from the registry
    pub fn prune(&self) -> Vec<PeripheralAddress> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let retired: Vec<_> = sessions
            .iter()
            .filter(|(_, s)| s.is_retired())
            .map(|(a, _)| a.clone())
            .collect();

        for address in &retired {
            if let Some(session) = sessions.remove(address) {
                session.dispose();
            }
        }
        retired
    }

    /// Addresses with a live session
    pub fn addresses(&self) -> Vec<PeripheralAddress> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, s)| !s.is_retired())
            .map(|(a, _)| a.clone())
            .collect()
    }
}
