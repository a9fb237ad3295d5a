//! Hostname → agent-session registry.
//!
//! The only shared mutable state in the core. Session handlers own their
//! sessions; the registry holds cloned handles and is responsible for
//! closing a session when its entry is removed (close is idempotent, so the
//! race with handler-side cleanup is harmless).

use std::collections::HashMap;
use std::time::SystemTime;

use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::mux::MuxSession;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("hostname '{0}' is already in use")]
    HostnameTaken(String),
}

#[derive(Clone)]
pub struct TunnelEntry {
    pub hostname: String,
    pub session: MuxSession,
    pub connected_at: SystemTime,
}

impl TunnelEntry {
    pub fn new(hostname: impl Into<String>, session: MuxSession) -> Self {
        Self {
            hostname: hostname.into(),
            session,
            connected_at: SystemTime::now(),
        }
    }
}

#[derive(Default)]
pub struct TunnelRegistry {
    tunnels: RwLock<HashMap<String, TunnelEntry>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically installs `entry` under its hostname; fails when the
    /// hostname is already present.
    pub async fn add(&self, entry: TunnelEntry) -> Result<(), RegistryError> {
        let mut tunnels = self.tunnels.write().await;
        if tunnels.contains_key(&entry.hostname) {
            return Err(RegistryError::HostnameTaken(entry.hostname.clone()));
        }
        info!("tunnel '{}' registered", entry.hostname);
        tunnels.insert(entry.hostname.clone(), entry);
        Ok(())
    }

    /// Shared, non-blocking lookup. The returned handle may race with
    /// removal; callers must tolerate the session closing mid-use.
    pub async fn get(&self, hostname: &str) -> Option<TunnelEntry> {
        self.tunnels.read().await.get(hostname).cloned()
    }

    /// Removes the entry and closes its session. Idempotent.
    pub async fn remove(&self, hostname: &str) {
        if let Some(entry) = self.tunnels.write().await.remove(hostname) {
            entry.session.close();
            let uptime = entry.connected_at.elapsed().unwrap_or_default();
            info!("tunnel '{}' unregistered after {:?}", hostname, uptime);
        }
    }

    pub async fn len(&self) -> usize {
        self.tunnels.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tunnels.read().await.is_empty()
    }

    /// Hostnames currently registered, for diagnostics.
    pub async fn hostnames(&self) -> Vec<String> {
        self.tunnels.read().await.keys().cloned().collect()
    }
}
