//! Connection manager
//!
//! One owner for all live handler instances, keyed by connection id, with at
//! most one connection marked active at a time. Mutations (create, activate,
//! remove) are serialised behind a write lock so readers never observe
//! half-updated state; reads clone the handler out and release the lock
//! before touching the network.
//!
//! Connection configs are the only durable state of the core: a single JSON
//! array on disk, rewritten after every mutation.

use crate::backend::{
    factory, BackendKind, ConnectionConfig, ConnectionStatus, DatabaseHandler, Query, QueryResult,
    Row, SchemaSnapshot, TestResult,
};
use crate::error::{NlqError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

const EXECUTE_TIMEOUT: Duration = Duration::from_secs(30);
const HISTORY_LIMIT: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub name: String,
    pub kind: BackendKind,
    pub status: ConnectionStatus,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub connection_id: String,
    pub connection_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_connections: usize,
    pub active_connection: Option<String>,
    pub connections_by_kind: HashMap<String, usize>,
    pub history_count: usize,
}

struct Entry {
    config: ConnectionConfig,
    handler: Arc<dyn DatabaseHandler>,
    status: ConnectionStatus,
    connected_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    entries: HashMap<String, Entry>,
    active_id: Option<String>,
    history: VecDeque<ConnectionEvent>,
}

impl ManagerState {
    fn record(&mut self, action: &str, id: &str, name: &str) {
        self.history.push_back(ConnectionEvent {
            timestamp: Utc::now(),
            action: action.to_string(),
            connection_id: id.to_string(),
            connection_name: name.to_string(),
        });
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_front();
        }
    }

    fn configs(&self) -> Vec<ConnectionConfig> {
        let mut configs: Vec<ConnectionConfig> =
            self.entries.values().map(|e| e.config.clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }
}

pub struct ConnectionManager {
    state: RwLock<ManagerState>,
    store_path: PathBuf,
}

impl ConnectionManager {
    pub fn new(store_path: PathBuf) -> Self {
        Self { state: RwLock::new(ManagerState::default()), store_path }
    }

    /// Load persisted configs without connecting. Invalid entries are logged
    /// and skipped.
    pub async fn load(&self) -> Result<usize> {
        if !self.store_path.exists() {
            return Ok(0);
        }
        let raw = std::fs::read_to_string(&self.store_path)?;
        let configs: Vec<ConnectionConfig> = serde_json::from_str(&raw)?;

        let mut state = self.state.write().await;
        let mut loaded = 0;
        for config in configs {
            match factory::make(&config) {
                Ok(handler) => {
                    info!("Loaded saved connection: {} ({})", config.name, config.kind);
                    state.entries.insert(
                        config.id.clone(),
                        Entry {
                            handler,
                            status: ConnectionStatus::Configured,
                            connected_at: None,
                            last_error: None,
                            config,
                        },
                    );
                    loaded += 1;
                }
                Err(e) => {
                    error!("Failed to load connection {}: {}", config.name, e);
                }
            }
        }
        Ok(loaded)
    }

    fn persist(&self, state: &ManagerState) {
        let configs = state.configs();
        match serde_json::to_string_pretty(&configs) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.store_path, json) {
                    error!("Failed to save connections: {}", e);
                }
            }
            Err(e) => error!("Failed to serialise connections: {}", e),
        }
    }

    /// Validate and register a new connection in `configured` state.
    pub async fn create(&self, mut config: ConnectionConfig) -> Result<String> {
        factory::validate(&config)?;

        if config.id.is_empty() || config.id == "test" {
            config.id = uuid::Uuid::new_v4().to_string();
        }
        if config.created_at.is_none() {
            config.created_at = Some(Utc::now());
        }

        let mut state = self.state.write().await;
        if state.entries.contains_key(&config.id) {
            return Err(NlqError::DuplicateId(config.id));
        }

        let handler = factory::make(&config)?;
        let id = config.id.clone();
        let name = config.name.clone();
        state.entries.insert(
            id.clone(),
            Entry {
                handler,
                status: ConnectionStatus::Configured,
                connected_at: None,
                last_error: None,
                config,
            },
        );
        state.record("created", &id, &name);
        self.persist(&state);
        info!("Created connection: {} ({})", name, id);
        Ok(id)
    }

    /// Replace the config of an existing connection. The old handler is torn
    /// down; the connection returns to `configured` and loses its active
    /// flag until re-activated.
    pub async fn update(&self, id: &str, mut config: ConnectionConfig) -> Result<()> {
        config.id = id.to_string();
        factory::validate(&config)?;

        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| NlqError::NotFound(id.to_string()))?;

        if config.created_at.is_none() {
            config.created_at = entry.config.created_at;
        }
        let name = config.name.clone();
        let handler = factory::make(&config)?;
        let old = std::mem::replace(
            entry,
            Entry {
                handler,
                status: ConnectionStatus::Configured,
                connected_at: None,
                last_error: None,
                config,
            },
        );
        old.handler.disconnect().await;

        if state.active_id.as_deref() == Some(id) {
            state.active_id = None;
        }
        state.record("updated", id, &name);
        self.persist(&state);
        info!("Updated connection: {}", name);
        Ok(())
    }

    /// Try a config without persisting anything.
    pub async fn test_config(&self, config: &ConnectionConfig) -> Result<TestResult> {
        factory::validate(config)?;
        let mut probe = config.clone();
        if probe.id.is_empty() {
            probe.id = "test".to_string();
        }
        let handler = factory::make(&probe)?;
        let result = handler.test().await;
        handler.disconnect().await;
        Ok(result)
    }

    /// Connect the target and make it the single active connection, demoting
    /// any previous one (which stays connected). Idempotent on the active id.
    pub async fn activate(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| NlqError::NotFound(id.to_string()))?;

        entry.status = ConnectionStatus::Connecting;
        let handler = Arc::clone(&entry.handler);
        match handler.connect().await {
            Ok(()) => {
                entry.status = ConnectionStatus::Connected;
                entry.connected_at = Some(Utc::now());
                entry.last_error = None;
            }
            Err(e) => {
                entry.status = ConnectionStatus::Error;
                entry.last_error = Some(e.to_string());
                return Err(NlqError::ConnectFailed(e.to_string()));
            }
        }

        let name = entry.config.name.clone();
        state.active_id = Some(id.to_string());
        state.record("activated", id, &name);
        info!("Activated connection: {}", name);
        Ok(())
    }

    /// Drop the active flag; the connection stays connected.
    pub async fn deactivate(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.entries.contains_key(id) {
            return Err(NlqError::NotFound(id.to_string()));
        }
        if state.active_id.as_deref() == Some(id) {
            state.active_id = None;
            let name = state.entries[id].config.name.clone();
            state.record("deactivated", id, &name);
        }
        Ok(())
    }

    /// Tear down and delete a connection. Removing a missing id is a no-op;
    /// removing the active connection deactivates it first.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let Some(entry) = state.entries.remove(id) else {
            return Ok(());
        };
        if state.active_id.as_deref() == Some(id) {
            state.active_id = None;
        }
        entry.handler.disconnect().await;
        let name = entry.config.name.clone();
        state.record("removed", id, &name);
        self.persist(&state);
        info!("Removed connection: {}", name);
        Ok(())
    }

    /// Disconnect and reconnect an existing connection.
    pub async fn refresh(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let entry = state
            .entries
            .get_mut(id)
            .ok_or_else(|| NlqError::NotFound(id.to_string()))?;

        let handler = Arc::clone(&entry.handler);
        handler.disconnect().await;
        entry.status = ConnectionStatus::Connecting;
        match handler.connect().await {
            Ok(()) => {
                entry.status = ConnectionStatus::Connected;
                entry.connected_at = Some(Utc::now());
                entry.last_error = None;
                let name = entry.config.name.clone();
                state.record("refreshed", id, &name);
                Ok(())
            }
            Err(e) => {
                entry.status = ConnectionStatus::Error;
                entry.last_error = Some(e.to_string());
                Err(NlqError::ConnectFailed(e.to_string()))
            }
        }
    }

    async fn resolve(&self, id: Option<&str>) -> Result<(String, Arc<dyn DatabaseHandler>)> {
        let state = self.state.read().await;
        let id = match id {
            Some(id) => id.to_string(),
            None => state
                .active_id
                .clone()
                .ok_or_else(|| NlqError::NotConnected("no active connection".to_string()))?,
        };
        let entry = state
            .entries
            .get(&id)
            .ok_or_else(|| NlqError::NotFound(id.clone()))?;
        if entry.status != ConnectionStatus::Connected {
            return Err(NlqError::NotConnected(id));
        }
        Ok((id, Arc::clone(&entry.handler)))
    }

    /// Schema of one connection (or the active one). With
    /// `include_columns = false` the handler skips per-column introspection.
    pub async fn schema(&self, id: Option<&str>, include_columns: bool) -> Result<SchemaSnapshot> {
        let (_, handler) = self.resolve(id).await?;
        handler.schema(include_columns).await
    }

    /// Execute against one connection (or the active one), bounded by the
    /// execute timeout.
    pub async fn execute(
        &self,
        id: Option<&str>,
        query: Query,
        params: Option<Row>,
    ) -> Result<QueryResult> {
        let (id, handler) = self.resolve(id).await?;
        match tokio::time::timeout(EXECUTE_TIMEOUT, handler.execute(query, params)).await {
            Ok(result) => Ok(result),
            Err(_) => {
                warn!("Execute on {} exceeded {}s", id, EXECUTE_TIMEOUT.as_secs());
                Err(NlqError::Timeout(format!(
                    "execute on connection {} exceeded {}s",
                    id,
                    EXECUTE_TIMEOUT.as_secs()
                )))
            }
        }
    }

    pub async fn active(&self) -> Option<String> {
        self.state.read().await.active_id.clone()
    }

    /// Supported verbs of the active connection, for tool building.
    pub async fn active_operations(&self) -> Vec<String> {
        let state = self.state.read().await;
        state
            .active_id
            .as_ref()
            .and_then(|id| state.entries.get(id))
            .map(|e| e.handler.supported_operations())
            .unwrap_or_default()
    }

    /// Text schema summary of the active connection for the planner;
    /// "none" when nothing is active or the snapshot fails.
    pub async fn active_schema_summary(&self) -> String {
        let Some(id) = self.active().await else {
            return "none".to_string();
        };
        match self.schema(Some(&id), true).await {
            Ok(snapshot) => snapshot.summary(),
            Err(e) => {
                warn!("Schema snapshot for planner failed: {}", e);
                "none".to_string()
            }
        }
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let state = self.state.read().await;
        let mut infos: Vec<ConnectionInfo> = state
            .entries
            .values()
            .map(|entry| ConnectionInfo {
                id: entry.config.id.clone(),
                name: entry.config.name.clone(),
                kind: entry.config.kind,
                status: entry.status,
                active: state.active_id.as_deref() == Some(entry.config.id.as_str()),
                host: entry.config.host.clone(),
                port: entry.config.port,
                database: entry.config.database.clone(),
                connected_at: entry.connected_at,
                last_error: entry.last_error.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn get(&self, id: &str) -> Result<ConnectionInfo> {
        self.list()
            .await
            .into_iter()
            .find(|info| info.id == id)
            .ok_or_else(|| NlqError::NotFound(id.to_string()))
    }

    /// Round-trip test of every registered connection.
    pub async fn health(&self) -> HashMap<String, bool> {
        let handlers: Vec<(String, Arc<dyn DatabaseHandler>)> = {
            let state = self.state.read().await;
            state
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), Arc::clone(&entry.handler)))
                .collect()
        };
        let mut results = HashMap::new();
        for (id, handler) in handlers {
            results.insert(id, handler.test().await.success);
        }
        results
    }

    pub async fn stats(&self) -> ManagerStats {
        let state = self.state.read().await;
        let mut by_kind: HashMap<String, usize> = HashMap::new();
        for entry in state.entries.values() {
            *by_kind.entry(entry.config.kind.as_str().to_string()).or_insert(0) += 1;
        }
        ManagerStats {
            total_connections: state.entries.len(),
            active_connection: state.active_id.clone(),
            connections_by_kind: by_kind,
            history_count: state.history.len(),
        }
    }

    pub async fn history(&self, limit: usize) -> Vec<ConnectionEvent> {
        let state = self.state.read().await;
        state.history.iter().rev().take(limit).cloned().collect()
    }
}
