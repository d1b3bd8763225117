//! Connection manager invariants: single active connection, idempotent
//! operations, persistence round-trip. Uses external_api connections so no
//! real backend is needed (connect only builds an HTTP client).

use nlq_engine::backend::{BackendKind, ConnectionConfig, ConnectionStatus};
use nlq_engine::manager::ConnectionManager;
use nlq_engine::NlqError;

fn api_config(id: &str, name: &str) -> ConnectionConfig {
    ConnectionConfig {
        id: id.to_string(),
        name: name.to_string(),
        kind: BackendKind::ExternalApi,
        host: None,
        port: None,
        database: None,
        username: None,
        password: None,
        ssl: false,
        schema: None,
        connection_string: None,
        auth_source: None,
        file_path: None,
        mode: None,
        base_url: Some("http://localhost:9".to_string()),
        api_key: None,
        tables: Vec::new(),
        created_at: None,
    }
}

fn temp_store() -> tempfile::TempDir {
    tempfile::tempdir().expect("tempdir")
}

#[tokio::test]
async fn test_create_rejects_duplicate_id() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("c1", "first")).await.unwrap();
    let err = manager.create(api_config("c1", "second")).await.unwrap_err();
    assert!(matches!(err, NlqError::DuplicateId(_)));
}

#[tokio::test]
async fn test_create_generates_id_when_missing() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    let id = manager.create(api_config("", "anon")).await.unwrap();
    assert!(!id.is_empty());
    assert!(manager.get(&id).await.is_ok());
}

#[tokio::test]
async fn test_at_most_one_active_connection() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "a")).await.unwrap();
    manager.create(api_config("b", "b")).await.unwrap();

    manager.activate("a").await.unwrap();
    assert_eq!(manager.active().await.as_deref(), Some("a"));

    manager.activate("b").await.unwrap();
    assert_eq!(manager.active().await.as_deref(), Some("b"));

    let infos = manager.list().await;
    let active_count = infos.iter().filter(|i| i.active).count();
    assert_eq!(active_count, 1);

    // The demoted connection is still connected, just not active.
    let a = infos.iter().find(|i| i.id == "a").unwrap();
    assert_eq!(a.status, ConnectionStatus::Connected);
    assert!(!a.active);
}

#[tokio::test]
async fn test_activate_is_idempotent() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "a")).await.unwrap();
    manager.activate("a").await.unwrap();
    manager.activate("a").await.unwrap();
    assert_eq!(manager.active().await.as_deref(), Some("a"));
    assert_eq!(manager.list().await.iter().filter(|i| i.active).count(), 1);
}

#[tokio::test]
async fn test_activate_unknown_id_fails() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));
    let err = manager.activate("missing").await.unwrap_err();
    assert!(matches!(err, NlqError::NotFound(_)));
}

#[tokio::test]
async fn test_remove_of_missing_id_is_a_noop() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));
    assert!(manager.remove("never-existed").await.is_ok());
}

#[tokio::test]
async fn test_remove_active_connection_deactivates_first() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "a")).await.unwrap();
    manager.activate("a").await.unwrap();
    manager.remove("a").await.unwrap();

    assert_eq!(manager.active().await, None);
    assert!(manager.get("a").await.is_err());
}

#[tokio::test]
async fn test_execute_on_non_connected_fails_with_not_connected() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "a")).await.unwrap();
    // Created but never activated: schema and execute must refuse.
    let err = manager.schema(Some("a"), false).await.unwrap_err();
    assert!(matches!(err, NlqError::NotConnected(_)));

    let err = manager
        .execute(Some("a"), nlq_engine::backend::Query::Sql("SELECT 1".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NlqError::NotConnected(_)));
}

#[tokio::test]
async fn test_execute_without_active_connection_fails() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));
    let err = manager
        .execute(None, nlq_engine::backend::Query::Sql("SELECT 1".to_string()), None)
        .await
        .unwrap_err();
    assert!(matches!(err, NlqError::NotConnected(_)));
}

#[tokio::test]
async fn test_configs_survive_restart() {
    let dir = temp_store();
    let store = dir.path().join("connections.json");

    {
        let manager = ConnectionManager::new(store.clone());
        manager.create(api_config("a", "first")).await.unwrap();
        manager.create(api_config("b", "second")).await.unwrap();
        manager.activate("a").await.unwrap();
    }

    let manager = ConnectionManager::new(store);
    let loaded = manager.load().await.unwrap();
    assert_eq!(loaded, 2);

    // Loaded connections are configured, not connected, and nothing is
    // active until the caller activates explicitly.
    assert_eq!(manager.active().await, None);
    for info in manager.list().await {
        assert_eq!(info.status, ConnectionStatus::Configured);
    }
}

#[tokio::test]
async fn test_history_and_stats_track_mutations() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "a")).await.unwrap();
    manager.activate("a").await.unwrap();
    manager.remove("a").await.unwrap();

    let history = manager.history(10).await;
    let actions: Vec<&str> = history.iter().map(|e| e.action.as_str()).collect();
    assert!(actions.contains(&"created"));
    assert!(actions.contains(&"activated"));
    assert!(actions.contains(&"removed"));

    let stats = manager.stats().await;
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.active_connection, None);
}

#[tokio::test]
async fn test_update_replaces_config_and_drops_active_flag() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "old-name")).await.unwrap();
    manager.activate("a").await.unwrap();

    manager.update("a", api_config("a", "new-name")).await.unwrap();
    let info = manager.get("a").await.unwrap();
    assert_eq!(info.name, "new-name");
    assert_eq!(info.status, ConnectionStatus::Configured);
    assert_eq!(manager.active().await, None);

    let err = manager.update("missing", api_config("missing", "x")).await.unwrap_err();
    assert!(matches!(err, NlqError::NotFound(_)));
}

#[tokio::test]
async fn test_deactivate_keeps_connection_alive() {
    let dir = temp_store();
    let manager = ConnectionManager::new(dir.path().join("connections.json"));

    manager.create(api_config("a", "a")).await.unwrap();
    manager.activate("a").await.unwrap();
    manager.deactivate("a").await.unwrap();

    assert_eq!(manager.active().await, None);
    let info = manager.get("a").await.unwrap();
    assert_eq!(info.status, ConnectionStatus::Connected);
}
