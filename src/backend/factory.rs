//! Handler registry and factory
//!
//! Enumerates supported backend kinds, describes their connection fields for
//! the UI, validates configs, and constructs handler instances. The kinds are
//! a closed set; `redis`, `oracle` and `mssql` are described but `make` fails
//! with `UnsupportedKind` until a handler is installed.

use super::api::ExternalApiHandler;
use super::kosis::KosisHandler;
use super::mongo::MongoHandler;
use super::mysql::MySqlHandler;
use super::postgres::PostgresHandler;
use super::sqlite::SqliteHandler;
use super::{BackendKind, ConnectionConfig, DatabaseHandler};
use crate::error::{NlqError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WidgetKind {
    Text,
    Number,
    Password,
    Bool,
    Select,
    Textarea,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldSchema {
    pub name: &'static str,
    pub label: &'static str,
    pub widget: WidgetKind,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

fn field(name: &'static str, label: &'static str, widget: WidgetKind, required: bool) -> FieldSchema {
    FieldSchema { name, label, widget, required, default: None }
}

fn field_with_default(
    name: &'static str,
    label: &'static str,
    widget: WidgetKind,
    required: bool,
    default: Value,
) -> FieldSchema {
    FieldSchema { name, label, widget, required, default: Some(default) }
}

/// All kinds the registry knows about, installed or not.
pub fn supported_kinds() -> Vec<BackendKind> {
    BackendKind::ALL.to_vec()
}

/// Kinds for which `make` will succeed.
pub fn installed_kinds() -> Vec<BackendKind> {
    BackendKind::ALL.iter().copied().filter(BackendKind::installed).collect()
}

/// Connection field schema for one backend kind, in display order.
pub fn describe(kind: BackendKind) -> Vec<FieldSchema> {
    match kind {
        BackendKind::Mysql => vec![
            field("host", "Host", WidgetKind::Text, true),
            field_with_default("port", "Port", WidgetKind::Number, true, Value::from(3306)),
            field("database", "Database", WidgetKind::Text, true),
            field("username", "Username", WidgetKind::Text, true),
            field("password", "Password", WidgetKind::Password, false),
            field("ssl", "Use SSL", WidgetKind::Bool, false),
            field("schema", "Schema", WidgetKind::Text, false),
        ],
        BackendKind::Postgresql | BackendKind::Oracle | BackendKind::Mssql => vec![
            field("host", "Host", WidgetKind::Text, true),
            field_with_default("port", "Port", WidgetKind::Number, true, Value::from(5432)),
            field("database", "Database", WidgetKind::Text, true),
            field("username", "Username", WidgetKind::Text, true),
            field("password", "Password", WidgetKind::Password, false),
            field("ssl", "Use SSL", WidgetKind::Bool, false),
            field_with_default("schema", "Schema", WidgetKind::Text, false, Value::from("public")),
        ],
        BackendKind::Mongodb => vec![
            field("host", "Host", WidgetKind::Text, true),
            field_with_default("port", "Port", WidgetKind::Number, true, Value::from(27017)),
            field("database", "Database", WidgetKind::Text, true),
            field("connectionString", "Connection String", WidgetKind::Textarea, false),
            field("username", "Username", WidgetKind::Text, false),
            field("password", "Password", WidgetKind::Password, false),
            field_with_default("authSource", "Auth Source", WidgetKind::Text, false, Value::from("admin")),
        ],
        BackendKind::Sqlite => vec![
            field("filePath", "Database File", WidgetKind::Text, true),
            field_with_default("mode", "Mode", WidgetKind::Select, false, Value::from("readwrite")),
        ],
        BackendKind::Redis => vec![
            field("host", "Host", WidgetKind::Text, true),
            field_with_default("port", "Port", WidgetKind::Number, true, Value::from(6379)),
            field("password", "Password", WidgetKind::Password, false),
        ],
        BackendKind::KosisApi => vec![
            field("api_key", "KOSIS API Key", WidgetKind::Password, true),
            field_with_default(
                "base_url",
                "Base URL",
                WidgetKind::Text,
                false,
                Value::from(super::kosis::KOSIS_BASE_URL),
            ),
        ],
        BackendKind::ExternalApi => vec![
            field("base_url", "Base URL", WidgetKind::Text, true),
            field("api_key", "API Key", WidgetKind::Password, false),
            field("username", "Basic Auth Username", WidgetKind::Text, false),
            field("password", "Basic Auth Password", WidgetKind::Password, false),
            field("tables", "Virtual Tables (JSON)", WidgetKind::Textarea, false),
        ],
    }
}

fn missing(config_field: &Option<String>, name: &str, problems: &mut Vec<String>) {
    if config_field.as_deref().map_or(true, |s| s.trim().is_empty()) {
        problems.push(name.to_string());
    }
}

/// Check a config against the required fields of its kind. Returns the list
/// of offending fields on failure.
pub fn validate(config: &ConnectionConfig) -> Result<()> {
    if config.name.trim().is_empty() {
        return Err(NlqError::ConfigInvalid("missing required field: name".to_string()));
    }

    let mut problems = Vec::new();
    match config.kind {
        BackendKind::Mysql | BackendKind::Postgresql | BackendKind::Oracle | BackendKind::Mssql => {
            missing(&config.host, "host", &mut problems);
            missing(&config.database, "database", &mut problems);
            missing(&config.username, "username", &mut problems);
        }
        BackendKind::Mongodb => {
            if config.connection_string.as_deref().map_or(true, str::is_empty) {
                missing(&config.host, "host", &mut problems);
                missing(&config.database, "database", &mut problems);
            }
        }
        BackendKind::Sqlite => {
            missing(&config.file_path, "filePath", &mut problems);
        }
        BackendKind::Redis => {
            missing(&config.host, "host", &mut problems);
        }
        BackendKind::KosisApi => {
            missing(&config.api_key, "api_key", &mut problems);
        }
        BackendKind::ExternalApi => {
            missing(&config.base_url, "base_url", &mut problems);
        }
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(NlqError::ConfigInvalid(format!(
            "missing required fields: {}",
            problems.join(", ")
        )))
    }
}

/// Construct a handler for a validated config.
pub fn make(config: &ConnectionConfig) -> Result<Arc<dyn DatabaseHandler>> {
    validate(config)?;

    match config.kind {
        BackendKind::Mysql => Ok(Arc::new(MySqlHandler::new(config.clone()))),
        BackendKind::Postgresql => Ok(Arc::new(PostgresHandler::new(config.clone()))),
        BackendKind::Mongodb => Ok(Arc::new(MongoHandler::new(config.clone()))),
        BackendKind::Sqlite => Ok(Arc::new(SqliteHandler::new(config.clone()))),
        BackendKind::KosisApi => Ok(Arc::new(KosisHandler::new(config.clone()))),
        BackendKind::ExternalApi => Ok(Arc::new(ExternalApiHandler::new(config.clone()))),
        BackendKind::Redis | BackendKind::Oracle | BackendKind::Mssql => {
            Err(NlqError::UnsupportedKind(config.kind.as_str().to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(kind: BackendKind) -> ConnectionConfig {
        ConnectionConfig {
            id: "c1".to_string(),
            name: "test".to_string(),
            kind,
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
            base_url: None,
            api_key: None,
            tables: Vec::new(),
            created_at: None,
        }
    }

    #[test]
    fn test_validate_lists_missing_fields() {
        let config = base_config(BackendKind::Postgresql);
        let err = validate(&config).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("host"));
        assert!(msg.contains("database"));
        assert!(msg.contains("username"));
    }

    #[test]
    fn test_validate_sqlite_requires_file_path() {
        let mut config = base_config(BackendKind::Sqlite);
        assert!(validate(&config).is_err());
        config.file_path = Some("/tmp/db.sqlite".to_string());
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_make_rejects_uninstalled_kinds() {
        let mut config = base_config(BackendKind::Redis);
        config.host = Some("localhost".to_string());
        match make(&config) {
            Err(crate::error::NlqError::UnsupportedKind(kind)) => assert_eq!(kind, "redis"),
            other => panic!("expected UnsupportedKind, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_describe_covers_every_kind() {
        for kind in supported_kinds() {
            assert!(!describe(kind).is_empty(), "no field schema for {}", kind);
        }
    }

    #[test]
    fn test_mongodb_connection_string_substitutes_host() {
        let mut config = base_config(BackendKind::Mongodb);
        config.connection_string = Some("mongodb://localhost:27017/app".to_string());
        assert!(validate(&config).is_ok());
    }
}
