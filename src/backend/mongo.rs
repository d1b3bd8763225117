//! MongoDB handler
//!
//! Takes structured queries ({operation, collection, filter, projection,
//! pipeline}) instead of SQL. Result documents are projected into rows by
//! flattening scalar fields; nested fields become dotted column names and
//! heterogeneous documents produce the union of observed fields with null
//! gaps.

use super::{
    elapsed_ms, BackendKind, ColumnDescriptor, ConnectionConfig, DatabaseHandler, DocumentQuery,
    Query, QueryResult, Row, SchemaSnapshot, TableDescriptor, TestResult,
};
use crate::error::{NlqError, Result};
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::FindOptions;
use mongodb::Client;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{info, warn};

const DEFAULT_RESULT_LIMIT: i64 = 1000;
const SCHEMA_SAMPLE_SIZE: i64 = 20;

pub struct MongoHandler {
    config: ConnectionConfig,
    client: RwLock<Option<Client>>,
}

impl MongoHandler {
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config, client: RwLock::new(None) }
    }

    fn uri(&self) -> String {
        if let Some(uri) = &self.config.connection_string {
            if !uri.is_empty() {
                return uri.clone();
            }
        }
        let host = self.config.host.as_deref().unwrap_or("localhost");
        let port = self.config.port.unwrap_or(27017);
        match (&self.config.username, &self.config.password) {
            (Some(user), Some(pass)) if !user.is_empty() => format!(
                "mongodb://{}:{}@{}:{}/?authSource={}",
                user,
                pass,
                host,
                port,
                self.config.auth_source.as_deref().unwrap_or("admin")
            ),
            _ => format!("mongodb://{}:{}", host, port),
        }
    }

    fn database_name(&self) -> String {
        self.config.database.clone().unwrap_or_else(|| "test".to_string())
    }

    async fn acquire_client(&self) -> Result<Client> {
        self.client
            .read()
            .await
            .clone()
            .ok_or_else(|| NlqError::NotConnected(self.config.id.clone()))
    }

    async fn run_find(&self, client: &Client, query: &DocumentQuery) -> Result<Vec<Document>> {
        let collection = client
            .database(&self.database_name())
            .collection::<Document>(&query.collection);

        let filter = match &query.filter {
            Some(value) => json_to_document(value)?,
            None => Document::new(),
        };
        let projection = match &query.projection {
            Some(value) => Some(json_to_document(value)?),
            None => None,
        };
        let options = FindOptions::builder()
            .projection(projection)
            .limit(query.limit.unwrap_or(DEFAULT_RESULT_LIMIT))
            .build();

        let mut cursor = collection
            .find(filter, options)
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?;

        let mut docs = Vec::new();
        while cursor
            .advance()
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?
        {
            docs.push(
                cursor
                    .deserialize_current()
                    .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?,
            );
        }
        Ok(docs)
    }

    async fn run_aggregate(&self, client: &Client, query: &DocumentQuery) -> Result<Vec<Document>> {
        let collection = client
            .database(&self.database_name())
            .collection::<Document>(&query.collection);

        let pipeline: Vec<Document> = query
            .pipeline
            .as_deref()
            .unwrap_or(&[])
            .iter()
            .map(json_to_document)
            .collect::<Result<_>>()?;

        let mut cursor = collection
            .aggregate(pipeline, None)
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?;

        let mut docs = Vec::new();
        while cursor
            .advance()
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?
        {
            docs.push(
                cursor
                    .deserialize_current()
                    .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?,
            );
        }
        Ok(docs)
    }
}

fn json_to_document(value: &Value) -> Result<Document> {
    mongodb::bson::to_document(value)
        .map_err(|e| NlqError::QueryFailed(format!("invalid document query: {}", e)))
}

/// Flatten one BSON document into a flat row. Scalars keep their name, nested
/// document scalars get dotted names, arrays are stored as serialised JSON.
fn flatten_document(doc: &Document) -> Row {
    let mut row = Row::new();
    flatten_into(&mut row, "", doc);
    row
}

fn flatten_into(row: &mut Row, prefix: &str, doc: &Document) {
    for (key, value) in doc {
        let name = if prefix.is_empty() { key.clone() } else { format!("{}.{}", prefix, key) };
        match value {
            Bson::Document(nested) => flatten_into(row, &name, nested),
            other => {
                row.insert(name, bson_scalar_to_json(other));
            }
        }
    }
}

fn bson_scalar_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::from(*b),
        Bson::Int32(n) => Value::from(*n),
        Bson::Int64(n) => Value::from(*n),
        Bson::Double(f) => Value::from(*f),
        Bson::String(s) => Value::from(s.clone()),
        Bson::ObjectId(oid) => Value::from(oid.to_hex()),
        Bson::DateTime(dt) => Value::from(dt.try_to_rfc3339_string().unwrap_or_default()),
        Bson::Decimal128(d) => d
            .to_string()
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(d.to_string())),
        Bson::Array(items) => {
            let json: Vec<Value> = items.iter().map(bson_scalar_to_json).collect();
            Value::from(serde_json::to_string(&json).unwrap_or_default())
        }
        other => Value::from(other.to_string()),
    }
}

/// Build a QueryResult over heterogeneous documents: the column set is the
/// union of observed fields, with missing cells as null.
fn documents_to_result(docs: &[Document], execution_time_ms: u64) -> QueryResult {
    let mut rows: Vec<Row> = docs.iter().map(flatten_document).collect();
    let mut columns: BTreeSet<String> = BTreeSet::new();
    for row in &rows {
        columns.extend(row.keys().cloned());
    }
    for row in &mut rows {
        for column in &columns {
            row.entry(column.clone()).or_insert(Value::Null);
        }
    }
    QueryResult::ok(columns.into_iter().collect(), rows, execution_time_ms)
}

#[async_trait]
impl DatabaseHandler for MongoHandler {
    fn kind(&self) -> BackendKind {
        BackendKind::Mongodb
    }

    fn supported_operations(&self) -> Vec<String> {
        ["find", "aggregate", "count"].iter().map(|s| s.to_string()).collect()
    }

    async fn connect(&self) -> Result<()> {
        if self.client.read().await.is_some() {
            return Ok(());
        }
        let client = Client::with_uri_str(self.uri())
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("mongodb: {}", e)))?;

        client
            .database(&self.database_name())
            .run_command(doc! {"ping": 1}, None)
            .await
            .map_err(|e| NlqError::ConnectFailed(format!("mongodb: {}", e)))?;

        info!("Connected to MongoDB: {}", self.database_name());
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn disconnect(&self) {
        if self.client.write().await.take().is_some() {
            info!("Disconnected from MongoDB");
        }
    }

    async fn is_connected(&self) -> bool {
        self.client.read().await.is_some()
    }

    async fn test(&self) -> TestResult {
        let start = Instant::now();
        let client = match Client::with_uri_str(self.uri()).await {
            Ok(client) => client,
            Err(e) => {
                return TestResult {
                    success: false,
                    message: format!("mongodb: {}", e),
                    latency_ms: elapsed_ms(start),
                    version: None,
                }
            }
        };
        match client.database(&self.database_name()).run_command(doc! {"buildInfo": 1}, None).await {
            Ok(reply) => {
                let latency_ms = elapsed_ms(start);
                TestResult {
                    success: true,
                    message: format!("Connected successfully (latency: {}ms)", latency_ms),
                    latency_ms,
                    version: reply.get_str("version").ok().map(|v| format!("MongoDB {}", v)),
                }
            }
            Err(e) => TestResult {
                success: false,
                message: format!("mongodb: {}", e),
                latency_ms: elapsed_ms(start),
                version: None,
            },
        }
    }

    async fn schema(&self, include_columns: bool) -> Result<SchemaSnapshot> {
        let client = self.acquire_client().await?;
        let db = client.database(&self.database_name());
        let names = db
            .list_collection_names(None)
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?;

        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let collection = db.collection::<Document>(&name);
            let row_count_estimate = collection
                .estimated_document_count(None)
                .await
                .ok()
                .map(|c| c as i64);

            let columns = if include_columns {
                self.sample_columns(&collection).await.unwrap_or_default()
            } else {
                Vec::new()
            };

            tables.push(TableDescriptor {
                name,
                schema_namespace: Some(self.database_name()),
                columns,
                row_count_estimate,
            });
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(SchemaSnapshot { tables })
    }

    async fn execute(&self, query: Query, _params: Option<Row>) -> QueryResult {
        let start = Instant::now();
        let doc_query = match query {
            Query::Document(doc_query) => doc_query,
            // Convenience: a JSON string arriving through the SQL path.
            Query::Sql(text) => match serde_json::from_str::<DocumentQuery>(&text) {
                Ok(doc_query) => doc_query,
                Err(_) => {
                    return QueryResult::fail(
                        "mongodb expects a structured query: {\"operation\", \"collection\", \"filter\", ...}",
                        elapsed_ms(start),
                    )
                }
            },
        };

        let client = match self.acquire_client().await {
            Ok(client) => client,
            Err(e) => return QueryResult::fail(e.to_string(), elapsed_ms(start)),
        };

        let outcome = match doc_query.operation.as_str() {
            "find" => self.run_find(&client, &doc_query).await,
            "aggregate" => self.run_aggregate(&client, &doc_query).await,
            other => Err(NlqError::QueryFailed(format!(
                "unsupported mongodb operation '{}'",
                other
            ))),
        };

        match outcome {
            Ok(docs) => documents_to_result(&docs, elapsed_ms(start)),
            Err(e) => {
                warn!("MongoDB query failed: {}", e);
                QueryResult::fail(e.to_string(), elapsed_ms(start))
            }
        }
    }
}

impl MongoHandler {
    async fn sample_columns(
        &self,
        collection: &mongodb::Collection<Document>,
    ) -> Result<Vec<ColumnDescriptor>> {
        let pipeline = vec![doc! {"$sample": {"size": SCHEMA_SAMPLE_SIZE}}];
        let mut cursor = collection
            .aggregate(pipeline, None)
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?;

        let mut columns: Vec<ColumnDescriptor> = Vec::new();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        while cursor
            .advance()
            .await
            .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?
        {
            let doc = cursor
                .deserialize_current()
                .map_err(|e| NlqError::QueryFailed(format!("MONGODB error: {}", e)))?;
            for (key, value) in flatten_document(&doc) {
                if seen.insert(key.clone()) {
                    columns.push(ColumnDescriptor {
                        name: key,
                        type_string: json_type_name(&value).to_string(),
                        nullable: true,
                        primary_key: false,
                    });
                }
            }
        }
        columns.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(columns)
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "double",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested_document_uses_dotted_names() {
        let doc = doc! {
            "name": "kim",
            "address": { "city": "seoul", "zip": "04524" },
            "age": 31
        };
        let row = flatten_document(&doc);
        assert_eq!(row.get("name"), Some(&Value::from("kim")));
        assert_eq!(row.get("address.city"), Some(&Value::from("seoul")));
        assert_eq!(row.get("age"), Some(&Value::from(31)));
    }

    #[test]
    fn test_heterogeneous_documents_produce_union_with_nulls() {
        let docs = vec![doc! {"a": 1}, doc! {"b": "two"}];
        let result = documents_to_result(&docs, 0);
        assert!(result.success);
        assert_eq!(result.columns, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(result.rows[0].get("b"), Some(&Value::Null));
        assert_eq!(result.rows[1].get("a"), Some(&Value::Null));
    }

    #[test]
    fn test_array_values_are_serialised() {
        let doc = doc! {"tags": ["x", "y"]};
        let row = flatten_document(&doc);
        assert_eq!(row.get("tags"), Some(&Value::from("[\"x\",\"y\"]")));
    }
}
