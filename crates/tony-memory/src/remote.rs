//! Mirror of the local store on a PostgREST-style REST data service.
//!
//! Every call here is best effort from the caller's point of view: memories log
//! and swallow [`RemoteError`] so the local store stays the source of truth.

use chrono::{DateTime, Utc};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tony_core::records::{clamp_unit, DEFAULT_CATEGORY};
use tony_core::{
    EpisodicRecord, MessageType, ProceduralRecord, RemoteConfig, SemanticRecord,
};
use tracing::{debug, warn};

pub const CHAT_HISTORY_TABLE: &str = "chat_history";
pub const SEMANTIC_TABLE: &str = "semantic_memory";
pub const PROCEDURAL_TABLE: &str = "procedural_memory";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote {table} returned unexpected status {status}")]
    Status { table: String, status: u16 },
    #[error("remote decode error: {0}")]
    Decode(String),
    #[error("remote store not configured: missing {0}")]
    NotConfigured(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFilter {
    Eq(String, String),
    ILike(String, String),
    Like(String, String),
}

impl RemoteFilter {
    fn to_param(&self) -> (String, String) {
        match self {
            RemoteFilter::Eq(column, value) => (column.clone(), format!("eq.{value}")),
            RemoteFilter::ILike(column, value) => (column.clone(), format!("ilike.*{value}*")),
            RemoteFilter::Like(column, pattern) => (column.clone(), format!("like.{pattern}")),
        }
    }
}

/// Row selector shared by GET, PATCH and DELETE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteQuery {
    pub filters: Vec<RemoteFilter>,
    pub order: Option<String>,
}

impl RemoteQuery {
    pub fn session(session_id: &str) -> Self {
        Self::default().eq("session_id", session_id)
    }

    pub fn eq(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters
            .push(RemoteFilter::Eq(column.to_string(), value.into()));
        self
    }

    /// Case-insensitive substring match.
    pub fn ilike(mut self, column: &str, value: impl Into<String>) -> Self {
        self.filters
            .push(RemoteFilter::ILike(column.to_string(), value.into()));
        self
    }

    /// Raw `like` pattern, `*` as wildcard.
    pub fn like(mut self, column: &str, pattern: impl Into<String>) -> Self {
        self.filters
            .push(RemoteFilter::Like(column.to_string(), pattern.into()));
        self
    }

    pub fn order_by(mut self, order: &str) -> Self {
        self.order = Some(order.to_string());
        self
    }

    pub fn to_params(&self) -> Vec<(String, String)> {
        let mut params = self
            .filters
            .iter()
            .map(RemoteFilter::to_param)
            .collect::<Vec<_>>();
        if let Some(order) = &self.order {
            params.push(("order".to_string(), order.clone()));
        }
        params
    }
}

pub trait RemoteStore: Send + Sync {
    fn fetch(&self, table: &str, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError>;
    fn insert(&self, table: &str, row: &Value) -> Result<(), RemoteError>;
    fn update(&self, table: &str, query: &RemoteQuery, patch: &Value) -> Result<(), RemoteError>;
    fn delete(&self, table: &str, query: &RemoteQuery) -> Result<(), RemoteError>;
}

/// Writes `row` under its logical key: PATCH when a row already matches `key`,
/// POST otherwise.
pub fn upsert_by_key(
    remote: &dyn RemoteStore,
    table: &str,
    key: &RemoteQuery,
    row: &Value,
) -> Result<(), RemoteError> {
    if remote.fetch(table, key)?.is_empty() {
        remote.insert(table, row)
    } else {
        remote.update(table, key, row)
    }
}

/// Decodes remote rows into typed wire rows, skipping the malformed ones.
pub fn decode_rows<T: DeserializeOwned>(table: &str, rows: Vec<Value>) -> Vec<T> {
    let mut decoded = Vec::with_capacity(rows.len());
    for row in rows {
        match serde_json::from_value::<T>(row) {
            Ok(value) => decoded.push(value),
            Err(err) => warn!(event = "remote_row_malformed", table, error = %err),
        }
    }
    decoded
}

pub struct RestRemoteStore {
    client: Client,
    base_url: String,
    api_key: String,
}

impl RestRemoteStore {
    pub fn new(config: &RemoteConfig) -> Result<Self, RemoteError> {
        let base_url = config.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(RemoteError::NotConfigured("base_url"));
        }
        let api_key = config.api_key.trim().to_string();
        if api_key.is_empty() {
            return Err(RemoteError::NotConfigured("api_key"));
        }

        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn request(&self, method: Method, table: &str) -> RequestBuilder {
        self.client
            .request(method, self.table_url(table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }
}

fn expect_status(
    table: &str,
    response: Response,
    accepted: &[StatusCode],
) -> Result<Response, RemoteError> {
    let status = response.status();
    if accepted.contains(&status) {
        return Ok(response);
    }
    Err(RemoteError::Status {
        table: table.to_string(),
        status: status.as_u16(),
    })
}

impl RemoteStore for RestRemoteStore {
    fn fetch(&self, table: &str, query: &RemoteQuery) -> Result<Vec<Value>, RemoteError> {
        let response = self
            .request(Method::GET, table)
            .query(&query.to_params())
            .send()?;
        let response = expect_status(table, response, &[StatusCode::OK])?;
        let rows = response
            .json::<Vec<Value>>()
            .map_err(|err| RemoteError::Decode(err.to_string()))?;
        debug!(event = "remote_fetch", table, rows = rows.len());
        Ok(rows)
    }

    fn insert(&self, table: &str, row: &Value) -> Result<(), RemoteError> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=minimal")
            .json(row)
            .send()?;
        expect_status(table, response, &[StatusCode::CREATED])?;
        Ok(())
    }

    fn update(&self, table: &str, query: &RemoteQuery, patch: &Value) -> Result<(), RemoteError> {
        let response = self
            .request(Method::PATCH, table)
            .header("Prefer", "return=minimal")
            .query(&query.to_params())
            .json(patch)
            .send()?;
        expect_status(table, response, &[StatusCode::NO_CONTENT])?;
        Ok(())
    }

    fn delete(&self, table: &str, query: &RemoteQuery) -> Result<(), RemoteError> {
        let response = self
            .request(Method::DELETE, table)
            .query(&query.to_params())
            .send()?;
        expect_status(table, response, &[StatusCode::OK, StatusCode::NO_CONTENT])?;
        Ok(())
    }
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_unit() -> f64 {
    1.0
}

fn default_usage_count() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatHistoryRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub session_id: String,
    pub message_type: MessageType,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl ChatHistoryRow {
    pub fn into_record(self) -> EpisodicRecord {
        EpisodicRecord {
            id: self.id.unwrap_or_default(),
            session_id: self.session_id,
            message_type: self.message_type,
            content: self.content,
            metadata: self.metadata,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            synced_to_remote: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticMemoryRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub session_id: String,
    pub concept: String,
    pub knowledge: String,
    #[serde(default = "default_category")]
    pub category: String,
    #[serde(default = "default_unit")]
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl SemanticMemoryRow {
    pub fn into_record(self) -> SemanticRecord {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        SemanticRecord {
            id: self.id.unwrap_or_default(),
            session_id: self.session_id,
            concept: self.concept,
            knowledge: self.knowledge,
            category: self.category,
            confidence: clamp_unit(self.confidence),
            created_at,
            updated_at: self.updated_at.unwrap_or(created_at),
            synced_to_remote: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProceduralMemoryRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub session_id: String,
    pub procedure_name: String,
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub context: String,
    #[serde(default = "default_unit")]
    pub success_rate: f64,
    #[serde(default = "default_usage_count")]
    pub usage_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

impl ProceduralMemoryRow {
    pub fn into_record(self) -> ProceduralRecord {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        ProceduralRecord {
            id: self.id.unwrap_or_default(),
            session_id: self.session_id,
            procedure_name: self.procedure_name,
            steps: self.steps,
            context: self.context,
            success_rate: clamp_unit(self.success_rate),
            usage_count: self.usage_count.max(1),
            created_at,
            last_used: self.last_used.unwrap_or(created_at),
            synced_to_remote: true,
        }
    }
}

/// Serializes a wire row into the JSON body sent to the service.
pub fn to_payload<T: Serialize>(row: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(row).map_err(|err| RemoteError::Decode(err.to_string()))
}
