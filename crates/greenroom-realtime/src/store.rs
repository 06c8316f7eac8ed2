//! Initial-fetch query interface.
//!
//! A change feed seeds itself with a point-in-time read of the rows matching
//! its scope before applying live events. The read goes through [`RowSource`]
//! so the hosted REST surface and the in-process tables used by tests and the
//! demo app are interchangeable.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use url::Url;

use crate::error::{RealtimeError, RealtimeResult};
use crate::event::FeedScope;

#[async_trait]
pub trait RowSource: Send + Sync {
    /// Point-in-time read of all rows matching the scope.
    async fn fetch_rows(&self, scope: &FeedScope) -> RealtimeResult<Vec<Value>>;
}

/// Connection settings for the hosted REST read path.
#[derive(Debug, Clone)]
pub struct RestConfig {
    base_url: Url,
    api_key: String,
}

impl RestConfig {
    pub fn new(base_url: impl AsRef<str>, api_key: impl Into<String>) -> RealtimeResult<Self> {
        let mut base = base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(RealtimeError::InvalidConfig(
                "rest base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("https://{base}");
        }
        let parsed = Url::parse(&base)
            .map_err(|err| RealtimeError::InvalidConfig(format!("invalid rest base url: {err}")))?;
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(RealtimeError::InvalidConfig("api key cannot be empty".into()));
        }
        Ok(Self {
            base_url: parsed,
            api_key,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

/// Reads table slices from the hosted platform's PostgREST-style endpoint.
#[derive(Debug, Clone)]
pub struct RestRowSource {
    http: reqwest::Client,
    config: RestConfig,
}

impl RestRowSource {
    pub fn new(config: RestConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait]
impl RowSource for RestRowSource {
    async fn fetch_rows(&self, scope: &FeedScope) -> RealtimeResult<Vec<Value>> {
        let mut url = self
            .config
            .base_url
            .join(&format!("rest/v1/{}", scope.table))
            .map_err(|err| RealtimeError::Fetch(format!("invalid table url: {err}")))?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("select", "*");
            if let Some(filter) = &scope.filter {
                pairs.append_pair(&filter.column, &format!("eq.{}", filter.value));
            }
        }

        let response = self
            .http
            .get(url)
            .header("apikey", self.config.api_key.as_str())
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(|err| RealtimeError::Fetch(err.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RealtimeError::Fetch(format!(
                "unexpected status {status} body={body}"
            )));
        }

        response
            .json::<Vec<Value>>()
            .await
            .map_err(|err| RealtimeError::Fetch(format!("invalid row payload: {err}")))
    }
}

/// In-memory tables for tests and the demo app.
#[derive(Debug, Default)]
pub struct MemoryTables {
    tables: parking_lot::RwLock<HashMap<String, Vec<Value>>>,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a row, keyed by its `id` field.
    pub fn upsert(&self, table: &str, row: Value) {
        let mut tables = self.tables.write();
        let rows = tables.entry(table.to_string()).or_default();
        let id = row.get("id").and_then(Value::as_str).map(str::to_string);
        match id.and_then(|id| {
            rows.iter()
                .position(|existing| existing.get("id").and_then(Value::as_str) == Some(id.as_str()))
        }) {
            Some(idx) => rows[idx] = row,
            None => rows.push(row),
        }
    }

    pub fn remove(&self, table: &str, id: &str) {
        let mut tables = self.tables.write();
        if let Some(rows) = tables.get_mut(table) {
            rows.retain(|row| row.get("id").and_then(Value::as_str) != Some(id));
        }
    }

    pub fn clear(&self, table: &str) {
        self.tables.write().remove(table);
    }
}

#[async_trait]
impl RowSource for MemoryTables {
    async fn fetch_rows(&self, scope: &FeedScope) -> RealtimeResult<Vec<Value>> {
        let tables = self.tables.read();
        let rows = tables.get(&scope.table).cloned().unwrap_or_default();
        match &scope.filter {
            Some(filter) => Ok(rows
                .into_iter()
                .filter(|row| match row.get(&filter.column) {
                    Some(Value::String(s)) => *s == filter.value,
                    Some(other) => other.to_string() == filter.value,
                    None => false,
                })
                .collect()),
            None => Ok(rows),
        }
    }
}
