//! REST client for the remote record service.
//!
//! Surface, per collection descriptor:
//!
//! - `GET /{table}?{owner_column}={principal}` lists a principal's rows
//! - `POST /{table}` creates a row and answers with it (object or `[object]`)
//! - `PATCH /{table}/{id}` updates a row
//! - `DELETE /{table}/{id}` deletes a row
//! - `GET|DELETE /{child_table}?{parent_column}={id}` reads or clears children
//! - `POST /{child_table}` inserts an array of child rows
//!
//! Rows carry `id` and `updated_at` (RFC 3339) next to the mapped columns.

use super::{RemoteCollection, RemoteService};
use crate::RemoteError;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::future::try_join_all;
use parking_lot::RwLock;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tandem_engine::{
    derive_stable_local_id, is_remote_id, ChildSpec, CollectionDescriptor, Record, RemoteId,
    Timestamp,
};

const ID_COLUMN: &str = "id";
const UPDATED_AT_COLUMN: &str = "updated_at";

/// HTTP implementation of [`RemoteService`].
#[derive(Clone)]
pub struct HttpRemote {
    inner: Arc<HttpInner>,
}

struct HttpInner {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl HttpRemote {
    /// Create a client for the service rooted at `base_url`.
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder().timeout(request_timeout).build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();

        Ok(Self {
            inner: Arc::new(HttpInner {
                client,
                base_url,
                token: RwLock::new(None),
            }),
        })
    }

    /// Builder-style bearer token.
    pub fn with_token(self, token: impl Into<String>) -> Self {
        self.set_token(Some(token.into()));
        self
    }

    /// Replace the bearer token, e.g. after the host refreshed credentials.
    /// Shared by every collection handle already handed out.
    pub fn set_token(&self, token: Option<String>) {
        *self.inner.token.write() = token;
    }
}

impl RemoteService for HttpRemote {
    fn collection(&self, descriptor: &CollectionDescriptor) -> Arc<dyn RemoteCollection> {
        Arc::new(HttpCollection {
            inner: self.inner.clone(),
            descriptor: descriptor.clone(),
        })
    }
}

impl HttpInner {
    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}/{}", self.base_url, path));
        match self.token.read().as_deref() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

/// Send a request and decode the (possibly empty) JSON body.
async fn send(builder: RequestBuilder) -> Result<Option<Value>, RemoteError> {
    let response = builder.send().await?;
    let status = response.status();
    let bytes = response.bytes().await?;

    if !status.is_success() {
        let detail = format!("{}: {}", status, String::from_utf8_lossy(&bytes).trim());
        return Err(status_error(status, detail));
    }

    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| RemoteError::Protocol(e.to_string()))
}

fn status_error(status: StatusCode, detail: String) -> RemoteError {
    match status.as_u16() {
        401 | 403 => RemoteError::Auth(detail),
        404 => RemoteError::NotFound(detail),
        408 | 429 => RemoteError::Network(detail),
        400..=499 => RemoteError::Validation(detail),
        _ => RemoteError::Network(detail),
    }
}

/// First row of a body that is either a row or an array of rows.
fn single_row(body: Option<Value>) -> Option<Map<String, Value>> {
    match body? {
        Value::Object(row) => Some(row),
        Value::Array(rows) => rows.into_iter().next().and_then(|row| match row {
            Value::Object(row) => Some(row),
            _ => None,
        }),
        _ => None,
    }
}

fn rows(body: Option<Value>) -> Result<Vec<Value>, RemoteError> {
    match body {
        None => Ok(Vec::new()),
        Some(Value::Array(rows)) => Ok(rows),
        Some(other) => Err(RemoteError::Protocol(format!(
            "expected an array of rows, got {}",
            other
        ))),
    }
}

pub(crate) fn encode_timestamp(millis: Timestamp) -> Value {
    i64::try_from(millis)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
        .map(|dt| Value::String(dt.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .unwrap_or_else(|| Value::from(millis))
}

pub(crate) fn decode_timestamp(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .and_then(|dt| u64::try_from(dt.timestamp_millis()).ok()),
        _ => None,
    }
}

struct HttpCollection {
    inner: Arc<HttpInner>,
    descriptor: CollectionDescriptor,
}

impl HttpCollection {
    fn row_body(&self, principal: &str, record: &Record) -> Value {
        let mut columns = self.descriptor.to_columns(record);
        columns.insert(
            self.descriptor.owner_column.clone(),
            Value::from(principal),
        );
        columns.insert(
            UPDATED_AT_COLUMN.to_string(),
            encode_timestamp(record.updated_at),
        );
        Value::Object(columns)
    }

    fn row_to_record(&self, row: &Map<String, Value>) -> Result<Record, RemoteError> {
        let remote_id = row
            .get(ID_COLUMN)
            .and_then(Value::as_str)
            .filter(|id| is_remote_id(id))
            .ok_or_else(|| {
                RemoteError::Protocol(format!(
                    "{} row without a valid '{}'",
                    self.descriptor.table, ID_COLUMN
                ))
            })?;
        let updated_at = row
            .get(UPDATED_AT_COLUMN)
            .and_then(decode_timestamp)
            .unwrap_or(0);
        let fields = self.descriptor.from_columns(row);

        Ok(
            Record::new(derive_stable_local_id(remote_id), updated_at, Value::Object(fields))
                .with_remote_id(remote_id),
        )
    }

    async fn load_children(&self, spec: &ChildSpec, record: &mut Record) -> Result<(), RemoteError> {
        let Some(parent) = record.remote_id.clone() else {
            return Ok(());
        };
        let body = send(
            self.inner
                .request(Method::GET, &spec.table)
                .query(&[(spec.parent_column.as_str(), parent.as_str())]),
        )
        .await?;
        let children = spec.from_rows(&rows(body)?);
        record.fields.insert(spec.field.clone(), children);
        Ok(())
    }

    async fn clear_children(&self, spec: &ChildSpec, parent: &str) -> Result<(), RemoteError> {
        let result = send(
            self.inner
                .request(Method::DELETE, &spec.table)
                .query(&[(spec.parent_column.as_str(), parent)]),
        )
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Delete-then-reinsert-all; children are never diffed.
    async fn replace_children(&self, record: &Record, parent: &str) -> Result<(), RemoteError> {
        let Some(spec) = &self.descriptor.children else {
            return Ok(());
        };
        self.clear_children(spec, parent).await?;

        let rows = spec.to_rows(record, parent);
        if !rows.is_empty() {
            send(self.inner.request(Method::POST, &spec.table).json(&rows)).await?;
        }
        tracing::debug!(
            table = %spec.table,
            parent = %parent,
            children = rows.len(),
            "Replaced child rows"
        );
        Ok(())
    }
}

#[async_trait]
impl RemoteCollection for HttpCollection {
    fn descriptor(&self) -> &CollectionDescriptor {
        &self.descriptor
    }

    async fn create(&self, principal: &str, record: &Record) -> Result<Record, RemoteError> {
        let body = send(
            self.inner
                .request(Method::POST, &self.descriptor.table)
                .header("Prefer", "return=representation")
                .json(&self.row_body(principal, record)),
        )
        .await?;
        let row = single_row(body).ok_or_else(|| {
            RemoteError::Protocol(format!("create on {} returned no row", self.descriptor.table))
        })?;
        let created = self.row_to_record(&row)?;
        let remote_id = created.remote_id.clone().unwrap_or_default();

        if let Err(e) = self.replace_children(record, &remote_id).await {
            // Without its children the row is incomplete; drop it so a retry
            // does not leave a duplicate parent behind.
            if let Err(cleanup) = self.delete(principal, &remote_id).await {
                tracing::warn!(
                    table = %self.descriptor.table,
                    remote_id = %remote_id,
                    error = %cleanup,
                    "Failed to remove parent row after child write failure"
                );
            }
            return Err(e);
        }

        Ok(record.clone().with_remote_id(remote_id))
    }

    async fn update(
        &self,
        principal: &str,
        remote_id: &RemoteId,
        record: &Record,
    ) -> Result<Record, RemoteError> {
        let body = send(
            self.inner
                .request(
                    Method::PATCH,
                    &format!("{}/{}", self.descriptor.table, remote_id),
                )
                .query(&[(self.descriptor.owner_column.as_str(), principal)])
                .header("Prefer", "return=representation")
                .json(&self.row_body(principal, record)),
        )
        .await?;

        // An empty array means the filter matched nothing.
        if matches!(&body, Some(Value::Array(rows)) if rows.is_empty()) {
            return Err(RemoteError::NotFound(format!(
                "{}/{}",
                self.descriptor.table, remote_id
            )));
        }

        self.replace_children(record, remote_id).await?;
        Ok(record.clone().with_remote_id(remote_id.clone()))
    }

    async fn delete(&self, principal: &str, remote_id: &RemoteId) -> Result<(), RemoteError> {
        if let Some(spec) = &self.descriptor.children {
            self.clear_children(spec, remote_id).await?;
        }
        send(
            self.inner
                .request(
                    Method::DELETE,
                    &format!("{}/{}", self.descriptor.table, remote_id),
                )
                .query(&[(self.descriptor.owner_column.as_str(), principal)]),
        )
        .await?;
        Ok(())
    }

    async fn list(&self, principal: &str) -> Result<Vec<Record>, RemoteError> {
        let body = send(
            self.inner
                .request(Method::GET, &self.descriptor.table)
                .query(&[(self.descriptor.owner_column.as_str(), principal)]),
        )
        .await?;

        let mut records = rows(body)?
            .iter()
            .map(|row| {
                row.as_object()
                    .ok_or_else(|| RemoteError::Protocol("row is not an object".to_string()))
                    .and_then(|row| self.row_to_record(row))
            })
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(spec) = &self.descriptor.children {
            try_join_all(records.iter_mut().map(|r| self.load_children(spec, r))).await?;
        }

        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(records)
    }
}
