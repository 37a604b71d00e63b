//! PostgREST-style HTTP implementation of [`RemoteStore`].

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{Filter, RemoteQuery, RemoteStore, Row};
use crate::error::LifecycleError;
use crate::model::{RecordKey, TableName};

/// Remote store client speaking the PostgREST query dialect.
#[derive(Clone)]
pub struct RestRemoteStore {
  client: Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
  schema: String,
}

impl RestRemoteStore {
  pub fn new(
    base: Url,
    api_key: String,
    access_token: Option<String>,
    timeout: Duration,
  ) -> Result<Self, LifecycleError> {
    let client = Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| LifecycleError::Network(format!("Failed to build HTTP client: {}", e)))?;

    Ok(Self {
      client,
      base,
      api_key,
      access_token,
      schema: "public".to_string(),
    })
  }

  /// Target a non-default database schema.
  pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
    self.schema = schema.into();
    self
  }

  fn endpoint(&self, path: &str) -> Result<Url, LifecycleError> {
    self
      .base
      .join(&format!("rest/v1/{}", path))
      .map_err(|e| LifecycleError::Network(format!("Invalid remote url: {}", e)))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    request
      .header("apikey", &self.api_key)
      .header("Accept-Profile", &self.schema)
      .header("Content-Profile", &self.schema)
      .bearer_auth(bearer)
  }

  /// Build the select url for `query`.
  pub fn select_url(&self, query: &RemoteQuery) -> Result<Url, LifecycleError> {
    let mut url = self.endpoint(query.table.as_str())?;
    {
      let mut pairs = url.query_pairs_mut();
      let columns = if query.columns.is_empty() {
        "*".to_string()
      } else {
        query.columns.join(",")
      };
      pairs.append_pair("select", &columns);

      for filter in &query.filters {
        match filter {
          Filter::Eq(column, value) => {
            pairs.append_pair(column, &format!("eq.{}", value));
          }
          Filter::In(column, values) => {
            let quoted: Vec<String> = values.iter().map(|v| quote_value(v)).collect();
            pairs.append_pair(column, &format!("in.({})", quoted.join(",")));
          }
          Filter::NotNull(column) => {
            pairs.append_pair(column, "not.is.null");
          }
          Filter::Contains(column, value) => {
            pairs.append_pair(column, &format!("cs.{{{}}}", quote_value(value)));
          }
        }
      }

      if let Some(limit) = query.limit {
        pairs.append_pair("limit", &limit.to_string());
      }
    }
    Ok(url)
  }

  async fn rpc(&self, function: &str, body: Value) -> Result<Value, LifecycleError> {
    let url = self.endpoint(&format!("rpc/{}", function))?;
    debug!(function, "Calling remote RPC");

    let response = self
      .authorize(self.client.post(url))
      .json(&body)
      .send()
      .await
      .map_err(|e| LifecycleError::Network(format!("RPC {} failed: {}", function, e)))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(LifecycleError::Network(format!(
        "RPC {} returned {}: {}",
        function, status, text
      )));
    }

    response
      .json::<Value>()
      .await
      .map_err(|e| LifecycleError::Network(format!("RPC {} returned invalid JSON: {}", function, e)))
  }

  async fn membership_rpc(
    &self,
    function: &str,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    let (function, body) = match (key, table.link_columns()) {
      (RecordKey::Single(id), None) => (
        function.to_string(),
        json!({
          "p_table_name": table.as_str(),
          "p_record_id": id,
          "p_profile_id": profile_id,
        }),
      ),
      (RecordKey::Composite(key1, key2), Some((key1_name, key2_name))) => (
        format!("{}_link", function),
        json!({
          "p_table_name": table.as_str(),
          "p_key1_name": key1_name,
          "p_key1_value": key1,
          "p_key2_name": key2_name,
          "p_key2_value": key2,
          "p_profile_id": profile_id,
        }),
      ),
      _ => {
        return Err(LifecycleError::InvalidRecordKey(format!(
          "{} does not match key shape of {}",
          key, table
        )))
      }
    };

    let value = self.rpc(&function, body).await?;
    rpc_bool(&function, &value)
  }
}

/// Membership RPCs answer with a bare boolean; anything else is a contract break.
fn rpc_bool(function: &str, value: &Value) -> Result<bool, LifecycleError> {
  value.as_bool().ok_or_else(|| {
    LifecycleError::Network(format!("RPC {} returned unexpected body: {}", function, value))
  })
}

/// Double-quote a PostgREST list value when it contains reserved characters.
fn quote_value(value: &str) -> String {
  if value.contains([',', '(', ')', '"', '{', '}', ' ']) {
    format!("\"{}\"", value.replace('"', "\\\""))
  } else {
    value.to_string()
  }
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
  async fn select(&self, query: &RemoteQuery) -> Result<Vec<Row>, LifecycleError> {
    let url = self.select_url(query)?;

    let response = self
      .authorize(self.client.get(url))
      .send()
      .await
      .map_err(|e| LifecycleError::Network(format!("Select on {} failed: {}", query.table, e)))?;

    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(LifecycleError::Network(format!(
        "Select on {} returned {}: {}",
        query.table, status, text
      )));
    }

    response
      .json::<Vec<Row>>()
      .await
      .map_err(|e| LifecycleError::Network(format!("Failed to parse {} rows: {}", query.table, e)))
  }

  async fn add_to_download_profiles(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    self
      .membership_rpc("add_to_download_profiles", table, key, profile_id)
      .await
  }

  async fn remove_from_download_profiles(
    &self,
    table: TableName,
    key: &RecordKey,
    profile_id: &str,
  ) -> Result<bool, LifecycleError> {
    self
      .membership_rpc("remove_from_download_profiles", table, key, profile_id)
      .await
  }

  async fn remove_downloaded_quest(
    &self,
    profile_id: &str,
    quest_id: &str,
  ) -> Result<bool, LifecycleError> {
    let value = self
      .rpc(
        "remove_downloaded_quest",
        json!({ "p_profile_id": profile_id, "p_quest_id": quest_id }),
      )
      .await?;
    rpc_bool("remove_downloaded_quest", &value)
  }
}
