//! ClickHouse HTTP interface client.

use std::error::Error as StdError;
use std::time::Duration;

use displaydoc::Display;
use reqwest::{Client as HttpClient, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::ClickhouseConfig;
use crate::error::{EngineError, EngineResult};

/// The User-Agent string sent to the server.
const USER_AGENT: &str = concat!("chbackup/", env!("CARGO_PKG_VERSION"));

/// The ClickHouse HTTP client.
#[derive(Debug, Clone)]
pub struct ChClient {
    /// Base endpoint of the server.
    endpoint: Url,

    /// An initialized HTTP client.
    client: HttpClient,

    user: Option<String>,
    password: Option<String>,
}

/// A query error.
#[derive(Debug, Display)]
pub enum ChError {
    /// HTTP {0}: {1}
    Query(StatusCode, String),

    /// Transport error: {0}
    Transport(reqwest::Error),

    /// Malformed response: {0}
    Malformed(serde_json::Error),
}

impl StdError for ChError {}

/// The `FORMAT JSON` response envelope.
#[derive(Debug, Deserialize)]
struct JsonResponse<T> {
    data: Vec<T>,
}

impl ChClient {
    pub fn new(config: &ClickhouseConfig) -> EngineResult<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| EngineError::ConfigError(format!("invalid ClickHouse endpoint: {}", e)))?;

        let client = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(config.timeout)
            .build()
            .map_err(EngineError::clickhouse_error)?;

        Ok(Self {
            endpoint,
            client,
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    /// Executes a statement, discarding any output.
    pub async fn execute(&self, query: &str) -> EngineResult<()> {
        self.execute_with_timeout(query, None).await
    }

    /// Executes a statement with a per-query timeout override.
    ///
    /// Long-running administrative statements (FREEZE, SYSTEM UNFREEZE)
    /// exceed the ordinary query timeout by design.
    pub async fn execute_with_timeout(
        &self,
        query: &str,
        timeout: Option<Duration>,
    ) -> EngineResult<()> {
        self.post(query, timeout).await?;
        Ok(())
    }

    /// Runs a query and parses its `FORMAT JSON` output rows.
    pub async fn query_rows<T: DeserializeOwned>(&self, query: &str) -> EngineResult<Vec<T>> {
        let query = format!("{} FORMAT JSON", query);
        let body = self.post(&query, None).await?;

        let response: JsonResponse<T> = serde_json::from_str(&body)
            .map_err(|e| EngineError::clickhouse_error(ChError::Malformed(e)))?;

        Ok(response.data)
    }

    /// Runs a query returning a single scalar rendered as text.
    pub async fn query_scalar(&self, query: &str) -> EngineResult<String> {
        let body = self.post(query, None).await?;
        Ok(body.trim_end_matches('\n').to_string())
    }

    async fn post(&self, query: &str, timeout: Option<Duration>) -> EngineResult<String> {
        tracing::trace!("Executing query: {}", query);

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .body(query.to_string());

        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let res = request
            .send()
            .await
            .map_err(|e| EngineError::clickhouse_error(ChError::Transport(e)))?;

        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| EngineError::clickhouse_error(ChError::Transport(e)))?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(EngineError::clickhouse_error(ChError::Query(status, body)))
        }
    }
}
