//! Generic HTTP-backed connector.
//!
//! Speaks a small JSON contract: `POST {base}/query`, `POST {base}/enrich`,
//! `GET {base}/health`. Auth material from the definition is attached per
//! scheme and never logged.

use std::time::Instant;

use async_trait::async_trait;
use sentra_types::{AuthType, ConnectorDefinition, ErrorKind, HealthReport};
use serde_json::{json, Value};
use tokio::sync::RwLock;

use crate::error::classify_status;
use crate::{CallOpts, Connector, ConnectorError};

#[derive(Debug, Clone)]
struct HttpSettings {
    base_url: String,
    auth_type: AuthType,
    credentials: Option<String>,
    data_types: Vec<String>,
}

pub struct HttpConnector {
    connector_type: String,
    client: reqwest::Client,
    settings: RwLock<Option<HttpSettings>>,
}

impl HttpConnector {
    pub fn new(connector_type: String) -> Self {
        Self {
            connector_type,
            client: reqwest::Client::new(),
            settings: RwLock::new(None),
        }
    }

    async fn settings(&self) -> Result<HttpSettings, ConnectorError> {
        self.settings
            .read()
            .await
            .clone()
            .ok_or_else(|| ConnectorError::new(ErrorKind::Validation, "connector not initialized"))
    }

    fn attach_auth(
        &self,
        rb: reqwest::RequestBuilder,
        settings: &HttpSettings,
    ) -> reqwest::RequestBuilder {
        match (settings.auth_type, settings.credentials.as_deref()) {
            (AuthType::ApiKey, Some(key)) => rb.header("x-api-key", key),
            (AuthType::Basic, Some(pair)) => match pair.split_once(':') {
                Some((user, pass)) => rb.basic_auth(user, Some(pass)),
                None => rb.basic_auth(pair, Option::<&str>::None),
            },
            (AuthType::Oauth, Some(token)) => rb.bearer_auth(token),
            _ => rb,
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: Value,
        opts: &CallOpts,
    ) -> Result<Value, ConnectorError> {
        let settings = self.settings().await?;
        let url = format!("{}/{}", settings.base_url.trim_end_matches('/'), path);
        let request = self
            .attach_auth(self.client.post(&url), &settings)
            .timeout(opts.deadline)
            .json(&body);

        let response = tokio::select! {
            _ = opts.cancel.cancelled() => return Err(ConnectorError::timeout("call cancelled")),
            sent = request.send() => sent.map_err(classify_reqwest)?,
        };

        let status = response.status().as_u16();
        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1_000);
        if let Some(err) = classify_status(status, retry_after_ms) {
            return Err(err);
        }
        response.json::<Value>().await.map_err(classify_reqwest)
    }
}

fn classify_reqwest(err: reqwest::Error) -> ConnectorError {
    if err.is_timeout() {
        ConnectorError::timeout(err.to_string())
    } else if err.is_decode() {
        ConnectorError::new(ErrorKind::Validation, format!("undecodable response: {err}"))
    } else {
        ConnectorError::new(ErrorKind::NetworkTransient, err.to_string())
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn connector_type(&self) -> &str {
        &self.connector_type
    }

    async fn initialize(&self, definition: &ConnectorDefinition) -> Result<(), ConnectorError> {
        let base_url = definition
            .settings
            .get("baseUrl")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                ConnectorError::new(ErrorKind::Validation, "http connector requires baseUrl")
            })?
            .to_string();
        let data_types = definition
            .settings
            .get("dataTypes")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        *self.settings.write().await = Some(HttpSettings {
            base_url,
            auth_type: definition.auth.auth_type,
            credentials: definition.auth.credentials.clone(),
            data_types,
        });
        Ok(())
    }

    async fn health_check(&self) -> Result<HealthReport, ConnectorError> {
        let settings = self.settings().await?;
        let url = format!("{}/health", settings.base_url.trim_end_matches('/'));
        let started = Instant::now();
        let response = self
            .attach_auth(self.client.get(&url), &settings)
            .send()
            .await
            .map_err(classify_reqwest)?;
        let latency_ms = started.elapsed().as_millis() as u64;
        Ok(HealthReport {
            healthy: response.status().is_success(),
            latency_ms,
            detail: None,
        })
    }

    async fn query(&self, payload: &Value, opts: &CallOpts) -> Result<Value, ConnectorError> {
        self.post_json("query", payload.clone(), opts).await
    }

    async fn enrich(
        &self,
        value: &str,
        kind: &str,
        opts: &CallOpts,
    ) -> Result<Value, ConnectorError> {
        self.post_json("enrich", json!({"value": value, "kind": kind}), opts)
            .await
    }

    fn capabilities(&self) -> Vec<String> {
        vec!["query".to_string(), "enrich".to_string()]
    }

    fn data_types(&self) -> Vec<String> {
        // Initialized settings win; before that, advertise nothing.
        match self.settings.try_read() {
            Ok(guard) => guard
                .as_ref()
                .map(|s| s.data_types.clone())
                .unwrap_or_default(),
            Err(_) => Vec::new(),
        }
    }
}
