// growerd: REST document store client
//
// Talks to the document database's REST surface:
//   GET    {base}/devices/{serial}                    → device document
//   PATCH  {base}/devices/{serial}                    → masked field update
//   GET    {base}/devices/{serial}/config/intervals   → intervals child
//   GET    {base}/devices/{serial}/commands           → pending commands
//   DELETE {base}/devices/{serial}/commands/{id}      → consume a command
//
// All failures map to StoreUnavailable; the watcher owns retry/backoff.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde_json::{json, Value};

use crate::error::{ControlError, ControlResult};
use crate::model::DocumentUpdate;

use super::DocumentStore;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RestDocumentStore {
    client: reqwest::Client,
    device_url: String,
}

impl RestDocumentStore {
    pub fn new(base_url: &str, serial: &str, token: Option<&str>) -> ControlResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| {
                ControlError::FatalInit("credentials token contains invalid characters".into())
            })?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| ControlError::FatalInit(format!("cannot build HTTP client: {e}")))?;

        Ok(Self {
            client,
            device_url: format!("{}/devices/{}", base_url.trim_end_matches('/'), serial),
        })
    }

    async fn get_json(&self, url: &str) -> ControlResult<Option<Value>> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ControlError::StoreUnavailable(format!("GET {url}: {e}")))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response
                    .json::<Value>()
                    .await
                    .map_err(|e| ControlError::StoreUnavailable(format!("GET {url}: {e}")))?;
                Ok(Some(body))
            }
            status => Err(ControlError::StoreUnavailable(format!(
                "GET {url}: HTTP {status}"
            ))),
        }
    }
}

#[async_trait]
impl DocumentStore for RestDocumentStore {
    async fn fetch_device(&self) -> ControlResult<Option<Value>> {
        self.get_json(&self.device_url).await
    }

    async fn update_device(&self, update: DocumentUpdate) -> ControlResult<()> {
        if update.is_empty() {
            return Ok(());
        }

        let fields: BTreeMap<String, Value> = update.into_fields().into_iter().collect();
        let url = &self.device_url;
        let response = self
            .client
            .patch(url)
            .json(&json!({ "fields": fields }))
            .send()
            .await
            .map_err(|e| ControlError::StoreUnavailable(format!("PATCH {url}: {e}")))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(ControlError::StoreUnavailable(format!(
                "PATCH {url}: HTTP {}",
                response.status()
            )))
        }
    }

    async fn fetch_intervals(&self) -> ControlResult<Option<Value>> {
        self.get_json(&format!("{}/config/intervals", self.device_url))
            .await
    }

    async fn list_commands(&self) -> ControlResult<Vec<(String, Value)>> {
        let url = format!("{}/commands", self.device_url);
        let Some(body) = self.get_json(&url).await? else {
            return Ok(Vec::new());
        };

        // The listing is an object keyed by command id; sorted for a
        // deterministic processing order.
        let mut commands: Vec<(String, Value)> = body
            .as_object()
            .map(|map| {
                map.iter()
                    .map(|(id, doc)| (id.clone(), doc.clone()))
                    .collect()
            })
            .unwrap_or_default();
        commands.sort_by(|(a, _), (b, _)| a.cmp(b));
        Ok(commands)
    }

    async fn delete_command(&self, id: &str) -> ControlResult<()> {
        let url = format!("{}/commands/{}", self.device_url, id);
        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| ControlError::StoreUnavailable(format!("DELETE {url}: {e}")))?;

        match response.status() {
            // Already gone is fine, another sweep may have consumed it.
            StatusCode::NOT_FOUND => Ok(()),
            status if status.is_success() => Ok(()),
            status => Err(ControlError::StoreUnavailable(format!(
                "DELETE {url}: HTTP {status}"
            ))),
        }
    }
}
