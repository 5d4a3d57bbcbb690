//! Clients for the fleet backend: device catalog (GET) and report ingestion
//! (POST), both authenticated with the `x-api-key` header.

use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use crate::crypto::CryptoError;
use crate::error::CollectorError;
use crate::findmy_codec::hashed_public_key_b64;
use crate::report::{EnrichedReport, HaystackSignal};
use crate::settings::Settings;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Node-style buffer encoding of the 28-byte private scalar.
#[derive(Debug, Clone, Deserialize)]
pub struct PrivateKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Vec<u8>,
}

/// A fleet tracker as served by the device catalog. The decoded report, if
/// any, is attached by the pipeline after the fetch round.
#[derive(Debug, Clone, Deserialize)]
pub struct Tracker {
    pub id: String,
    pub name: String,
    #[serde(rename = "privateKey")]
    pub private_key: PrivateKey,
    #[serde(skip)]
    pub report: Option<EnrichedReport>,
}

impl Tracker {
    pub fn private_key_bytes(&self) -> &[u8] {
        &self.private_key.data
    }

    /// The identifier this tracker is looked up under at the fetch endpoint.
    pub fn public_hash_base64(&self) -> Result<String, CryptoError> {
        hashed_public_key_b64(&self.private_key.data)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaginationMeta {
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    #[serde(rename = "pageCount")]
    pub page_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceResponse {
    pub data: Vec<Tracker>,
    pub meta: PaginationMeta,
}

/// Pooled client for the haystacks endpoints.
pub struct BeamApiClient {
    http: Client,
    endpoint: String,
    api_key: String,
}

impl BeamApiClient {
    pub fn new(settings: &Settings) -> Result<Self, CollectorError> {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: settings.haystacks_url(),
            api_key: settings.api_key.clone(),
        })
    }

    /// One catalog page. `Ok(None)` means the page is empty and the caller
    /// has walked off the end of the catalog.
    pub async fn fetch_devices(
        &self,
        limit: u32,
        page: u32,
    ) -> Result<Option<DeviceResponse>, CollectorError> {
        let response = self
            .http
            .get(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .query(&[("limit", limit), ("offset", page)])
            .send()
            .await
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::UnexpectedStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        let devices = response
            .json::<DeviceResponse>()
            .await
            .map_err(|e| CollectorError::Validation(format!("device response: {e}")))?;
        if devices.data.is_empty() {
            info!(page, "no devices found");
            return Ok(None);
        }
        info!(
            page = devices.meta.page,
            limit = devices.meta.limit,
            total = devices.meta.total,
            "fetched device metadata"
        );
        Ok(Some(devices))
    }

    /// Forward one chunk of reduced reports to the ingestion endpoint.
    pub async fn send_reports(&self, signals: &[HaystackSignal]) -> Result<(), CollectorError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-api-key", &self.api_key)
            .json(signals)
            .send()
            .await
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CollectorError::UnexpectedStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn test_tracker(id: &str, name: &str, private_key: &[u8]) -> Tracker {
    Tracker {
        id: id.to_string(),
        name: name.to_string(),
        private_key: PrivateKey {
            kind: "Buffer".to_string(),
            data: private_key.to_vec(),
        },
        report: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_deserializes_catalog_shape() {
        let raw = serde_json::json!({
            "id": "9ed47345-fe98-460b-b390-2d9026c89aaa",
            "name": "E955EC5E659E",
            "privateKey": {
                "type": "Buffer",
                "data": [
                    226, 167, 150, 255, 228, 36, 61, 116,
                    74, 179, 188, 216, 66, 184, 166, 15,
                    5, 119, 42, 188, 67, 149, 246, 123,
                    85, 183, 1, 52
                ]
            }
        });
        let tracker: Tracker = serde_json::from_value(raw).unwrap();
        assert_eq!(tracker.name, "E955EC5E659E");
        assert_eq!(tracker.private_key_bytes().len(), 28);
        assert!(tracker.report.is_none());
        assert!(tracker.public_hash_base64().is_ok());
    }

    #[test]
    fn device_response_deserializes_meta() {
        let raw = serde_json::json!({
            "data": [],
            "meta": { "total": 120, "page": 3, "limit": 40, "pageCount": 3 }
        });
        let response: DeviceResponse = serde_json::from_value(raw).unwrap();
        assert_eq!(response.meta.page_count, 3);
        assert!(response.data.is_empty());
    }
}
