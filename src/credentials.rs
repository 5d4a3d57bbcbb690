//! Credential blob model and the shared credential store client.
//!
//! The blob is the complete header set a fetch request must carry; it is
//! minted on a host with the right keychain context and published to a
//! key-addressed store where fleet workers pick it up. Serialization keeps
//! the exact wire header names, and the same nine pairs are replayed verbatim
//! onto outgoing requests.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::CollectorError;

const STORE_TIMEOUT: Duration = Duration::from_secs(60);

/// The nine headers authorizing a crowdsourced-network fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBlob {
    #[serde(rename = "User-Agent")]
    pub user_agent: String,
    #[serde(rename = "Accept")]
    pub accept: String,
    #[serde(rename = "Authorization")]
    pub authorization: String,
    #[serde(rename = "X-Apple-I-MD")]
    pub one_time_password: String,
    #[serde(rename = "X-Apple-I-MD-RINFO")]
    pub routing_info: String,
    #[serde(rename = "X-Apple-I-MD-M")]
    pub machine_id: String,
    #[serde(rename = "X-Apple-I-TimeZone")]
    pub timezone: String,
    #[serde(rename = "X-Apple-I-Client-Time")]
    pub client_time: String,
    #[serde(rename = "X-BA-CLIENT-TIMESTAMP")]
    pub client_timestamp: String,
}

impl CredentialBlob {
    /// The blob as (header name, value) pairs, in wire order.
    pub fn headers(&self) -> [(&'static str, &str); 9] {
        [
            ("User-Agent", &self.user_agent),
            ("Accept", &self.accept),
            ("Authorization", &self.authorization),
            ("X-Apple-I-MD", &self.one_time_password),
            ("X-Apple-I-MD-RINFO", &self.routing_info),
            ("X-Apple-I-MD-M", &self.machine_id),
            ("X-Apple-I-TimeZone", &self.timezone),
            ("X-Apple-I-Client-Time", &self.client_time),
            ("X-BA-CLIENT-TIMESTAMP", &self.client_timestamp),
        ]
    }
}

/// Where the fetch engine obtains (and re-obtains) credentials. Production
/// uses [`CredentialsClient`]; tests script their own source.
#[allow(async_fn_in_trait)]
pub trait CredentialsSource {
    async fn get_credentials(&self) -> Result<CredentialBlob, CollectorError>;
}

/// HTTP client for the key-addressed credential store.
pub struct CredentialsClient {
    http: Client,
    base_url: String,
    client_id: String,
    api_key: String,
}

impl CredentialsClient {
    pub fn new(
        base_url: impl Into<String>,
        client_id: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Result<Self, CollectorError> {
        let http = Client::builder()
            .timeout(STORE_TIMEOUT)
            .build()
            .map_err(|e| CollectorError::CredentialsUnavailable(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            client_id: client_id.into(),
            api_key: api_key.into(),
        })
    }

    fn url(&self) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), self.client_id)
    }

    /// Publish a freshly minted blob; `schedule_data_fetching` asks the store
    /// side to kick off a fetch round once the new credentials land.
    pub async fn put_credentials(
        &self,
        blob: &CredentialBlob,
        schedule_data_fetching: bool,
    ) -> Result<(), CollectorError> {
        let response = self
            .http
            .put(self.url())
            .header("x-api-key", &self.api_key)
            .json(&serde_json::json!({
                "headers": blob,
                "schedule_data_fetching": schedule_data_fetching,
            }))
            .send()
            .await
            .map_err(|e| CollectorError::CredentialsUnavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::CredentialsUnavailable(format!(
                "failed to update credentials: {status} - {body}"
            )));
        }
        info!(client = %self.client_id, "credentials updated");
        Ok(())
    }
}

impl CredentialsSource for CredentialsClient {
    async fn get_credentials(&self) -> Result<CredentialBlob, CollectorError> {
        let response = self
            .http
            .get(self.url())
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| CollectorError::CredentialsUnavailable(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollectorError::CredentialsUnavailable(format!(
                "failed to retrieve credentials: {status} - {body}"
            )));
        }
        response
            .json::<CredentialBlob>()
            .await
            .map_err(|e| CollectorError::CredentialsUnavailable(format!("malformed blob: {e}")))
    }
}

#[cfg(test)]
pub(crate) fn test_blob(tag: &str) -> CredentialBlob {
    CredentialBlob {
        user_agent: format!("searchpartyd/1.0 {tag}"),
        accept: "application/json".into(),
        authorization: "Basic dXNlcjp0b2tlbg==".into(),
        one_time_password: "otp".into(),
        routing_info: "17106176".into(),
        machine_id: "machine".into(),
        timezone: "CEST".into(),
        client_time: "2024-05-01T12:00:00Z".into(),
        client_timestamp: "1714564800".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_serializes_under_wire_names() {
        let blob = test_blob("t1");
        let value = serde_json::to_value(&blob).unwrap();
        let object = value.as_object().unwrap();
        let expected = [
            "User-Agent",
            "Accept",
            "Authorization",
            "X-Apple-I-MD",
            "X-Apple-I-MD-RINFO",
            "X-Apple-I-MD-M",
            "X-Apple-I-TimeZone",
            "X-Apple-I-Client-Time",
            "X-BA-CLIENT-TIMESTAMP",
        ];
        assert_eq!(object.len(), expected.len());
        for name in expected {
            assert!(object.contains_key(name), "missing {name}");
        }

        let round_tripped: CredentialBlob = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped, blob);
    }

    #[test]
    fn header_pairs_match_serialized_names() {
        let blob = test_blob("t2");
        let value = serde_json::to_value(&blob).unwrap();
        for (name, header_value) in blob.headers() {
            assert_eq!(value[name], header_value, "mismatch for {name}");
        }
    }
}
