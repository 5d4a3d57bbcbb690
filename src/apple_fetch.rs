//! Batch-planned fetch from the crowdsourced location endpoint.
//!
//! A fetch call turns `(ids, lookback)` into a plan of POST payloads:
//! - windows under 20 minutes go out as a single time slice; anything longer
//!   is cut into day-wide slices (service latency and response size grow
//!   superlinearly with window width),
//! - identifiers ride in groups of at most ten, input order preserved,
//! - the plan is the id-group-major product of groups and slices.
//!
//! Dispatch walks the plan FIFO with per-payload retry. A retried entry is
//! pushed back to the *front* so it completes before untried work, keeping
//! the spread between first and last result bounded. 401 responses refresh
//! the shared credentials under a global budget; once the budget is spent the
//! dispatch aborts and whatever succeeded so far is merged and returned.

use std::collections::VecDeque;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::credentials::{CredentialBlob, CredentialsSource};
use crate::date::{date_milliseconds, unix_epoch};
use crate::error::CollectorError;

pub const ACSNSERVICE_URL: &str = "https://gateway.icloud.com/acsnservice/fetch";

/// A payload is sent at most this many times beyond its first attempt.
pub const MAX_ATTEMPTS_PER_PAYLOAD: u32 = 2;
/// Global cap on credential refreshes triggered by 401 responses.
pub const MAX_CREDENTIAL_REFRESHES: u32 = 10;
/// Grace period before fetching fresh credentials after a 401.
pub const REFRESH_WAIT: Duration = Duration::from_secs(1);

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);
const SHORT_RANGE_SECONDS: i64 = 20 * 60;
const ONE_DAY_SECONDS: i64 = 86_400;
const ID_BATCH_SIZE: usize = 10;

/// One sighting record as returned by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawLocation {
    pub id: String,
    /// Base64-encoded encrypted payload.
    pub payload: String,
    pub description: String,
    #[serde(rename = "datePublished")]
    pub date_published: i64,
    #[serde(rename = "statusCode")]
    pub status_code: i64,
}

/// Decoded response body; also the merged shape handed to the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppleResponse {
    #[serde(default)]
    pub results: Vec<RawLocation>,
    #[serde(rename = "statusCode")]
    pub status_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AppleResponse {
    pub fn empty() -> Self {
        Self {
            results: Vec::new(),
            status_code: "200".to_string(),
            error: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == "200"
    }
}

/// One time slice of a search request. Bounds are Unix milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchSlice {
    #[serde(rename = "startDate")]
    pub start_date: i64,
    #[serde(rename = "endDate")]
    pub end_date: i64,
    pub ids: Vec<String>,
}

/// The POST body for one plan entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchRequest {
    pub search: Vec<SearchSlice>,
}

struct PlanEntry {
    body: SearchRequest,
    attempts: u32,
}

/// Raw HTTP outcome of one plan entry; the dispatch loop decides what it means.
#[derive(Debug, Clone)]
pub struct AcsnResponse {
    pub status: u16,
    pub body: String,
}

/// Transport seam for the dispatch loop; scripted in tests.
#[allow(async_fn_in_trait)]
pub trait AcsnTransport {
    async fn fetch(
        &self,
        credentials: &CredentialBlob,
        request: &SearchRequest,
    ) -> Result<AcsnResponse, CollectorError>;
}

/// Production transport: one pooled client, blob headers replayed verbatim.
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, CollectorError> {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

impl AcsnTransport for ReqwestTransport {
    async fn fetch(
        &self,
        credentials: &CredentialBlob,
        request: &SearchRequest,
    ) -> Result<AcsnResponse, CollectorError> {
        let mut builder = self.http.post(ACSNSERVICE_URL);
        for (name, value) in credentials.headers() {
            builder = builder.header(name, value);
        }
        let response = builder
            .json(request)
            .send()
            .await
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::Transport(e.to_string()))?;
        Ok(AcsnResponse { status, body })
    }
}

fn status_code_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn daily_time_chunks(start_date: i64, end_date: i64) -> Vec<(i64, i64)> {
    let mut chunks = Vec::new();
    let mut current_start = start_date;
    while current_start < end_date {
        let current_end = (current_start + ONE_DAY_SECONDS).min(end_date);
        chunks.push((current_start, current_end));
        current_start = current_end;
    }
    chunks
}

/// Enumerate the batch plan for `ids` over `[start_date, end_date)`,
/// id-group-major.
pub fn build_plan(ids: &[String], start_date: i64, end_date: i64) -> Vec<SearchRequest> {
    let windows = if end_date - start_date < SHORT_RANGE_SECONDS {
        vec![(start_date, end_date)]
    } else {
        daily_time_chunks(start_date, end_date)
    };
    let mut plan = Vec::with_capacity(ids.len().div_ceil(ID_BATCH_SIZE) * windows.len());
    for group in ids.chunks(ID_BATCH_SIZE) {
        for &(window_start, window_end) in &windows {
            plan.push(SearchRequest {
                search: vec![SearchSlice {
                    start_date: date_milliseconds(window_start),
                    end_date: date_milliseconds(window_end),
                    ids: group.to_vec(),
                }],
            });
        }
    }
    plan
}

/// Concatenate successful responses in dispatch order under a synthetic
/// success status. `error` carries the first failure seen, if any work was
/// lost along the way.
pub fn merge_responses(responses: Vec<AppleResponse>, error: Option<String>) -> AppleResponse {
    let mut results = Vec::new();
    for response in responses {
        results.extend(response.results);
    }
    AppleResponse {
        results,
        status_code: "200".to_string(),
        error,
    }
}

fn requeue_or_drop(
    queue: &mut VecDeque<PlanEntry>,
    mut entry: PlanEntry,
    reason: &str,
    first_error: &mut Option<String>,
) {
    entry.attempts += 1;
    if entry.attempts <= MAX_ATTEMPTS_PER_PAYLOAD {
        debug!(attempts = entry.attempts, reason, "requeueing batch entry at queue front");
        queue.push_front(entry);
    } else {
        warn!(attempts = entry.attempts, reason, "dropping batch entry after exhausting retries");
        counter!("apple.fetch.dropped").increment(1);
        first_error.get_or_insert_with(|| reason.to_string());
    }
}

/// Fetch sightings for `ids` over the trailing `lookback_seconds`, merging
/// every successful batch. Credential-store failures abort; everything else
/// degrades to partial results.
pub async fn fetch_locations<T, C>(
    transport: &T,
    credentials_source: &C,
    ids: &[String],
    lookback_seconds: i64,
) -> Result<AppleResponse, CollectorError>
where
    T: AcsnTransport,
    C: CredentialsSource,
{
    let end_date = unix_epoch();
    let start_date = end_date - lookback_seconds;
    let plan = build_plan(ids, start_date, end_date);
    if plan.is_empty() {
        info!("empty batch plan, nothing to fetch");
        return Ok(AppleResponse::empty());
    }
    info!(
        entries = plan.len(),
        ids = ids.len(),
        lookback_seconds,
        "dispatching batch plan"
    );

    let mut queue: VecDeque<PlanEntry> = plan
        .into_iter()
        .map(|body| PlanEntry { body, attempts: 0 })
        .collect();
    let mut successes: Vec<AppleResponse> = Vec::new();
    let mut first_error: Option<String> = None;
    let mut refreshes: u32 = 0;
    let mut credentials = credentials_source.get_credentials().await?;

    while let Some(entry) = queue.pop_front() {
        match transport.fetch(&credentials, &entry.body).await {
            Ok(response) if status_code_success(response.status) => {
                match serde_json::from_str::<AppleResponse>(&response.body) {
                    Ok(parsed) => {
                        debug!(results = parsed.results.len(), "batch entry succeeded");
                        counter!("apple.fetch.ok").increment(1);
                        successes.push(parsed);
                    }
                    Err(e) => {
                        warn!(error = %e, "discarding unparseable response body");
                        first_error.get_or_insert_with(|| format!("invalid response body: {e}"));
                    }
                }
            }
            Ok(response) if response.status == 401 => {
                counter!("apple.fetch.auth.expired").increment(1);
                tokio::time::sleep(REFRESH_WAIT).await;
                if refreshes == MAX_CREDENTIAL_REFRESHES {
                    warn!(refreshes, "credential refresh budget exhausted, aborting dispatch");
                    first_error
                        .get_or_insert_with(|| "credential refresh budget exhausted".to_string());
                    break;
                }
                refreshes += 1;
                credentials = credentials_source.get_credentials().await?;
                info!(refreshes, "refreshed credentials after 401");
                requeue_or_drop(&mut queue, entry, "401 unauthorized", &mut first_error);
            }
            Ok(response) => {
                warn!(status = response.status, "batch entry failed");
                requeue_or_drop(
                    &mut queue,
                    entry,
                    &format!("status {}", response.status),
                    &mut first_error,
                );
            }
            Err(e) => {
                warn!(error = %e, "transport error, refreshing credentials");
                credentials = credentials_source.get_credentials().await?;
                requeue_or_drop(&mut queue, entry, &e.to_string(), &mut first_error);
            }
        }
    }

    let merged = merge_responses(successes, first_error);
    info!(results = merged.results.len(), "merged batch responses");
    Ok(merged)
}
