//! Report pipeline: join fetched sightings to catalog trackers, decrypt,
//! enrich, summarize and forward.
//!
//! Sightings whose identifier matches no known tracker are external to the
//! fleet and dropped with a warning; per-record decode failures likewise
//! never abort the run. Forwarding happens in chunks of 100 with a short
//! pacing delay, and a failed chunk is skipped, not fatal.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use base64::Engine;
use metrics::counter;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::apple_fetch::{self, AcsnTransport, RawLocation};
use crate::credentials::CredentialsSource;
use crate::device_api::{BeamApiClient, Tracker};
use crate::error::CollectorError;
use crate::findmy_codec::{decode_report, payload_timestamp, Report};

const REPORT_CHUNK_SIZE: usize = 100;
const CHUNK_PACING: Duration = Duration::from_millis(500);

/// A decoded fix plus the sighting context it arrived with.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichedReport {
    #[serde(flatten)]
    pub fix: Report,
    pub device_id: String,
    /// Sighting time in Unix seconds (converted from the payload's 2001 epoch).
    pub timestamp: i64,
    pub date_published: i64,
    pub description: String,
}

/// Reduced wire form accepted by the ingestion endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HaystackReport {
    pub timestamp: i64,
    pub lat: f64,
    pub lon: f64,
    pub conf: u8,
}

#[derive(Debug, Clone, Serialize)]
pub struct HaystackSignal {
    pub id: String,
    pub name: String,
    pub report: HaystackReport,
}

impl HaystackSignal {
    pub fn from_tracker(tracker: &Tracker) -> Option<Self> {
        tracker.report.as_ref().map(|report| Self {
            id: tracker.id.clone(),
            name: tracker.name.clone(),
            report: HaystackReport {
                timestamp: report.timestamp,
                lat: report.fix.lat,
                lon: report.fix.lon,
                conf: report.fix.conf,
            },
        })
    }
}

/// Per-run aggregate logged once the join is done.
#[derive(Debug, PartialEq)]
pub struct ReportSummary {
    pub reports: usize,
    pub oldest: Option<i64>,
    pub newest: Option<i64>,
    pub with_reports: Vec<String>,
    pub without_reports: Vec<String>,
}

/// Options for one pipeline invocation.
pub struct FetchOptions {
    pub page: u32,
    pub limit: u32,
    pub minutes_ago: u32,
    pub trackers_filter: Option<HashSet<String>>,
    pub send_reports: bool,
}

/// Decrypt each sighting against its tracker and attach the enriched report.
/// Returns the identifier-keyed tracker map; a later sighting for the same
/// tracker replaces the earlier one.
pub fn create_reports(
    locations: &[RawLocation],
    devices: Vec<Tracker>,
) -> HashMap<String, Tracker> {
    let mut mapping: HashMap<String, Tracker> = devices
        .into_iter()
        .filter_map(|device| match device.public_hash_base64() {
            Ok(hash) => Some((hash, device)),
            Err(e) => {
                warn!(device = %device.name, error = %e, "skipping device with unusable key");
                None
            }
        })
        .collect();

    for location in locations {
        let data = match base64::engine::general_purpose::STANDARD.decode(&location.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!(id = %location.id, error = %e, "discarding sighting with invalid base64 payload");
                counter!("report.decode.err").increment(1);
                continue;
            }
        };
        let Some(device) = mapping.get_mut(&location.id) else {
            warn!(id = %location.id, "device not found for location");
            continue;
        };
        let timestamp = match payload_timestamp(&data) {
            Ok(timestamp) => timestamp,
            Err(e) => {
                warn!(device = %device.name, error = %e, "discarding truncated sighting");
                counter!("report.decode.err").increment(1);
                continue;
            }
        };
        match decode_report(device.private_key_bytes(), &data) {
            Ok(fix) => {
                device.report = Some(EnrichedReport {
                    fix,
                    device_id: device.id.clone(),
                    timestamp,
                    date_published: location.date_published,
                    description: location.description.clone(),
                });
            }
            Err(e) => {
                // TODO: persist undecodable payloads somewhere queryable; the
                // fleet sees a trickle of these from mismatched key rotations.
                warn!(
                    device = %device.name,
                    payload = %location.payload,
                    error = %e,
                    "failed to decode sighting"
                );
                counter!("report.decode.err").increment(1);
            }
        }
    }
    mapping
}

/// Aggregate counts and name lists for the run log.
pub fn summarize(mapping: &HashMap<String, Tracker>) -> ReportSummary {
    let mut summary = ReportSummary {
        reports: 0,
        oldest: None,
        newest: None,
        with_reports: Vec::new(),
        without_reports: Vec::new(),
    };
    for device in mapping.values() {
        match &device.report {
            Some(report) => {
                summary.reports += 1;
                summary.oldest = Some(summary.oldest.map_or(report.timestamp, |t| t.min(report.timestamp)));
                summary.newest = Some(summary.newest.map_or(report.timestamp, |t| t.max(report.timestamp)));
                summary.with_reports.push(device.name.clone());
            }
            None => summary.without_reports.push(device.name.clone()),
        }
    }
    summary.with_reports.sort();
    summary.without_reports.sort();
    summary
}

/// Run one pipeline pass: catalog page -> filter -> fetch -> decrypt ->
/// summarize -> (optionally) forward. Returns the trackers of the page with
/// any decoded reports attached; an empty vec means the page was empty.
pub async fn fetch_and_report_locations<T, C>(
    api: &BeamApiClient,
    transport: &T,
    credentials_source: &C,
    options: &FetchOptions,
) -> Result<Vec<Tracker>, CollectorError>
where
    T: AcsnTransport,
    C: CredentialsSource,
{
    let Some(device_response) = api.fetch_devices(options.limit, options.page).await? else {
        return Ok(Vec::new());
    };

    let devices: Vec<Tracker> = match &options.trackers_filter {
        Some(filter) if !filter.is_empty() => device_response
            .data
            .into_iter()
            .filter(|device| filter.contains(&device.name))
            .collect(),
        _ => device_response.data,
    };

    let ids: Vec<String> = devices
        .iter()
        .filter_map(|device| device.public_hash_base64().ok())
        .collect();

    let apple_response = apple_fetch::fetch_locations(
        transport,
        credentials_source,
        &ids,
        options.minutes_ago as i64 * 60,
    )
    .await?;
    if let Some(e) = &apple_response.error {
        error!(error = %e, "fetch completed with partial results");
    }
    info!(results = apple_response.results.len(), "fetched location metadata");

    let mapping = create_reports(&apple_response.results, devices);
    let summary = summarize(&mapping);
    info!(
        reports = summary.reports,
        oldest = summary.oldest,
        newest = summary.newest,
        with_reports = ?summary.with_reports,
        without_reports = ?summary.without_reports,
        "enriched devices with reports"
    );

    let mut trackers: Vec<Tracker> = mapping.into_values().collect();
    trackers.sort_by(|a, b| a.name.cmp(&b.name));

    if options.send_reports {
        forward_reports(api, &trackers).await;
    }
    Ok(trackers)
}

/// Forward decoded reports in paced chunks; failed chunks are logged and
/// skipped so one bad POST cannot sink the rest of the run.
async fn forward_reports(api: &BeamApiClient, trackers: &[Tracker]) {
    let signals: Vec<HaystackSignal> = trackers
        .iter()
        .filter_map(HaystackSignal::from_tracker)
        .collect();
    for chunk in signals.chunks(REPORT_CHUNK_SIZE) {
        info!(count = chunk.len(), "sending reports to haystacks api");
        if let Err(e) = api.send_reports(chunk).await {
            error!(error = %e, "failed to send reports");
            counter!("report.chunk.err").increment(1);
        } else {
            counter!("report.chunk.ok").increment(1);
        }
        tokio::time::sleep(CHUNK_PACING).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SCALAR_LEN;
    use crate::date::EPOCH_DIFF;
    use crate::device_api::test_tracker;
    use crate::findmy_codec::{encrypt_test_payload, hashed_public_key_b64};
    use base64::engine::general_purpose::STANDARD;

    const PRIVATE_KEY: [u8; SCALAR_LEN] = [0x11u8; SCALAR_LEN];
    const FIX: [u8; 10] = [0x0A, 0x3D, 0x00, 0x00, 0x14, 0xE3, 0x00, 0x00, 0x50, 0x01];

    fn location_for(id: &str, payload: &[u8]) -> RawLocation {
        RawLocation {
            id: id.to_string(),
            payload: STANDARD.encode(payload),
            description: "found".to_string(),
            date_published: 1_700_000_000_000,
            status_code: 0,
        }
    }

    #[test]
    fn joins_and_enriches_matching_sighting() {
        let tracker = test_tracker("device-1", "E955EC5E659E", &PRIVATE_KEY);
        let hash = hashed_public_key_b64(&PRIVATE_KEY).unwrap();
        let payload = encrypt_test_payload(&PRIVATE_KEY, &FIX, 700_000_000, 0);
        let locations = vec![location_for(&hash, &payload)];

        let mapping = create_reports(&locations, vec![tracker]);
        let report = mapping[&hash].report.as_ref().expect("report attached");
        assert_eq!(report.device_id, "device-1");
        assert_eq!(report.timestamp, 700_000_000 + EPOCH_DIFF);
        assert_eq!(report.date_published, 1_700_000_000_000);
        assert_eq!(report.description, "found");
        assert_eq!(report.fix.conf, 0x50);
    }

    #[test]
    fn later_sighting_replaces_earlier_one() {
        let tracker = test_tracker("device-1", "E955EC5E659E", &PRIVATE_KEY);
        let hash = hashed_public_key_b64(&PRIVATE_KEY).unwrap();
        let locations = vec![
            location_for(&hash, &encrypt_test_payload(&PRIVATE_KEY, &FIX, 700_000_000, 0)),
            location_for(&hash, &encrypt_test_payload(&PRIVATE_KEY, &FIX, 700_000_600, 0)),
        ];
        let mapping = create_reports(&locations, vec![tracker]);
        let report = mapping[&hash].report.as_ref().unwrap();
        assert_eq!(report.timestamp, 700_000_600 + EPOCH_DIFF);
    }

    #[test]
    fn unknown_identifier_is_dropped() {
        let tracker = test_tracker("device-1", "E955EC5E659E", &PRIVATE_KEY);
        let hash = hashed_public_key_b64(&PRIVATE_KEY).unwrap();
        let payload = encrypt_test_payload(&PRIVATE_KEY, &FIX, 700_000_000, 0);
        let locations = vec![location_for("someone-elses-tag", &payload)];

        let mapping = create_reports(&locations, vec![tracker]);
        assert!(mapping[&hash].report.is_none());
    }

    #[test]
    fn undecodable_sighting_is_skipped() {
        let tracker = test_tracker("device-1", "E955EC5E659E", &PRIVATE_KEY);
        let hash = hashed_public_key_b64(&PRIVATE_KEY).unwrap();
        let mut payload = encrypt_test_payload(&PRIVATE_KEY, &FIX, 700_000_000, 0);
        let last = payload.len() - 1;
        payload[last] ^= 0x01;
        let locations = vec![location_for(&hash, &payload)];

        let mapping = create_reports(&locations, vec![tracker]);
        assert!(mapping[&hash].report.is_none());
    }

    #[test]
    fn summary_collects_counts_and_bounds() {
        let with_key = PRIVATE_KEY;
        let without_key = [0x13u8; SCALAR_LEN];
        let with = test_tracker("device-1", "BBB", &with_key);
        let without = test_tracker("device-2", "AAA", &without_key);
        let hash = hashed_public_key_b64(&with_key).unwrap();
        let locations = vec![location_for(
            &hash,
            &encrypt_test_payload(&with_key, &FIX, 700_000_000, 0),
        )];

        let mapping = create_reports(&locations, vec![with, without]);
        let summary = summarize(&mapping);
        assert_eq!(summary.reports, 1);
        assert_eq!(summary.oldest, summary.newest);
        assert_eq!(summary.oldest, Some(700_000_000 + EPOCH_DIFF));
        assert_eq!(summary.with_reports, vec!["BBB"]);
        assert_eq!(summary.without_reports, vec!["AAA"]);
    }

    #[test]
    fn signal_takes_reduced_shape() {
        let mut tracker = test_tracker("device-1", "E955EC5E659E", &PRIVATE_KEY);
        assert!(HaystackSignal::from_tracker(&tracker).is_none());

        tracker.report = Some(EnrichedReport {
            fix: Report { lat: 17.0, lon: 35.0, conf: 80, status: 1 },
            device_id: "device-1".to_string(),
            timestamp: 1_700_000_000,
            date_published: 1_700_000_000_000,
            description: "found".to_string(),
        });
        let signal = HaystackSignal::from_tracker(&tracker).unwrap();
        let value = serde_json::to_value(&signal).unwrap();
        assert_eq!(value["id"], "device-1");
        assert_eq!(value["name"], "E955EC5E659E");
        assert_eq!(value["report"]["timestamp"], 1_700_000_000);
        assert_eq!(value["report"]["conf"], 80);
        // The reduced form carries no status or description.
        assert!(value["report"].get("status").is_none());
        assert!(value["report"].get("description").is_none());
    }
}
