//! Location-harvesting pipeline for Find My-compatible beacon trackers.
//!
//! Anonymous finder devices report sightings of fleet beacons to Apple's
//! crowdsourced network, encrypted to keys derived from each beacon's public
//! key. Given the private keys, this crate plans and dispatches the fetch
//! requests, decrypts and decodes the returned payloads, and forwards the
//! enriched reports to the fleet backend.

pub mod apple_fetch;
pub mod credentials;
pub mod crypto;
pub mod date;
pub mod device_api;
pub mod error;
pub mod findmy_codec;
pub mod report;
pub mod settings;

pub use error::CollectorError;
