//! Epoch helpers shared by the codec and the fetch engine.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1970-01-01 and 2001-01-01 UTC. Timestamps embedded in the
/// encrypted payload count from the latter.
pub const EPOCH_DIFF: i64 = 978_307_200;

/// Current Unix time in seconds.
pub fn unix_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

/// Apple's fetch endpoint expects window bounds in milliseconds.
pub fn date_milliseconds(seconds: i64) -> i64 {
    seconds * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn milliseconds_scale() {
        assert_eq!(date_milliseconds(0), 0);
        assert_eq!(date_milliseconds(600), 600_000);
        assert_eq!(date_milliseconds(-1), -1000);
    }

    #[test]
    fn epoch_diff_round_trip() {
        // A 2001-epoch value plus the offset must land on the Unix equivalent.
        let apple_seconds: i64 = 700_000_000;
        assert_eq!(apple_seconds + EPOCH_DIFF, 1_678_307_200);
        assert_eq!((apple_seconds + EPOCH_DIFF) - EPOCH_DIFF, apple_seconds);
    }
}
