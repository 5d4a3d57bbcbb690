use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use haystack_collector::findmy_codec::{decode_report, payload_timestamp};

// Small CLI to help debug sighting decode issues on a server.
// Usage:
//   cargo run --bin decode_payload -- <base64_private_key> <base64_payload>
// The private key is the tracker's 28-byte scalar; the payload is the
// base64 blob exactly as returned by the fetch endpoint.
fn main() {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.len() != 2 {
        eprintln!("Usage: decode_payload <base64_private_key> <base64_payload>\n");
        std::process::exit(2);
    }

    let private_key = match STANDARD.decode(&args[0]) {
        Ok(key) => key,
        Err(e) => {
            println!("decode: ERR  bad private key base64: {e}");
            std::process::exit(1);
        }
    };
    let payload = match STANDARD.decode(&args[1]) {
        Ok(payload) => payload,
        Err(e) => {
            println!("decode: ERR  bad payload base64: {e}");
            std::process::exit(1);
        }
    };

    match decode_report(&private_key, &payload) {
        Ok(report) => {
            println!(
                "decode: OK  lat={} lon={} conf={} status={}",
                report.lat, report.lon, report.conf, report.status
            );
            if let Ok(timestamp) = payload_timestamp(&payload) {
                println!("sighted at (unix seconds): {timestamp}");
            }
        }
        Err(e) => {
            // Print a clear error reason to match pipeline logs
            println!("decode: ERR  {e}");
            std::process::exit(1);
        }
    }
}
