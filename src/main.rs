// CLI for the fleet location collector.
//
// `fetch-locations` runs one pipeline pass over a catalog page;
// `refresh-credentials` uploads a minted credential blob to the shared store
// (the minting itself happens on a host with the right keychain context);
// `generate-keys` produces new tracker key pairs.

use std::collections::HashSet;
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use haystack_collector::apple_fetch::ReqwestTransport;
use haystack_collector::credentials::{CredentialBlob, CredentialsClient};
use haystack_collector::crypto;
use haystack_collector::device_api::BeamApiClient;
use haystack_collector::report::{fetch_and_report_locations, FetchOptions};
use haystack_collector::settings::Settings;

#[derive(Parser)]
#[command(name = "haystack-collector")]
#[command(about = "Fetch crowdsourced sightings for fleet trackers and forward decoded reports")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch sightings for catalog trackers, decode and optionally forward them.
    FetchLocations {
        /// Comma-separated tracker names, e.g. E0D4FA128FA9,EC3987ECAA50
        #[arg(short, long, default_value = "")]
        trackers: String,
        /// Catalog page size; defaults to DEVICE_BATCH_SIZE.
        #[arg(short, long)]
        limit: Option<u32>,
        /// Page number for pagination.
        #[arg(short, long, default_value_t = 0)]
        page: u32,
        /// Lookback window in minutes.
        #[arg(long = "minutes-ago", default_value_t = 24)]
        minutes_ago: u32,
        /// Forward decoded reports to the ingestion endpoint.
        #[arg(short, long, default_value_t = false)]
        send_reports: bool,
    },
    /// Upload a freshly minted credential blob to the credential store.
    RefreshCredentials {
        /// JSON file holding the minted header blob.
        #[arg(long)]
        headers_file: PathBuf,
        /// Ask the store to schedule a fetch round once the blob lands.
        #[arg(short, long, default_value_t = false)]
        schedule_location_fetching: bool,
    },
    /// Generate tracker key pairs.
    GenerateKeys {
        /// Number of keys to generate.
        #[arg(short, long, default_value_t = 1)]
        nkeys: u32,
        /// Prefix of the key files.
        #[arg(short, long)]
        prefix: Option<String>,
        /// YAML file stem to collect the generated advertisement keys in.
        #[arg(short, long)]
        yaml: Option<String>,
        /// Print keys as they are generated.
        #[arg(short, long)]
        verbose: bool,
    },
}

async fn run_fetch_locations(
    trackers: String,
    limit: Option<u32>,
    page: u32,
    minutes_ago: u32,
    send_reports: bool,
) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let api = BeamApiClient::new(&settings)?;
    let transport = ReqwestTransport::new()?;
    let credentials = CredentialsClient::new(
        &settings.credentials_base_url,
        &settings.default_client,
        &settings.credentials_api_key,
    )?;

    let trackers_filter: Option<HashSet<String>> = if trackers.is_empty() {
        None
    } else {
        Some(trackers.split(',').map(str::to_string).collect())
    };
    let options = FetchOptions {
        page,
        limit: limit.unwrap_or(settings.device_batch_size),
        minutes_ago,
        trackers_filter,
        send_reports,
    };

    let devices = fetch_and_report_locations(&api, &transport, &credentials, &options).await?;
    for device in &devices {
        if let Some(report) = &device.report {
            info!("*****************************************");
            info!("Fetched locations for device: {} ({})", device.name, device.id);
            info!("Report: {report:?}");
        }
    }
    Ok(())
}

async fn run_refresh_credentials(
    headers_file: PathBuf,
    schedule_location_fetching: bool,
) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let raw = std::fs::read_to_string(&headers_file)
        .with_context(|| format!("reading {}", headers_file.display()))?;
    let mut blob: CredentialBlob = serde_json::from_str(&raw).context("parsing credential blob")?;
    if !settings.user_agent_comment.is_empty() {
        blob.user_agent = format!("{} {}", blob.user_agent, settings.user_agent_comment);
    }

    let client = CredentialsClient::new(
        &settings.credentials_base_url,
        &settings.default_client,
        &settings.credentials_api_key,
    )?;
    client
        .put_credentials(&blob, schedule_location_fetching)
        .await?;
    Ok(())
}

fn run_generate_keys(
    nkeys: u32,
    prefix: Option<String>,
    yaml: Option<String>,
    verbose: bool,
) -> anyhow::Result<()> {
    let mut manifest = match yaml {
        Some(stem) => {
            let path = format!("{stem}.yaml");
            let mut file =
                std::fs::File::create(&path).with_context(|| format!("creating {path}"))?;
            file.write_all(b"  keys:\n")
                .with_context(|| format!("writing {path}"))?;
            Some(file)
        }
        None => None,
    };

    for i in 0..nkeys {
        let secret = p224::SecretKey::random(&mut rand::rngs::OsRng);
        let private_bytes = secret.to_bytes();
        let public_x = crypto::derive_public_x(private_bytes.as_slice())?;

        let private_b64 = STANDARD.encode(&private_bytes);
        let public_b64 = STANDARD.encode(public_x);
        let hashed_b64 = STANDARD.encode(crypto::sha256(&public_x));

        if verbose {
            println!("{})", i + 1);
            println!("Private key: {private_b64}");
            println!("Advertisement key: {public_b64}");
            println!("Hashed adv key: {hashed_b64}");
        }

        // The hash prefix doubles as the file name; a '/' would escape it.
        if hashed_b64[..7].contains('/') {
            println!("no key file written, the hashed key prefix contains a '/'");
            continue;
        }
        let file_name = match &prefix {
            Some(prefix) => format!("{prefix}_{}.keys", &hashed_b64[..7]),
            None => format!("{}.keys", &hashed_b64[..7]),
        };
        std::fs::write(
            &file_name,
            format!(
                "Private key: {private_b64}\nAdvertisement key: {public_b64}\nHashed adv key: {hashed_b64}\n"
            ),
        )
        .with_context(|| format!("writing {file_name}"))?;

        if let Some(file) = manifest.as_mut() {
            writeln!(file, "    - \"{public_b64}\"").context("writing yaml manifest")?;
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::FetchLocations {
            trackers,
            limit,
            page,
            minutes_ago,
            send_reports,
        } => run_fetch_locations(trackers, limit, page, minutes_ago, send_reports).await,
        Command::RefreshCredentials {
            headers_file,
            schedule_location_fetching,
        } => run_refresh_credentials(headers_file, schedule_location_fetching).await,
        Command::GenerateKeys {
            nkeys,
            prefix,
            yaml,
            verbose,
        } => run_generate_keys(nkeys, prefix, yaml, verbose),
    }
}
