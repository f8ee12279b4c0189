use std::{env, time::Duration};

use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use searchparty::{
    accessory::{generate_keys, AccessoryKey},
    protocol::OfflineFindingPublicKey,
    server::{
        derive_session, AppleReportsServer, DeviceIdentity, GsaClient, OperatorPrompt,
        RemoteAnisetteProvider, SecondFactorMethod, SessionCredential, StdinPrompt,
    },
};

const NETWORK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
struct CliParser {
    /// Address of an anisette v3-compatible server.
    #[arg(long, default_value = "http://localhost:8000")]
    anisette_server: String,

    /// Command to execute.
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate accessory keys and their advertisement material.
    GenerateKeys {
        /// Number of keys to generate.
        #[arg(long, default_value_t = 1)]
        count: usize,
        /// Required base64 prefix of the hashed public key.
        #[arg(long, default_value = "")]
        prefix: String,
        /// Serial number assigned to the first accepted key.
        #[arg(long, default_value_t = 1)]
        start_from: u32,
    },
    /// Fetch raw reports from Apple's server without decrypting them.
    FetchRawReports {
        /// Base64-encoded 28-byte P224 private key.
        #[arg(long, group = "fetch-by")]
        private_key: Option<String>,
        /// Base64-encoded 28-byte P224 public key.
        #[arg(long, group = "fetch-by")]
        public_key: Option<String>,
        /// Base64-encoded SHA256 hash of a P224 public key.
        #[arg(long, group = "fetch-by")]
        hashed_public_key: Option<String>,
        /// How many hours to look back.
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Fetch reports from Apple's server by private key and decrypt them.
    FetchReports {
        /// Base64-encoded 28-byte P224 private key.
        private_key: String,
        /// How many hours to look back.
        #[arg(long, default_value_t = 24)]
        hours: u32,
    },
    /// Authenticate against the identity service and print the session
    /// credential.
    Login {
        /// Apple ID; prompted for when absent.
        #[arg(long)]
        username: Option<String>,
        /// Deliver the second-factor code to a trusted device instead of
        /// over SMS.
        #[arg(long)]
        trusted_device: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli_args = CliParser::parse();
    let anisette = RemoteAnisetteProvider::new(
        &cli_args.anisette_server,
        reqwest::Client::builder().timeout(NETWORK_TIMEOUT).build()?,
    );

    match &cli_args.command {
        Command::GenerateKeys {
            count,
            prefix,
            start_from,
        } => {
            let keys = generate_keys(&mut rand::rngs::OsRng, *count, prefix, *start_from)?;
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Command::FetchRawReports {
            private_key,
            public_key,
            hashed_public_key,
            hours,
        } => {
            let hashed = match (private_key, public_key, hashed_public_key) {
                (Some(sk), _, _) => AccessoryKey::from_private_key_base64(sk)?
                    .hashed_public_key_base64(),
                (_, Some(pk), _) => OfflineFindingPublicKey::from_base64(pk)?.hash_base64(),
                (_, _, Some(hpk)) => {
                    // validate early rather than ship garbage to the server
                    if b64.decode(hpk)?.len() != 32 {
                        bail!("hashed public key must decode to 32 bytes");
                    }
                    hpk.clone()
                }
                _ => bail!("one of --private-key, --public-key, --hashed-public-key is required"),
            };

            let server = AppleReportsServer::new(anisette, NETWORK_TIMEOUT)?;
            let raw_reports = server
                .fetch_raw_reports(&session_from_env()?, &[hashed], *hours)
                .await?;
            println!("{}", serde_json::to_string_pretty(&raw_reports)?);
        }
        Command::FetchReports { private_key, hours } => {
            let key = AccessoryKey::from_private_key_base64(private_key)?;

            let server = AppleReportsServer::new(anisette, NETWORK_TIMEOUT)?;
            let reports = server
                .fetch_location_reports(&session_from_env()?, &key, *hours)
                .await?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Login {
            username,
            trusted_device,
        } => {
            let prompt = StdinPrompt();
            let username = match username {
                Some(u) => u.clone(),
                None => prompt.prompt_text("Apple ID: ")?,
            };
            let password = prompt.prompt_text("Password: ")?;
            let factor = if *trusted_device {
                SecondFactorMethod::TrustedDevice
            } else {
                SecondFactorMethod::Sms
            };

            let client = GsaClient::new(
                anisette,
                DeviceIdentity::random(),
                StdinPrompt(),
                NETWORK_TIMEOUT,
            )?;
            let payload = client.login(&username, &password, factor).await?;
            let session = derive_session(&payload)?;
            println!("{}", serde_json::to_string_pretty(&session)?);
        }
    }

    Ok(())
}

/// Read the externally persisted session credential from the environment.
fn session_from_env() -> Result<SessionCredential> {
    let dsid = env::var("APPLE_AUTH_DSID")
        .context("APPLE_AUTH_DSID is not set; run the login command first")?;
    let search_party_token = env::var("APPLE_AUTH_SEARCH_PARTY_TOKEN")
        .context("APPLE_AUTH_SEARCH_PARTY_TOKEN is not set; run the login command first")?;

    Ok(SessionCredential {
        dsid,
        search_party_token,
    })
}
