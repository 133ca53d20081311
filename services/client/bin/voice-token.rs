//! Diagnostic entrypoint: requests a session credential from the configured
//! token endpoint and prints where the session would connect.

use anyhow::Context;
use clap::Parser;
use secrecy::ExposeSecret;
use tracing::info;
use voice_agent_client::{
    config::Config,
    token::{HttpTokenClient, TokenClient},
};

#[derive(Parser, Debug)]
#[command(version, about = "Fetch a voice session credential")]
struct Args {
    /// Agent to request a room for. Defaults to VOICE_AGENT_ID.
    #[arg(short, long)]
    agent: Option<String>,

    /// Print the raw access token instead of a redacted one.
    #[arg(long)]
    show_token: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();

    let agent_id = args.agent.or_else(|| config.default_agent_id.clone());
    info!(endpoint = %config.token_url, agent = ?agent_id, "Requesting credential");

    let client = HttpTokenClient::new(config.token_url.clone());
    let credential = client
        .fetch_credential(agent_id)
        .await
        .context("Credential request failed")?;

    let token = credential.token.expose_secret();
    println!("room:  {}", credential.room_name);
    println!("url:   {}", credential.room_url);
    if args.show_token {
        println!("token: {token}");
    } else {
        println!("token: <{} bytes, pass --show-token to print>", token.len());
    }
    Ok(())
}
