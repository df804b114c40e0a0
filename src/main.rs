mod application;
mod config;
mod domain;
mod infrastructure;

use application::agent::{Agent, AgentOptions};
use application::tooling::ToolRegistry;
use application::tooling::address::{GeocodeAddress, NormalizeAddress};
use clap::Parser;
use config::AppConfig;
use infrastructure::model::OpenAiClient;
use serde_json::json;
use std::error::Error;
use std::fs;
use std::io::{self, IsTerminal, Read};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(
    name = "callsheet-agent",
    version,
    about = "Extracts structured call sheet data through a bounded tool-calling conversation"
)]
struct Cli {
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    max_turns: Option<usize>,
    #[arg(long)]
    text_file: Option<String>,
    text: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    init_tracing();
    info!("Starting callsheet-agent");
    let cli = Cli::parse();
    debug!(config = ?cli.config, model = ?cli.model, max_turns = ?cli.max_turns, "CLI arguments parsed");

    let config_path = cli.config.as_deref().map(Path::new);
    let mut config = AppConfig::load(config_path)?;
    if let Some(path) = config_path {
        info!(path = %path.display(), "Loaded configuration from file");
    }
    if let Some(model) = cli.model.clone() {
        config.model = model;
    }
    if let Some(max_turns) = cli.max_turns {
        config.max_turns = max_turns;
    }

    let seed_text = load_seed_text(&cli)?;
    let api_key = config.api_key(cli.api_key.clone());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()?;

    let provider = Arc::new(OpenAiClient::new(
        config.base_url.clone(),
        api_key,
        http.clone(),
    ));
    let registry = Arc::new(
        ToolRegistry::new()
            .with_timeout(Duration::from_secs(config.tool_timeout_secs))
            .register(Arc::new(NormalizeAddress))
            .register(Arc::new(GeocodeAddress::new(
                config.geocoder_url.clone(),
                http,
            ))),
    );

    let agent = Agent::new(
        provider,
        registry,
        AgentOptions::new(config.model.clone()).with_max_turns(config.max_turns),
    );
    let outcome = agent.run(&seed_text, &config.schema).await?;

    let output = json!({
        "record": outcome.record,
        "turns": outcome.turns,
        "tool_steps": outcome.steps,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    info!("Extraction finished");
    Ok(())
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_level(true)
            .init();
    });
}

fn load_seed_text(cli: &Cli) -> Result<String, Box<dyn Error>> {
    if let Some(path) = &cli.text_file {
        info!(path = %path, "Loading call sheet text from file");
        let content = fs::read_to_string(path)?;
        return Ok(content.trim().to_string());
    }

    if !cli.text.is_empty() {
        info!("Using call sheet text provided through CLI arguments");
        return Ok(cli.text.join(" ").trim().to_string());
    }

    if !io::stdin().is_terminal() {
        info!("Reading call sheet text from standard input");
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        return Ok(buffer.trim().to_string());
    }

    warn!("Call sheet text not provided via arguments, file, or stdin");
    Err("call sheet text required via arguments, file, or stdin".into())
}
