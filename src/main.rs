use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::SecretString;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::api::{app, AppState};
use tollgate::backends::OpenAiCompatible;
use tollgate::config::Config;
use tollgate::ledger::store::MemoryStore;
use tollgate::provider::{Provider, ProviderSpec};
use tollgate::registry::RegistryBuilder;
use tollgate::tier::Tier;
use tollgate::{BudgetLedger, Router, TracingSink};

#[derive(Debug, Parser)]
#[command(name = "tollgate", about = "Budget-aware admission and routing for LLM traffic")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, env = "TOLLGATE_CONFIG", default_value = "tollgate.toml")]
    config: PathBuf,

    /// Override the listen address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = Config::load(&args.config)?;
    let listen = args.listen.unwrap_or_else(|| config.server.listen.clone());

    let http_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .build()
        .context("failed to build HTTP client")?;

    let mut builder = RegistryBuilder::new();
    let mut configured_tiers = BTreeSet::new();
    for settings in &config.providers {
        let tier = settings.tier()?;
        configured_tiers.insert(tier);

        let api_key = match settings.api_key_env.as_deref() {
            Some(var) => match std::env::var(var) {
                Ok(value) => Some(SecretString::from(value)),
                Err(_) => {
                    warn!(provider = %settings.name, env = var, "API key variable not set");
                    None
                }
            },
            None => None,
        };

        let spec = ProviderSpec {
            name: settings.name.clone(),
            tier,
            priority: settings.priority,
            input_cost_per_token: settings.input_cost_per_token(),
            output_cost_per_token: settings.output_cost_per_token(),
            invoke_timeout: settings.invoke_timeout(),
            privacy_compatible: settings.privacy_compatible,
        };
        info!(provider = %spec.name, tier = %spec.tier, model = %settings.model, "registering provider");
        let provider: Arc<dyn Provider> = Arc::new(OpenAiCompatible::new(
            spec,
            settings.base_url.clone(),
            settings.model.clone(),
            api_key,
            http_client.clone(),
        ));
        builder = builder.register(provider);
    }
    for tier in config.failover.excluded()? {
        builder = builder.exclude_from_failover(tier);
    }

    let serviceable: Vec<Tier> = match config.failover.serviceable()? {
        Some(tiers) => tiers,
        None => configured_tiers.iter().copied().collect(),
    };
    let registry = Arc::new(
        builder
            .build(&serviceable)
            .context("provider registry configuration is invalid")?,
    );

    let events = Arc::new(TracingSink);
    let ledger = Arc::new(BudgetLedger::new(
        Arc::new(MemoryStore::new()),
        config.ledger.ledger_config(),
        events.clone(),
    ));
    let router = Arc::new(Router::new(
        registry,
        ledger.clone(),
        (&config.breaker).into(),
        (&config.health).into(),
        events,
        config.ledger.router_config(),
    ));

    let app = app(AppState { router, ledger })
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "tollgate listening");
    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    Ok(())
}
