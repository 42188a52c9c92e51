use clap::Parser;
use signalbot::api::{BirdeyeClient, DexScreenerClient, JupiterClient, MarketDataSource, PriceProvider};
use signalbot::config::DEFAULT_CONFIG_PATH;
use signalbot::db::{InMemoryPositionRepository, PositionRepository, PostgresPositionRepository};
use signalbot::discovery::{spawn_discovery, CandidateSource, WatchlistSource};
use signalbot::execution::{DryRunExecutor, ExitEvaluator, ExitMonitor, PriceAggregator, TradeExecutor};
use signalbot::resilience::{CircuitBreakerRegistry, Resilience, RetryQueue};
use signalbot::risk::{
    BadActorRegistry, InMemoryBadActorRegistry, RedisBadActorRegistry, RiskScorer,
    DEFAULT_BAD_ACTORS_KEY,
};
use signalbot::strategy::{HttpScoringOracle, SignalConfig, SignalGenerator};
use signalbot::{EngineConfig, EngineError, EngineSettings, Result, TradingEngine};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

const CANDIDATE_CHANNEL_CAPACITY: usize = 256;

/// Trade-decision engine: discovery, entry signals and exit monitoring
#[derive(Debug, Parser)]
#[command(name = "signalbot", version)]
struct Args {
    /// TOML config file (optional; SIGNALBOT_* env vars override it)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Run a single entry + exit cycle and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let args = Args::parse();
    let config = EngineConfig::load(Some(args.config.as_str()))?;

    tracing::info!("🚀 signalbot starting");
    log_configuration(&config);

    let timeout = config.http_timeout();

    // Price providers in priority order
    let jupiter = match &config.jupiter_base_url {
        Some(url) => JupiterClient::with_base_url(url.clone(), timeout),
        None => JupiterClient::new(timeout),
    };
    let dexscreener = Arc::new(match &config.dexscreener_base_url {
        Some(url) => DexScreenerClient::with_base_url(url.clone(), timeout),
        None => DexScreenerClient::new(timeout),
    });
    let birdeye = config.birdeye_api_key.clone().map(|key| {
        Arc::new(match &config.birdeye_base_url {
            Some(url) => BirdeyeClient::with_base_url(key, url.clone(), timeout),
            None => BirdeyeClient::new(key, timeout),
        })
    });

    let mut providers: Vec<Arc<dyn PriceProvider>> = vec![Arc::new(jupiter)];
    if let Some(birdeye) = &birdeye {
        providers.push(birdeye.clone());
    } else {
        tracing::warn!("BIRDEYE API key not set, Birdeye price and trending disabled");
    }
    providers.push(dexscreener.clone());

    let prices = Arc::new(PriceAggregator::new(
        providers,
        config.price_cache_ttl(),
        resilience(&config),
    ));

    // Collaborators
    let oracle_url = config
        .oracle_url
        .clone()
        .ok_or_else(|| EngineError::Config("oracle_url is required".to_string()))?;
    let oracle = Arc::new(HttpScoringOracle::new(oracle_url, timeout));
    let bad_actors = connect_bad_actor_registry(&config).await;
    let repository = connect_repository(&config).await?;
    let executor: Arc<dyn TradeExecutor> = Arc::new(DryRunExecutor::new());
    let retry_queue = Arc::new(RetryQueue::new(config.retry_policy()));

    let market: Arc<dyn MarketDataSource> = dexscreener;
    let signals = Arc::new(SignalGenerator::new(
        market,
        prices.clone(),
        oracle,
        bad_actors,
        RiskScorer::from_config(&config),
        SignalConfig::from(&config),
        resilience(&config),
    ));

    // Entry and exit loops share one repository breaker
    let storage = resilience(&config);
    let exits = ExitMonitor::new(
        ExitEvaluator::from_config(&config),
        prices,
        repository.clone(),
        executor.clone(),
        storage.clone(),
        retry_queue.clone(),
        config.max_concurrent_evaluations,
    );

    // Discovery feeds the engine through a channel
    let mut sources: Vec<Arc<dyn CandidateSource>> = vec![Arc::new(WatchlistSource::new(
        config.watchlist.iter().map(|entry| entry.to_asset()).collect(),
    ))];
    if let Some(birdeye) = birdeye {
        sources.push(birdeye);
    }

    let (tx, rx) = mpsc::channel(CANDIDATE_CHANNEL_CAPACITY);
    let mut engine = TradingEngine::new(
        signals,
        exits,
        repository,
        executor,
        storage,
        retry_queue,
        rx,
        EngineSettings::from(&config),
    );

    if args.once {
        if signalbot::discovery::discover_once(&sources, &tx).await.is_none() {
            return Err(EngineError::Config("candidate channel closed".to_string()));
        }
        engine.run_once().await?;
        tracing::info!("👋 Single cycle complete");
        return Ok(());
    }

    let discovery_task = spawn_discovery(
        sources,
        tx,
        Duration::from_secs(config.discovery_interval_secs),
    );

    tracing::info!("✅ Loops spawned, press Ctrl+C to stop...");

    engine
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        })
        .await;

    discovery_task.abort();
    tracing::info!("👋 signalbot stopped");
    Ok(())
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("signalbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_configuration(config: &EngineConfig) {
    tracing::info!("📊 Configuration:");
    tracing::info!("  Confidence threshold: {}", config.confidence_threshold);
    tracing::info!("  Min liquidity: ${:.0}", config.min_liquidity_usd);
    tracing::info!(
        "  Take profit / stop loss: {:.1}% / {:.1}%",
        config.take_profit_threshold * 100.0,
        config.stop_loss_threshold * 100.0
    );
    tracing::info!("  Max holding time: {}s", config.max_holding_time_secs);
    tracing::info!("  Watchlist: {} assets", config.watchlist.len());
}

/// One breaker registry per dependency family
fn resilience(config: &EngineConfig) -> Resilience {
    Resilience::new(
        Arc::new(CircuitBreakerRegistry::new(
            config.circuit_breaker_failure_threshold,
            config.circuit_breaker_reset_timeout(),
        )),
        config.retry_policy(),
    )
}

async fn connect_repository(config: &EngineConfig) -> Result<Arc<dyn PositionRepository>> {
    match &config.database_url {
        Some(url) => {
            let repository = PostgresPositionRepository::connect(url).await?;
            Ok(Arc::new(repository))
        }
        None => {
            tracing::warn!("No database_url set, positions are kept in memory only");
            Ok(Arc::new(InMemoryPositionRepository::new()))
        }
    }
}

async fn connect_bad_actor_registry(config: &EngineConfig) -> Arc<dyn BadActorRegistry> {
    let fallback = || -> Arc<dyn BadActorRegistry> {
        Arc::new(InMemoryBadActorRegistry::new(config.bad_actors.clone()))
    };

    let Some(url) = &config.redis_url else {
        return fallback();
    };

    match RedisBadActorRegistry::connect(url, DEFAULT_BAD_ACTORS_KEY).await {
        Ok(registry) => {
            if let Err(e) = registry.flag_all(&config.bad_actors).await {
                tracing::warn!("Failed to seed bad actors in Redis: {}", e);
            }
            Arc::new(registry)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to connect to Redis ({}), using configured bad actors only",
                e
            );
            fallback()
        }
    }
}
