use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use esi_market_mirror::{
    Config, EsiClient, MarketDb, MarketService, OrderQueryOptions, OrderSide, Result,
};

#[tokio::main]
async fn main() {
    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

/// One mirror pass: refresh (or confirm fresh) the configured region's
/// orders. REGION_ID selects the region; ORDER_SIDE and TYPE_ID narrow the
/// query. Defaults to The Forge, all orders.
async fn run(cfg: Config) -> Result<()> {
    let region_id: i64 = std::env::var("REGION_ID")
        .unwrap_or_else(|_| "10000002".to_string())
        .parse()
        .map_err(|_| {
            esi_market_mirror::MirrorError::Validation(
                "REGION_ID must be a numeric region id".to_string(),
            )
        })?;
    let side = OrderSide::parse(
        &std::env::var("ORDER_SIDE").unwrap_or_else(|_| "all".to_string()),
    )?;
    let type_id: Option<i64> = match std::env::var("TYPE_ID") {
        Ok(v) => Some(v.parse().map_err(|_| {
            esi_market_mirror::MirrorError::Validation(
                "TYPE_ID must be a numeric type id".to_string(),
            )
        })?),
        Err(_) => None,
    };

    let db = MarketDb::connect(&cfg.db_path).await?;
    info!("Database ready at {}", cfg.db_path);

    let client = EsiClient::new(&cfg)?;
    let service = MarketService::new(client, db, cfg.fetch_concurrency);

    let orders = service
        .region_orders(region_id, side, type_id, OrderQueryOptions::default())
        .await?;
    info!(
        region_id,
        %side,
        orders = orders.len(),
        "mirror pass complete"
    );

    Ok(())
}
