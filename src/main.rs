use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use dotenv::dotenv;
use mint_gateway::{
    abuse::{AbuseConfig, AbuseDetector},
    capacity::CapacityManager,
    chain::{ChainReader, HttpChainClient},
    coalescer::{CoalescerConfig, SettlementCoalescer},
    config::Config,
    deadline::TokenDeadlineCache,
    facilitator::{Facilitator, HttpFacilitator},
    handlers,
    kv::{KvPoolConfig, RedisPool},
    metrics,
    services::MintService,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .init();

    let config = Config::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    info!("Starting Mint Gateway on port {}", config.server.port);

    metrics::register_metrics();

    let pool = RedisPool::connect(KvPoolConfig::from_config(&config.kv))
        .await
        .expect("Failed to connect KV pool");

    let chain: Arc<dyn ChainReader> = Arc::new(
        HttpChainClient::new(&config.chain.rpc_urls, config.chain.rpc_timeout_secs)
            .expect("Failed to build chain client"),
    );

    let facilitator: Arc<dyn Facilitator> = Arc::new(
        HttpFacilitator::new(&config.facilitator).expect("Failed to build facilitator client"),
    );

    let capacity = Arc::new(CapacityManager::new(chain.clone(), pool.clone()));
    let deadlines = Arc::new(TokenDeadlineCache::new(chain));
    let abuse = Arc::new(AbuseDetector::new(
        pool.clone(),
        AbuseConfig::from_config(&config.abuse),
    ));
    let coalescer = SettlementCoalescer::new(
        facilitator.clone(),
        CoalescerConfig::from_config(&config.batch),
    );

    let mint_service = Arc::new(MintService::new(
        capacity,
        deadlines,
        abuse.clone(),
        facilitator,
        coalescer.clone(),
        config.payment.clone(),
    ));

    info!(
        "Gateway wired: facilitator {}, batch size {}, abuse window {}s",
        config.facilitator.url, config.batch.size, config.abuse.window_secs
    );

    // ========== HTTP SERVER ==========

    let app_config = config.clone();
    let app_pool = pool.clone();
    let server = HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(mint_service.clone()))
            .app_data(web::Data::new(abuse.clone()))
            .app_data(web::Data::new(app_pool.clone()))
            .app_data(web::Data::new(app_config.clone()))
            .configure(handlers::configure_routes)
    })
    .workers(config.server.workers)
    .bind((config.server.host.as_str(), config.server.port))?
    .run();

    // actix stops accepting and drains request handlers on SIGINT/SIGTERM;
    // the coalescer and pool drain after it, under a hard deadline.
    server.await?;

    info!("HTTP server stopped, draining background components");
    let drain = async {
        coalescer.shutdown().await;
        pool.shutdown().await;
    };
    if tokio::time::timeout(Duration::from_secs(10), drain)
        .await
        .is_err()
    {
        warn!("Drain stalled past 10s, exiting anyway");
    }

    info!("Mint Gateway stopped");
    Ok(())
}
