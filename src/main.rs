use anyhow::{anyhow, Context, Result};
use clap::Parser;
use conduit_broker::testkit::RecordingChannel;
use conduit_broker::{BrokerConnection, Message};
use conduit_core::config::{
    AckMode, AppConfig, ConnectionManagerConfig, LogFormat, LoggingConfig, TransactionSupport,
};
use conduit_core::xa::{TMNOFLAGS, TMSUCCESS};
use conduit_core::{RequestCriteria, Xid};
use conduit_pool::testkit::{InMemoryCoordinator, InMemoryFactory};
use conduit_pool::{AssociationCache, ConnectionManager, ContextKey};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashSet;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Conduit - transaction-aware connection pooling and broker client core
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long, env = "CONDUIT_LOG_LEVEL")]
    log_level: Option<String>,

    /// Connections to allocate per manager in the demo run
    #[arg(long, default_value_t = 4)]
    checkouts: usize,

    /// Messages to publish in the broker demo run
    #[arg(long, default_value_t = 3)]
    messages: usize,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    logging.parse_level()?;
    let filter = EnvFilter::try_new(logging.filter_directives())
        .context("Invalid logging directives")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(logging.file_line)
        .with_line_number(logging.file_line);

    match (&logging.file, logging.format) {
        (Some(path), LogFormat::Json) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            builder.json().with_writer(Arc::new(file)).init();
        }
        (Some(path), LogFormat::Text) => {
            let file = File::create(path)
                .with_context(|| format!("Failed to open log file: {:?}", path))?;
            builder.with_ansi(false).with_writer(Arc::new(file)).init();
        }
        (None, LogFormat::Json) => builder.json().init(),
        (None, LogFormat::Text) => builder.init(),
    }
    Ok(())
}

fn load_config(args: &Args) -> Result<AppConfig> {
    let mut config = match &args.config {
        Some(path) => AppConfig::from_config_builder(path)
            .with_context(|| format!("Failed to load config file: {:?}", path))?,
        None => AppConfig::default(),
    };

    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if config.managers.is_empty() {
        let mut manager = ConnectionManagerConfig::new("demo/orders");
        manager.transaction_support = TransactionSupport::Xa;
        manager.pool.max_size = 4;
        config.managers.push(manager);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Allocates connections inside a component context and a transaction for
/// every configured manager.
fn run_pool_demo(config: &AppConfig, checkouts: usize) -> Result<()> {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let cache = Arc::new(AssociationCache::new(
        config.association.clone(),
        Some(coordinator.clone()),
    ));

    for manager_config in &config.managers {
        let name = manager_config.resource_name.clone();
        let factory = InMemoryFactory::new(format!("{}-factory", name));
        let manager = ConnectionManager::builder(manager_config.clone(), factory.clone())
            .coordinator(coordinator.clone())
            .association_cache(cache.clone())
            .build()?;

        let component = ContextKey::new(format!("component:{}", name));
        {
            let _context = cache.enter_context(component, HashSet::new())?;
            coordinator.begin().map_err(|e| anyhow!(e))?;

            let mut connections = Vec::with_capacity(checkouts);
            for _ in 0..checkouts {
                connections.push(manager.allocate_connection(
                    factory.as_ref(),
                    None,
                    &RequestCriteria::default(),
                )?);
            }
            for connection in connections {
                connection.close().map_err(|e| anyhow!(e))?;
            }

            coordinator.commit().map_err(|e| anyhow!(e))?;
        }

        let stats = manager.stats();
        info!(
            resource = %name,
            created = stats.pool.created,
            idle = stats.pool.idle,
            in_use = stats.pool.in_use,
            "Pool demo finished"
        );
        manager.shutdown();
    }
    Ok(())
}

/// Publishes through a transacted session and an XA session.
async fn run_broker_demo(config: &AppConfig, messages: usize) -> Result<()> {
    let channel = RecordingChannel::new();
    let connection = BrokerConnection::new(channel.clone(), config.broker.clone());

    let session = connection.create_session(AckMode::Transacted);
    for i in 0..messages {
        session
            .send(Message::new("demo.orders", format!("order {}", i)))
            .await?;
    }
    session.commit().await?;

    let xa_session = connection.create_xa_session();
    let inbound = Message::new("demo.inbox", "request");
    xa_session.deliver(&inbound, "demo-consumer").await?;
    xa_session
        .send(Message::new("demo.outbox", "reply"))
        .await?;

    let resource = xa_session.xa_resource()?;
    let xid = Xid::generate();
    resource.start(&xid, TMNOFLAGS).await?;
    resource.end(&xid, TMSUCCESS).await?;
    resource.prepare(&xid).await?;
    resource.commit(&xid, false).await?;
    xa_session.after_delivery().await?;

    connection.close().await;
    info!(
        client_id = %connection.client_id(),
        requests = channel.transactions().len(),
        stats = %connection.stats(),
        "Broker demo finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let config = load_config(&args)?;
    init_tracing(&config.logging)?;

    let prometheus = if config.metrics.enabled {
        Some(
            PrometheusBuilder::new()
                .install_recorder()
                .context("Failed to install metrics recorder")?,
        )
    } else {
        None
    };

    info!(managers = config.managers.len(), "Starting Conduit demo");

    let pool_config = config.clone();
    let checkouts = args.checkouts;
    tokio::task::spawn_blocking(move || run_pool_demo(&pool_config, checkouts))
        .await
        .context("Pool demo panicked")??;

    run_broker_demo(&config, args.messages).await?;

    match prometheus {
        Some(handle) => println!("{}", handle.render()),
        None => warn!("Metrics disabled, no snapshot rendered"),
    }
    Ok(())
}
