mod cli;

use clap::Parser;
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;

use scribe_sync::{
    DbKind, DocumentStore, Fanout, FanoutHub, Gateway, GatewayConfig, HubConfig, HubFanout,
    IdentityProvider, JwtIdentity, LocalFanout, RocksStore, SqlStore, StoreConfig, SyncConfig,
    SyncService, TokenTable,
};

use cli::{Cli, Commands, HubArgs, ServeArgs};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

async fn open_store(target: &str) -> Result<Arc<dyn DocumentStore>, BoxError> {
    if DbKind::from_url(target).is_some() {
        Ok(Arc::new(SqlStore::connect(target).await?))
    } else {
        let config = StoreConfig {
            path: PathBuf::from(target),
            ..StoreConfig::default()
        };
        Ok(Arc::new(RocksStore::open(config)?))
    }
}

fn open_fanout(target: &str) -> Result<Arc<dyn Fanout>, BoxError> {
    if target == "local" {
        Ok(Arc::new(LocalFanout::default()))
    } else if target.starts_with("ws://") || target.starts_with("wss://") {
        Ok(Arc::new(HubFanout::new(target)))
    } else {
        Err(format!("unsupported fanout '{target}': expected 'local' or a ws:// URL").into())
    }
}

fn open_identity(
    jwt_secret: Option<&str>,
    tokens: &str,
) -> Result<Arc<dyn IdentityProvider>, BoxError> {
    if let Some(secret) = jwt_secret.filter(|s| !s.is_empty()) {
        if !tokens.is_empty() {
            warn!("Both a JWT secret and static tokens are set; static tokens are ignored");
        }
        return Ok(Arc::new(JwtIdentity::new(secret)));
    }

    let table = TokenTable::parse(tokens)?;
    if table.is_empty() {
        warn!("No JWT secret or tokens configured; every connection will be rejected");
    }
    Ok(Arc::new(table))
}

async fn serve(args: ServeArgs) -> Result<(), BoxError> {
    let store = open_store(&args.store).await?;
    let fanout = open_fanout(&args.fanout)?;

    let identity = open_identity(args.jwt_secret.as_deref(), &args.tokens)?;

    let sync = SyncService::new(
        store,
        SyncConfig {
            compaction_interval: args.compaction_interval,
            ..SyncConfig::default()
        },
    );
    let config = GatewayConfig {
        bind_addr: args.bind,
        ..GatewayConfig::default()
    };
    let gateway: Arc<Gateway> = Arc::new(Gateway::new(config, sync, fanout, identity));

    info!(
        "Starting gateway (store: {}, fanout: {})",
        args.store, args.fanout
    );
    tokio::select! {
        result = gateway.clone().run() => result?,
        _ = tokio::signal::ctrl_c() => {
            let stats = gateway.stats();
            info!(
                "Shutting down: {} connections served, {} updates persisted",
                stats.total_connections, stats.updates_persisted
            );
        }
    }
    Ok(())
}

async fn hub(args: HubArgs) -> Result<(), BoxError> {
    let hub = FanoutHub::new(HubConfig {
        bind_addr: args.bind,
        channel_capacity: args.channel_capacity,
    });

    tokio::select! {
        result = hub.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down hub: {} frames relayed", hub.stats().frames_relayed);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Hub(args) => hub(args).await,
    }
}
