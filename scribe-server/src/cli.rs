//! Command-line and environment configuration.

use clap::{Parser, Subcommand};

/// Collaborative document sync server
#[derive(Parser, Debug)]
#[command(name = "scribe-server")]
#[command(about = "Real-time collaborative document sync gateway and fanout hub")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a WebSocket gateway for document sessions
    Serve(ServeArgs),
    /// Run the cross-process fanout hub
    Hub(HubArgs),
}

/// Arguments for the serve command
#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Address to accept client connections on
    #[arg(long, default_value = "127.0.0.1:9090", env = "SCRIBE_BIND")]
    pub bind: String,

    /// RocksDB directory, or a sqlite:/postgres: connection URL
    #[arg(long, default_value = "scribe_data", env = "SCRIBE_STORE")]
    pub store: String,

    /// "local" for a single process, or the hub's ws:// URL
    #[arg(long, default_value = "local", env = "SCRIBE_FANOUT")]
    pub fanout: String,

    /// HS256 secret for identity-service JWTs; takes precedence over --tokens
    #[arg(long, env = "SCRIBE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: Option<String>,

    /// Static credentials as token=user-uuid pairs, comma separated
    #[arg(long, default_value = "", env = "SCRIBE_TOKENS", hide_env_values = true)]
    pub tokens: String,

    /// Snapshot every N updates per document (0 disables)
    #[arg(long, default_value_t = 50, env = "SCRIBE_COMPACTION_INTERVAL")]
    pub compaction_interval: u64,
}

/// Arguments for the hub command
#[derive(clap::Args, Debug)]
pub struct HubArgs {
    /// Address to accept gateway connections on
    #[arg(long, default_value = "127.0.0.1:9191", env = "SCRIBE_HUB_BIND")]
    pub bind: String,

    /// Messages buffered per subscribed gateway socket
    #[arg(long, default_value_t = 1024, env = "SCRIBE_HUB_CAPACITY")]
    pub channel_capacity: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serve_defaults() {
        let cli = Cli::try_parse_from(["scribe-server", "serve"]).unwrap();
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.fanout, "local");
                assert_eq!(args.compaction_interval, 50);
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn test_serve_jwt_secret_flag() {
        let cli = Cli::try_parse_from(["scribe-server", "serve", "--jwt-secret", "k"]).unwrap();
        match cli.command {
            Commands::Serve(args) => assert_eq!(args.jwt_secret.as_deref(), Some("k")),
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn test_hub_flags() {
        let cli = Cli::try_parse_from(["scribe-server", "hub", "--bind", "0.0.0.0:7000"]).unwrap();
        match cli.command {
            Commands::Hub(args) => assert_eq!(args.bind, "0.0.0.0:7000"),
            other => panic!("expected hub, got {other:?}"),
        }
    }
}
