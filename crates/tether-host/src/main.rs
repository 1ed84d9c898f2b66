//! Tether Host - standalone server for the demo calculator service.
//!
//! Prints `RPC_PORT=<port>` on stdout once the listener is bound so a parent
//! process can discover an auto-assigned port.

mod calculator;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tether_core::server::{Identity, StaticTokenAuthorizer};
use tether_core::{serve, Providers, ServerConfig, ServerDispatcher, ServiceCatalog};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "tether-host")]
#[command(about = "Tether RPC server hosting the demo calculator")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Accepted bearer token as TOKEN=USER (repeatable)
    #[arg(long = "token", value_name = "TOKEN=USER")]
    tokens: Vec<String>,

    /// Seconds a raised event waits for its client handler
    #[arg(long, default_value = "30")]
    event_timeout: u64,

    /// Seconds an idle service instance is kept
    #[arg(long, default_value = "1800")]
    idle_timeout: u64,
}

fn authorizer(tokens: &[String]) -> Result<StaticTokenAuthorizer> {
    tokens.iter().try_fold(StaticTokenAuthorizer::new(), |auth, entry| {
        let (token, user) = entry
            .split_once('=')
            .with_context(|| format!("invalid --token '{}', expected TOKEN=USER", entry))?;
        Ok(auth.with_token(token, Identity::user(user, &[])))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Tether host");

    let catalog = ServiceCatalog::new(1).with_service(calculator::binding()?)?;
    let providers = Providers::default().with_authorizer(Arc::new(authorizer(&args.tokens)?));
    let config = ServerConfig::default()
        .with_event_timeout(Duration::from_secs(args.event_timeout))
        .with_instance_idle_timeout(Duration::from_secs(args.idle_timeout));
    let dispatcher = ServerDispatcher::new(catalog, providers, config);

    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;
    let server = serve(dispatcher, addr).await?;

    // Parent processes read the port from stdout.
    println!("RPC_PORT={}", server.addr().port());

    info!("RPC server running on {}", server.addr());

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");
    server.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_parsing() {
        let auth = authorizer(&["abc=ada".to_string()]).unwrap();
        use tether_core::server::Authorizer;
        assert_eq!(auth.authorize(Some("abc")).unwrap().name, "ada");
        assert!(authorizer(&["missing-separator".to_string()]).is_err());
    }
}
