use clap::Parser;
use env_logger::Builder;
use log::{info, warn, LevelFilter};
use tokio::sync::mpsc;

use sdnrc::config::{BgperConfig, RoutingConfig};
use sdnrc::controller::Controller;
use sdnrc::resolver::ResolverHandle;

/// OpenFlow 1.0 control-plane router and BGP border bridge.
#[derive(Parser)]
#[clap(name = "sdnrcd", version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Directory containing `routing.config` and `bgper_config`.
    config_dir: String,

    /// TAP device name the BGP speaker attaches to.
    #[clap(long, default_value = "tap0")]
    tap_device: String,

    /// Logging verbosity; repeat for more (e.g. -vv).
    #[clap(short, long, parse(from_occurrences))]
    verbose: u8,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (crate_level, other_level) = match cli.verbose {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        _ => (LevelFilter::Trace, LevelFilter::Trace),
    };
    Builder::new()
        .filter(Some("sdnrc"), crate_level)
        .filter(None, other_level)
        .init();
    info!("logging at levels {}/{}", crate_level, other_level);

    let routing_path = format!("{}/routing.config", cli.config_dir);
    let bgper_path = format!("{}/bgper_config", cli.config_dir);

    let routing_config = RoutingConfig::from_file(&routing_path).unwrap_or_else(|e| {
        warn!("{}, starting with no gateway bindings", e);
        RoutingConfig::default()
    });
    let bgper_config = match BgperConfig::from_file(&bgper_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: could not load {}: {}", bgper_path, e);
            std::process::exit(1);
        }
    };

    let (resolver, mut resolver_inbox) = ResolverHandle::with_default_timeout();
    tokio::spawn(async move {
        // The external-destination resolver module is an out-of-scope
        // collaborator (§1); until it's wired in, every request times out
        // and the packet is dropped rather than the loop stalling.
        while resolver_inbox.recv().await.is_some() {}
    });

    let controller = match Controller::new(routing_config, bgper_config, &cli.tap_device, resolver) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("fatal: could not start controller: {}", e);
            std::process::exit(1);
        }
    };

    // The OpenFlow session layer and topology discovery feed events into
    // this channel; both are out-of-scope external collaborators (§1).
    let (_events_tx, events_rx) = mpsc::channel(256);
    controller.run(events_rx).await;
}
