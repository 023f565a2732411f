use anyhow::Result;
use clap::{Arg, Command};
use log::info;
use std::path::PathBuf;

use vufs::{Config, Network, Server};

fn create_cli_app() -> Command {
    Command::new("vufs")
        .version(env!("CARGO_PKG_VERSION"))
        .about("9P2000 file server with virtual file ownership")
        .arg(
            Arg::new("root")
                .value_name("DIR")
                .help("Directory to serve")
                .required(true),
        )
        .arg(
            Arg::new("address")
                .short('a')
                .long("address")
                .value_name("ADDR")
                .help("Listen address: host:port for tcp, a path for unix")
                .default_value("0.0.0.0:5640"),
        )
        .arg(
            Arg::new("network")
                .short('n')
                .long("network")
                .value_name("NET")
                .help("Listen transport (tcp or unix)")
                .default_value("tcp"),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("NAME")
                .help("Owner assigned to files without an ownership sidecar")
                .default_value("adm"),
        )
        .arg(
            Arg::new("debug")
                .short('d')
                .long("debug")
                .help("Print every decoded T-message and encoded R-message")
                .action(clap::ArgAction::SetTrue),
        )
}

fn main() -> Result<()> {
    let matches = create_cli_app().get_matches();
    let debug = matches.get_flag("debug");

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if debug { "debug" } else { "info" }),
    )
    .init();

    let root = PathBuf::from(matches.get_one::<String>("root").expect("root is required"));
    let network: Network = matches
        .get_one::<String>("network")
        .expect("network has a default")
        .parse()?;
    let listen = matches.get_one::<String>("address").expect("address has a default");
    let user = matches.get_one::<String>("user").expect("user has a default");

    let mut config = Config::new(root, network, listen.as_str(), user.as_str())?;
    config.debug = debug;

    serve_blocking(config)
}

/// Create a tokio runtime and run the server until interrupted.
fn serve_blocking(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let server = Server::start(config).await?;
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
        server.stop().await;
        Ok(())
    })
}
