// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tunnelmux::util;

use util::validators::{parse_socketaddr, validate_existing_file, validate_socketaddr};

mod client;
mod config;
mod dispatch;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  if let Err(e) = tracing::subscriber::set_global_default(collector) {
    eprintln!("Logger init failed: {}", e);
    std::process::exit(2);
  }
  let transport_arg = |help: &'static str| {
    Arg::new("transport")
      .help(help)
      .long("transport")
      .short('t')
      .validator(validate_socketaddr)
      .takes_value(true)
      .required(true)
  };
  let config_arg = || {
    Arg::new("config")
      .help("JSON interface configuration: targets and local listeners")
      .long("config")
      .short('c')
      .validator(validate_existing_file)
      .takes_value(true)
      .required(true)
  };
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("listen")
        .alias("server")
        .about("Accept transport connections; each one runs a session in the server role")
        .arg(transport_arg("Address accepting transport connections"))
        .arg(config_arg()),
    )
    .subcommand(
      Command::new("connect")
        .alias("client")
        .about("Dial a transport and run a session in the client role, reconnecting as needed")
        .arg(transport_arg("Address of the listening end"))
        .arg(config_arg()),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(e) => {
      tracing::error!(err = ?e, "Tokio runtime setup failure");
      std::process::exit(2);
    }
  };
  match rt.block_on(main_args_handler(&matches)) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn config_path(args: &'_ ArgMatches) -> Result<PathBuf> {
  args
    .value_of("config")
    .map(PathBuf::from)
    .ok_or_else(|| anyhow::Error::msg("Configuration path is required"))
}

fn transport_addr(args: &'_ ArgMatches) -> Result<std::net::SocketAddr> {
  parse_socketaddr(
    args
      .value_of("transport")
      .ok_or_else(|| anyhow::Error::msg("Transport address is required"))?,
  )
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  Ok(server::ServerArgs {
    transport_bind: transport_addr(args)?,
    config: config_path(args)?,
  })
}

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<client::ClientArgs> {
  Ok(client::ClientArgs {
    transport_host: transport_addr(args)?,
    config: config_path(args)?,
  })
}

/// Cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
  let shutdown = CancellationToken::new();
  let shutdown_trigger = shutdown.clone();
  tokio::task::spawn(async move {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Interrupt received, shutting down");
    shutdown_trigger.cancel();
  });
  shutdown
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("listen", opts)) => {
      let config = server_arg_handling(opts)?;
      tracing::info!("Running as server with config {:#?}", config);
      server::server_main(config, shutdown_on_ctrl_c()).await
    }
    Some(("connect", opts)) => {
      let config = client_arg_handling(opts)?;
      tracing::info!("Running as client with config {:#?}", config);
      client::client_main(config, shutdown_on_ctrl_c()).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
