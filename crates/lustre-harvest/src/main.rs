// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! lustre-harvest entry point.
//!
//! One binary, two roles. With no positional arguments it runs the server
//! on this host; given a server hostname and filesystem names it runs the
//! harvesting client:
//!
//! ```bash
//! # on the head node
//! lustre-harvest
//!
//! # on every OSS/MDS
//! lustre-harvest vu-man4 data apps
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use lustre_harvest::client::{ClientConfig, HarvestClient};
use lustre_harvest::config;
use lustre_harvest::secret::Secret;
use lustre_harvest::server::{HarvestServer, ServerConfig};
use lustre_harvest::stats::StatsTree;

/// Harvest Lustre per-client I/O counters and spoof rates into ganglia.
#[derive(Parser, Debug)]
#[command(name = "lustre-harvest")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Print summaries of the data gathered and published
    #[arg(short, long)]
    verbose: bool,

    /// Do not send results to ganglia
    #[arg(short, long)]
    dryrun: bool,

    /// Alternate shared secret file
    #[arg(long, value_name = "FILE", default_value = config::DEFAULT_SECRET_FILE)]
    secretfile: PathBuf,

    /// TCP port to send/receive on
    #[arg(long, default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// Server only: listen on the interface matching this hostname instead
    /// of the one gethostname resolves to
    #[arg(long, value_name = "NAME")]
    interface: Option<String>,

    /// Server hostname followed by one or more filesystem names (client
    /// mode); leave empty to run the server
    #[arg(value_name = "ARGS")]
    args: Vec<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let secret = match Secret::load(&args.secretfile) {
        Ok(secret) => secret,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::FAILURE;
        }
    };

    if args.args.is_empty() {
        // Server mode: bind to this host, or to the named interface.
        let bind_host = match args.interface {
            Some(interface) => interface,
            None => match local_hostname() {
                Some(host) => host,
                None => {
                    eprintln!("cannot determine local hostname");
                    return ExitCode::FAILURE;
                }
            },
        };

        let server_config = ServerConfig {
            bind_host,
            port: args.port,
            gathers_per_minute: config::GATHERS_PER_MINUTE,
            dryrun: args.dryrun,
        };
        let mut server = match HarvestServer::bind(server_config, secret) {
            Ok(server) => server,
            Err(err) => {
                eprintln!("{}", err);
                return ExitCode::FAILURE;
            }
        };
        server.run();
        // The server loop never returns.
        ExitCode::SUCCESS
    } else {
        if args.interface.is_some() {
            eprintln!("error: --interface is an option for the server only");
            return ExitCode::from(2);
        }
        if args.args.len() < 2 {
            eprintln!("error: client mode needs a server name and one or more filesystem names");
            return ExitCode::from(2);
        }

        let mut positional = args.args.into_iter();
        let server = positional.next().unwrap_or_default();
        let client_config = ClientConfig {
            server,
            port: args.port,
            filesystems: positional.collect(),
            gathers_per_minute: config::GATHERS_PER_MINUTE,
        };
        let client = HarvestClient::new(client_config, StatsTree::production(), secret);
        client.run()
    }
}

fn local_hostname() -> Option<String> {
    hostname::get().ok().and_then(|h| h.into_string().ok())
}
