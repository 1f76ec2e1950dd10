// =============================================================================
// Matrixon Sync Gateway - Clap Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Command line interface of the gateway binary.
//
// =============================================================================

use std::{net::IpAddr, path::PathBuf, time::Instant};

use clap::{Parser, Subcommand};
use tracing::{debug, instrument};

/// Returns the current version of the crate with extra info if supplied
///
/// Set the environment variable `MATRIXON_GATEWAY_VERSION_EXTRA` at build time
/// to any UTF-8 string to include it in parenthesis after the SemVer version.
/// Reported by the health endpoint.
pub fn version() -> String {
    let cargo_pkg_version = env!("CARGO_PKG_VERSION");

    match option_env!("MATRIXON_GATEWAY_VERSION_EXTRA") {
        Some(x) => format!("{} ({})", cargo_pkg_version, x),
        None => cargo_pkg_version.to_owned(),
    }
}

/// Matrixon Sync Gateway
///
/// Sits in front of Matrix homeservers and answers `/sync` with fast initial
/// sync and bounded long-polling.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[clap(about, version, name = "matrixon-gateway")]
pub struct Args {
    /// Path to configuration file
    #[clap(short, long, env = "MATRIXON_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log filter override (e.g. `info,matrixon_gateway=debug`)
    #[clap(short, long, global = true)]
    pub log_level: Option<String>,

    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the gateway (default)
    Start {
        /// Address to bind to
        #[clap(long)]
        address: Option<IpAddr>,

        /// Port to bind to
        #[clap(long)]
        port: Option<u16>,
    },

    /// Load and validate the configuration, then exit
    CheckConfig,
}

#[instrument(level = "debug")]
pub fn parse() -> Args {
    let start = Instant::now();
    let args = Args::parse();
    debug!("✅ Command line arguments parsed in {:?}", start.elapsed());
    args
}
