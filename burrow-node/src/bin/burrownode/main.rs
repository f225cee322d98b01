// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! The `burrownode` binary: parse the CLI surface, set up logging, then
//! hand everything to the driver on a current-thread runtime. The node
//! exits 0 after a SIGINT shutdown and non-zero on any fatal failure.

mod log;

use std::{net::IpAddr, path::PathBuf};

use burrow_logging::{LogFormat, LogOutputDest};
use burrow_node::networking::{Driver, DriverConfig};
use clap::Parser;
use eyre::{eyre, Result};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "burrownode", version, about = "Burrow DHT node")]
pub(crate) struct Opt {
    /// Configuration directory holding `nodes.dat`. Platform default when
    /// omitted.
    #[arg(long)]
    pub(crate) conf_dir: Option<PathBuf>,

    /// Address both the UDP and TCP sockets bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub(crate) bind_addr: IpAddr,

    /// Port both the UDP and TCP sockets bind to.
    #[arg(long, default_value_t = 22220)]
    pub(crate) bind_port: u16,

    /// Where the logs go: `stdout`, `stderr` or a file path.
    #[arg(long, default_value = "stdout")]
    pub(crate) log_output_dest: LogOutputDest,

    /// Maximum severity to log for the burrow crates.
    #[arg(long, default_value_t = Level::INFO)]
    pub(crate) log_level: Level,

    /// Log output format: `default` or `json`.
    #[arg(long, value_parser = parse_log_format)]
    pub(crate) log_format: Option<LogFormat>,

    /// Maximum number of connected TCP peers.
    #[arg(long, default_value_t = 8)]
    pub(crate) max_peers: usize,
}

fn parse_log_format(value: &str) -> std::result::Result<LogFormat, String> {
    match value {
        "default" => Ok(LogFormat::Default),
        "json" => Ok(LogFormat::Json),
        _ => Err(format!(
            "unknown log format {value:?}, expected `default` or `json`"
        )),
    }
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();

    let conf_dir = match &opt.conf_dir {
        Some(dir) => dir.clone(),
        None => dirs_next::config_dir()
            .ok_or_else(|| eyre!("could not determine the default config directory"))?
            .join("burrow"),
    };

    let _log_guard = log::init_logging(&opt)?;
    info!("Using config directory: {}", conf_dir.display());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        let mut driver = Driver::new(DriverConfig {
            conf_dir,
            bind_addr: opt.bind_addr,
            bind_port: opt.bind_port,
            max_peers: opt.max_peers,
        })
        .await?;
        driver.run().await?;
        Ok::<(), burrow_node::Error>(())
    })?;

    Ok(())
}
