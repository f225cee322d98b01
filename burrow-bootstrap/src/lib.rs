// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Bootstrap node persistence for the Burrow node.
//!
//! A single `nodes.dat` file in the configuration directory holds the
//! addresses of previously known DHT nodes. At startup they become the
//! targets of one-shot pings; at shutdown the node writes its current
//! routing-table addresses back so the next run can rejoin the overlay.
//!
//! A missing file is not an error: the node then runs with an empty
//! routing table and waits for inbound traffic. A file that exists but
//! cannot be parsed is.

#[macro_use]
extern crate tracing;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the persisted bootstrap file inside the config directory.
pub const NODES_FILE_NAME: &str = "nodes.dat";

/// At most this many addresses are honoured on load and written on save.
pub const MAX_BOOTSTRAP_NODES: usize = 64;

const NODES_FILE_VERSION: u32 = 1;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse bootstrap file {path:?}: {source}")]
    FailedToParseNodesFile {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// On-disk shape of `nodes.dat`.
#[derive(Debug, Serialize, Deserialize)]
struct NodesFileData {
    version: u32,
    nodes: Vec<String>,
}

/// Loads and saves the bootstrap node addresses.
#[derive(Debug, Clone)]
pub struct BootstrapStore {
    conf_dir: PathBuf,
}

impl BootstrapStore {
    pub fn new(conf_dir: impl Into<PathBuf>) -> Self {
        Self {
            conf_dir: conf_dir.into(),
        }
    }

    pub fn nodes_file_path(&self) -> PathBuf {
        self.conf_dir.join(NODES_FILE_NAME)
    }

    /// Read the bootstrap addresses.
    ///
    /// A missing file yields an empty list with a warning. Entries that do
    /// not parse as socket addresses are skipped with a warning. Anything
    /// beyond [`MAX_BOOTSTRAP_NODES`] is dropped.
    pub fn load(&self) -> Result<Vec<SocketAddr>> {
        let path = self.nodes_file_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!("Bootstrap file {} not readable.", path.display());
                return Ok(Vec::new());
            }
            Err(err) => return Err(err.into()),
        };

        let data: NodesFileData = serde_json::from_str(&contents)
            .map_err(|source| Error::FailedToParseNodesFile { path, source })?;
        if data.version != NODES_FILE_VERSION {
            warn!(
                "Bootstrap file version {} unknown, reading it anyway.",
                data.version
            );
        }

        let mut addrs = Vec::new();
        for entry in data.nodes {
            match entry.parse::<SocketAddr>() {
                Ok(addr) => addrs.push(addr),
                Err(_) => warn!("Skipping malformed bootstrap address {entry:?}."),
            }
            if addrs.len() == MAX_BOOTSTRAP_NODES {
                break;
            }
        }
        debug!("{} bootstrap nodes loaded from {}.", addrs.len(), self.conf_dir.display());
        Ok(addrs)
    }

    /// Persist node addresses, creating the config directory if needed.
    ///
    /// Writes go to a temporary sibling first so a crash never leaves a
    /// half-written `nodes.dat` behind.
    pub fn save(&self, addrs: &[SocketAddr]) -> Result<()> {
        fs::create_dir_all(&self.conf_dir)?;

        let data = NodesFileData {
            version: NODES_FILE_VERSION,
            nodes: addrs
                .iter()
                .take(MAX_BOOTSTRAP_NODES)
                .map(|addr| addr.to_string())
                .collect(),
        };
        let contents = serde_json::to_string_pretty(&data)
            .map_err(|source| Error::FailedToParseNodesFile {
                path: self.nodes_file_path(),
                source,
            })?;

        let tmp_path = self.conf_dir.join(format!("{NODES_FILE_NAME}.tmp"));
        write_atomically(&tmp_path, &self.nodes_file_path(), &contents)?;
        info!(
            "{} node addresses saved to {}.",
            data.nodes.len(),
            self.nodes_file_path().display()
        );
        Ok(())
    }
}

fn write_atomically(tmp_path: &Path, final_path: &Path, contents: &str) -> std::io::Result<()> {
    fs::write(tmp_path, contents)?;
    fs::rename(tmp_path, final_path)
}

