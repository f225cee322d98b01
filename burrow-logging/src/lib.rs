// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Logging setup shared by the Burrow binaries.
//!
//! Thin assembly over `tracing-subscriber`: one fmt layer to stdout, stderr
//! or a file, filtered by per-crate targets. The `BURROW_LOG` environment
//! variable overrides individual targets with `crate=level` pairs.

mod error;
mod layers;

use std::{
    fmt::{self, Display},
    path::PathBuf,
    str::FromStr,
};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, Registry};

pub use error::{Error, Result};
pub use tracing_appender::non_blocking::WorkerGuard as AppenderGuard;
use layers::TracingLayers;

/// Where the log output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutputDest {
    Stdout,
    Stderr,
    Path(PathBuf),
}

impl FromStr for LogOutputDest {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogOutputDest::Stdout),
            "stderr" => Ok(LogOutputDest::Stderr),
            other => Ok(LogOutputDest::Path(PathBuf::from(other))),
        }
    }
}

impl Display for LogOutputDest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogOutputDest::Stdout => write!(f, "stdout"),
            LogOutputDest::Stderr => write!(f, "stderr"),
            LogOutputDest::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

/// The format of the log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Default,
    Json,
}

/// Builds and installs the global tracing subscriber.
pub struct LogBuilder {
    default_targets: Vec<(String, Level)>,
    output_dest: LogOutputDest,
    format: LogFormat,
}

impl LogBuilder {
    /// `default_targets` are the per-crate levels used when `BURROW_LOG`
    /// does not override them.
    pub fn new(default_targets: Vec<(String, Level)>) -> Self {
        Self {
            default_targets,
            output_dest: LogOutputDest::Stdout,
            format: LogFormat::Default,
        }
    }

    pub fn output_dest(&mut self, dest: LogOutputDest) {
        self.output_dest = dest;
    }

    pub fn format(&mut self, format: LogFormat) {
        self.format = format;
    }

    /// Install the subscriber process-wide.
    ///
    /// The returned guard must be kept alive for the process lifetime when
    /// logging to a file; dropping it stops the background writer.
    pub fn initialize(self) -> Result<Option<WorkerGuard>> {
        let mut layers = TracingLayers::default();
        layers.fmt_layer(self.default_targets, &self.output_dest, self.format)?;

        let subscriber = Registry::default().with(layers.layers);
        tracing::subscriber::set_global_default(subscriber)?;
        Ok(layers.log_appender_guard)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_dest_parses_keywords_and_paths() {
        assert_eq!("stdout".parse::<LogOutputDest>(), Ok(LogOutputDest::Stdout));
        assert_eq!("stderr".parse::<LogOutputDest>(), Ok(LogOutputDest::Stderr));
        assert_eq!(
            "/var/log/burrow".parse::<LogOutputDest>(),
            Ok(LogOutputDest::Path(PathBuf::from("/var/log/burrow")))
        );
    }
}
