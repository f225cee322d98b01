// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

use std::collections::BTreeMap;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_core::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::Targets,
    fmt::{
        self as tracing_fmt,
        format::Writer,
        time::{FormatTime, SystemTime},
        FmtContext, FormatEvent, FormatFields,
    },
    registry::LookupSpan,
    Layer, Registry,
};

use crate::{error::Result, LogFormat, LogOutputDest};

/// Environment variable holding `crate=level` overrides.
const LOG_ENV_OVERRIDES: &str = "BURROW_LOG";

/// Tracing log formatter setup for easier span viewing.
#[derive(Default)]
pub(crate) struct LogFormatter;

impl<S, N> FormatEvent<S, N> for LogFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let level = *event.metadata().level();
        let module = event.metadata().module_path().unwrap_or("<unknown module>");
        let lno = event.metadata().line().unwrap_or(0);
        let time = SystemTime;

        write!(writer, "[")?;
        time.format_time(&mut writer)?;
        write!(writer, " {level} {module} {lno}")?;
        ctx.visit_spans(|span| write!(writer, "/{}", span.name()))?;
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// The different Subscribers composed into a list of layers.
#[derive(Default)]
pub(crate) struct TracingLayers {
    pub(crate) layers: Vec<Box<dyn Layer<Registry> + Send + Sync>>,
    pub(crate) log_appender_guard: Option<WorkerGuard>,
}

impl TracingLayers {
    pub(crate) fn fmt_layer(
        &mut self,
        default_targets: Vec<(String, Level)>,
        output_dest: &LogOutputDest,
        format: LogFormat,
    ) -> Result<()> {
        let layer = match output_dest {
            LogOutputDest::Stdout => tracing_fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .event_format(LogFormatter)
                .boxed(),
            LogOutputDest::Stderr => tracing_fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .event_format(LogFormatter)
                .with_writer(std::io::stderr)
                .boxed(),
            LogOutputDest::Path(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                let (writer, guard) = tracing_appender::non_blocking(file);
                self.log_appender_guard = Some(guard);

                match format {
                    LogFormat::Json => tracing_fmt::layer()
                        .json()
                        .flatten_event(true)
                        .with_writer(writer)
                        .boxed(),
                    LogFormat::Default => tracing_fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer)
                        .event_format(LogFormatter)
                        .boxed(),
                }
            }
        };

        let env_overrides = std::env::var(LOG_ENV_OVERRIDES).ok();
        let targets = logging_targets(env_overrides.as_deref(), default_targets);
        let layer = layer.with_filter(Targets::new().with_targets(targets));
        self.layers.push(Box::new(layer));

        Ok(())
    }
}

/// Application defaults with `BURROW_LOG` `crate=level` pairs applied on
/// top. Invalid entries are silently skipped.
fn logging_targets(
    env_value: Option<&str>,
    default_targets: Vec<(String, Level)>,
) -> Vec<(String, Level)> {
    let mut targets: BTreeMap<String, Level> = BTreeMap::from_iter(default_targets);

    if let Some(value) = env_value {
        for part in value.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut split = trimmed.split('=');
            let Some(crate_name) = split.next().filter(|name| !name.is_empty()) else {
                continue;
            };
            let log_level = split.next().unwrap_or("trace");
            if let Some(level) = parse_log_level(log_level) {
                targets.insert(crate_name.to_string(), level);
            }
        }
    }

    targets.into_iter().collect()
}

fn parse_log_level(log_level: &str) -> Option<Level> {
    match log_level.to_lowercase().as_str() {
        "info" | "i" => Some(Level::INFO),
        "debug" | "d" => Some(Level::DEBUG),
        "trace" | "t" => Some(Level::TRACE),
        "warn" | "w" => Some(Level::WARN),
        "error" | "e" => Some(Level::ERROR),
        _ => None,
    }
}
