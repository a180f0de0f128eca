//! Logger initialization for the gateway

use jiff::{Zoned, tz::TimeZone};
use logforth::{append::Stderr, filter::EnvFilter, layout::Layout};
use std::{fmt::Write, io::IsTerminal, str::FromStr};

/// Formats records with a UTC timestamp and the level, colored on terminals.
#[derive(Debug)]
struct UtcLayout {
    no_color: bool,
}

impl UtcLayout {
    fn new() -> Self {
        Self { no_color: false }
    }

    fn no_color(mut self) -> Self {
        self.no_color = true;
        self
    }
}

impl Layout for UtcLayout {
    fn format(
        &self,
        record: &log::Record<'_>,
        _diagnostics: &[Box<dyn logforth::diagnostic::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let mut output = String::new();

        let now = Zoned::now().with_time_zone(TimeZone::UTC);
        write!(output, "{} ", now.strftime("%Y-%m-%dT%H:%M:%S%.6fZ"))?;

        let level_str = if self.no_color {
            format!("{:>5}", record.level())
        } else {
            match record.level() {
                log::Level::Error => format!("\x1b[31m{:>5}\x1b[0m", record.level()),
                log::Level::Warn => format!("\x1b[33m{:>5}\x1b[0m", record.level()),
                log::Level::Info => format!("\x1b[32m{:>5}\x1b[0m", record.level()),
                log::Level::Debug => format!("\x1b[34m{:>5}\x1b[0m", record.level()),
                log::Level::Trace => format!("\x1b[35m{:>5}\x1b[0m", record.level()),
            }
        };

        write!(output, "{level_str}  {}", record.args())?;

        Ok(output.into_bytes())
    }
}

/// Install the stderr logger.
/// The log_filter should be a string like "info" or "llm=debug,server=info".
pub fn init(log_filter: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::from_str(log_filter).map_err(|e| anyhow::anyhow!("invalid log filter '{log_filter}': {e}"))?;

    let layout = if std::io::stderr().is_terminal() {
        UtcLayout::new()
    } else {
        UtcLayout::new().no_color()
    };

    logforth::builder()
        .dispatch(move |d| d.filter(filter).append(Stderr::default().with_layout(layout)))
        .apply();

    Ok(())
}
