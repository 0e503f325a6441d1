// Copyright (c) Kyutai, all rights reserved.
// This source code is licensed under the license found in the
// LICENSE file in the root directory of this source tree.

//! Console logging setup: a `PrettyFormatter` and `LogStyle` trimmed to
//! the console-only slice a library crate needs. A daemon embedding
//! `runner-core` owns its own file rotation and CLI parsing, so `init`
//! only wires stdout.

use owo_colors::OwoColorize;
use std::fmt;
use std::io::IsTerminal;
use std::str::FromStr;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::time::{ChronoLocal, FormatTime};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogStyle {
    Compact,
    #[default]
    Pretty,
    Verbose,
}

impl FromStr for LogStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(LogStyle::Compact),
            "pretty" => Ok(LogStyle::Pretty),
            "verbose" => Ok(LogStyle::Verbose),
            _ => Err(format!("invalid log style '{s}', expected compact, pretty, or verbose")),
        }
    }
}

mod icons {
    pub const TRACE: &str = "·";
    pub const DEBUG: &str = "●";
    pub const INFO: &str = "✓";
    pub const WARN: &str = "⚠";
    pub const ERROR: &str = "✕";
}

fn format_level_icon(level: Level) -> &'static str {
    match level {
        Level::TRACE => icons::TRACE,
        Level::DEBUG => icons::DEBUG,
        Level::INFO => icons::INFO,
        Level::WARN => icons::WARN,
        Level::ERROR => icons::ERROR,
    }
}

/// Event formatter with level icons, used for `LogStyle::Pretty` and
/// `LogStyle::Verbose`.
pub struct PrettyFormatter<T> {
    timer: T,
    use_ansi: bool,
    show_file: bool,
    show_target: bool,
    style: LogStyle,
}

impl<T> PrettyFormatter<T> {
    pub fn new(timer: T) -> Self {
        Self {
            timer,
            use_ansi: std::io::stdout().is_terminal(),
            show_file: false,
            show_target: true,
            style: LogStyle::Pretty,
        }
    }

    pub fn with_ansi(mut self, use_ansi: bool) -> Self {
        self.use_ansi = use_ansi;
        self
    }

    pub fn with_style(mut self, style: LogStyle) -> Self {
        self.style = style;
        if style == LogStyle::Verbose {
            self.show_file = true;
        }
        self
    }
}

impl<S, N, T> FormatEvent<S, N> for PrettyFormatter<T>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    T: FormatTime,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let level = *meta.level();

        self.timer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let icon = format_level_icon(level);
        let level_str = match level {
            Level::TRACE => "TRACE",
            Level::DEBUG => "DEBUG",
            Level::INFO => "INFO",
            Level::WARN => "WARN",
            Level::ERROR => "ERROR",
        };
        if self.use_ansi {
            match level {
                Level::TRACE => write!(writer, "{}", format!("{icon} {level_str}").dimmed())?,
                Level::DEBUG => write!(writer, "{}", format!("{icon} {level_str}").blue())?,
                Level::INFO => write!(writer, "{}", format!("{icon} {level_str}").green())?,
                Level::WARN => write!(writer, "{}", format!("{icon} {level_str}").yellow())?,
                Level::ERROR => write!(writer, "{}", format!("{icon} {level_str}").red().bold())?,
            }
        } else {
            write!(writer, "{icon} {level_str}")?;
        }

        if self.show_target && self.style != LogStyle::Compact {
            let target = meta.target();
            if self.use_ansi {
                write!(writer, " {}", target.dimmed())?;
            } else {
                write!(writer, " {target}")?;
            }
        }

        if self.show_file {
            if let (Some(file), Some(line)) = (meta.file(), meta.line()) {
                let short_file = file.rsplit('/').next().unwrap_or(file);
                if self.use_ansi {
                    write!(writer, " {}", format!("{short_file}:{line}").dimmed())?;
                } else {
                    write!(writer, " {short_file}:{line}")?;
                }
            }
        }

        write!(writer, " ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Initializes a global stdout subscriber. `level` parses as a
/// `tracing_subscriber` filter directive (e.g. `"info"`, `"runner_core=debug"`);
/// `json` takes precedence over `style` when both request structured output.
pub fn init(level: &str, style: LogStyle, json: bool) -> anyhow::Result<()> {
    let filter = tracing_subscriber::filter::EnvFilter::try_new(level)?;
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.3f".to_string());

    if json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_timer(timer)
            .with_file(true)
            .with_line_number(true)
            .with_target(true);
        tracing_subscriber::registry().with(filter).with(layer).init();
    } else {
        let use_ansi = std::io::stdout().is_terminal();
        let show_file = style == LogStyle::Verbose;
        let formatter =
            PrettyFormatter::new(timer).with_ansi(use_ansi).with_style(style);
        let layer = tracing_subscriber::fmt::layer().event_format(formatter).with_ansi(use_ansi);
        let _ = show_file;
        tracing_subscriber::registry().with(filter).with(layer).init();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_style_from_str_accepts_known_values_case_insensitively() {
        assert_eq!(LogStyle::from_str("compact").unwrap(), LogStyle::Compact);
        assert_eq!(LogStyle::from_str("Pretty").unwrap(), LogStyle::Pretty);
        assert_eq!(LogStyle::from_str("VERBOSE").unwrap(), LogStyle::Verbose);
        assert!(LogStyle::from_str("loud").is_err());
    }

    #[test]
    fn level_icons_are_distinct() {
        assert_ne!(format_level_icon(Level::INFO), format_level_icon(Level::ERROR));
        assert_ne!(format_level_icon(Level::WARN), format_level_icon(Level::DEBUG));
    }
}
