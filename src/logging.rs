//! Logging setup for the node executable.
//!
//! Stderr is the node's log channel: the launching parent reads it line by
//! line and folds it into its own log, so the default format is a bare,
//! single-line one. When stderr is a terminal (a node run by hand for
//! debugging), lines are colorized by level. A detailed rolling file log
//! can be added alongside.

use colored::Colorize;
use std::fmt;
use std::io::IsTerminal;
use tracing::{Event, Level, Subscriber};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Formats each event as one line, colored by level, with an explicit
/// marker for warnings and errors so they stay identifiable once the
/// parent strips the color codes.
pub struct LevelColorFormatter;

impl<S, N> FormatEvent<S, N> for LevelColorFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        // Buffer the fields so color applies to the whole line.
        let mut buffer = String::new();
        let mut buf_writer = Writer::new(&mut buffer);
        ctx.format_fields(buf_writer.by_ref(), event)?;

        let line = match *event.metadata().level() {
            Level::ERROR => format!("error: {}", buffer).red(),
            Level::WARN => format!("warning: {}", buffer).yellow(),
            Level::INFO => buffer.normal(),
            Level::DEBUG => buffer.blue(),
            Level::TRACE => buffer.purple(),
        };
        writeln!(writer, "{}", line)
    }
}

/// Initialize tracing for a node process: stderr always, a rolling file log
/// when `log_file` is set. The returned guard must live as long as the
/// process for file logging to flush.
pub fn init(verbose: u8, log_file: Option<&str>) -> Option<WorkerGuard> {
    let level = match verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    let stderr_layer = if std::io::stderr().is_terminal() {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .event_format(LevelColorFormatter)
            .with_filter(level)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .with_filter(level)
            .boxed()
    };

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let p = std::path::Path::new(path);
            let dir = p.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = p
                .file_name()
                .unwrap_or_else(|| std::ffi::OsStr::new("antler-node.log"));
            let appender = tracing_appender::rolling::daily(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(level)
                .boxed();
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();

    guard
}
