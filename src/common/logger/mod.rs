use std::{fs, path::Path, sync::OnceLock};

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

pub mod formatter;
pub mod writer;

pub use formatter::*;
pub use writer::*;

use crate::configs::Config;

pub(crate) static GLOBAL_FILE_WRITER: OnceLock<CircularFileWriter> = OnceLock::new();

/// Prints to stdout and mirrors the line into the log file, if one is open.
#[macro_export]
macro_rules! log_println {
    () => {{
        std::println!();
        $crate::common::logger::append_to_file_raw("\n");
    }};
    ($($arg:tt)*) => {{
        let msg = format!($($arg)*);
        std::println!("{}", msg);
        $crate::common::logger::append_to_file_raw(&format!("{}\n", msg));
    }};
}

pub fn append_to_file_raw(msg: &str) {
    if let Some(mut writer) = GLOBAL_FILE_WRITER.get().cloned() {
        use std::io::Write;
        let clean_msg = strip_ansi_escapes(msg);
        let _ = writer.write_all(clean_msg.as_bytes());
    }
}

/// Builds the directive string handed to `EnvFilter`. The websocket and
/// http stacks are noisy at debug, so they are pinned to `warn` unless the
/// configured filters say otherwise.
pub fn filter_directives(level: Option<&str>, filters: Option<&str>) -> String {
    let level = level.unwrap_or("info");
    match filters {
        Some(extra) if !extra.trim().is_empty() => {
            format!("{},tungstenite=warn,hyper=warn,{}", level, extra.trim())
        }
        _ => format!("{},tungstenite=warn,hyper=warn", level),
    }
}

pub fn init(config: &Config) {
    let logging = config.logging.as_ref();
    let filter_str = filter_directives(
        logging.and_then(|l| l.level.as_deref()),
        logging.and_then(|l| l.filters.as_deref()),
    );

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    let stdout_layer = fmt::layer()
        .event_format(PartyFormatter::new(true))
        .with_ansi(true);

    let file_layer = logging.and_then(|l| l.file.as_ref()).map(|file_config| {
        if let Some(parent) = Path::new(&file_config.path).parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                eprintln!("Failed to create log directory: {}", e);
            }
        }

        let writer = CircularFileWriter::new(file_config.path.clone(), file_config.max_lines);
        let _ = GLOBAL_FILE_WRITER.set(writer.clone());
        fmt::layer()
            .with_writer(writer)
            .event_format(PartyFormatter::new(false))
            .with_ansi(false)
    });

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_default_to_info() {
        assert_eq!(
            filter_directives(None, None),
            "info,tungstenite=warn,hyper=warn"
        );
    }

    #[test]
    fn directives_append_extra_filters() {
        assert_eq!(
            filter_directives(Some("debug"), Some(" partyline::presence=trace ")),
            "debug,tungstenite=warn,hyper=warn,partyline::presence=trace"
        );
        assert_eq!(
            filter_directives(Some("warn"), Some("   ")),
            "warn,tungstenite=warn,hyper=warn"
        );
    }
}
