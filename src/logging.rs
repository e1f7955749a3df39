//! Daemon logging setup.
//!
//! `log_file_name` is either "stderr" or a path; `log_level` maps the config
//! verbosity (-1 disables INFO and below, 0..=2 raise verbosity) onto tracing
//! levels. Errors always log.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use tracing::level_filters::LevelFilter;

pub fn level_filter(log_level: i32) -> LevelFilter {
    match log_level {
        i32::MIN..=-1 => LevelFilter::WARN,
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global tracing subscriber.
pub fn init(log_file_name: &str, log_level: i32) -> io::Result<()> {
    let filter = level_filter(log_level);

    if log_file_name.is_empty() || log_file_name == "stderr" {
        tracing_subscriber::fmt()
            .with_max_level(filter)
            .with_writer(io::stderr)
            .with_target(false)
            .init();
        return Ok(());
    }

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(Path::new(log_file_name))?;
    tracing_subscriber::fmt()
        .with_max_level(filter)
        .with_writer(std::sync::Arc::new(file))
        .with_ansi(false)
        .with_target(false)
        .init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_mapping() {
        assert_eq!(level_filter(-1), LevelFilter::WARN);
        assert_eq!(level_filter(0), LevelFilter::INFO);
        assert_eq!(level_filter(1), LevelFilter::DEBUG);
        assert_eq!(level_filter(2), LevelFilter::TRACE);
    }
}
