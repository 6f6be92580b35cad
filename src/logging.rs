use std::fs::OpenOptions;
use std::sync::{Once, OnceLock};

use slog::Drain;

/// Resolve the log level from `RUST_LOG`, falling back to `default`.
///
/// Only the level words are honoured; per-target filters are not supported.
fn level_from_env(default: log::LevelFilter) -> log::LevelFilter {
    match std::env::var("RUST_LOG") {
        Ok(value) => parse_level(&value).unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_level(value: &str) -> Option<log::LevelFilter> {
    let lower = value.to_ascii_lowercase();
    let level = if lower.contains("trace") {
        log::LevelFilter::Trace
    } else if lower.contains("debug") {
        log::LevelFilter::Debug
    } else if lower.contains("info") {
        log::LevelFilter::Info
    } else if lower.contains("warn") {
        log::LevelFilter::Warn
    } else if lower.contains("error") {
        log::LevelFilter::Error
    } else if lower.contains("off") {
        log::LevelFilter::Off
    } else {
        return None;
    };
    Some(level)
}

fn default_level(verbose: bool) -> log::LevelFilter {
    if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    }
}

fn install(logger: slog::Logger, level: log::LevelFilter) {
    static GUARD: OnceLock<slog_scope::GlobalLoggerGuard> = OnceLock::new();
    static STDLOG: Once = Once::new();

    if GUARD.get().is_none() {
        let _ = GUARD.set(slog_scope::set_global_logger(logger));
    }
    STDLOG.call_once(|| {
        let _ = slog_stdlog::init();
    });
    log::set_max_level(level);
}

/// Log to stderr with the compact terminal format.
pub fn init_terminal(verbose: bool) {
    let level = level_from_env(default_level(verbose));
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::CompactFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    install(slog::Logger::root(drain, slog::o!("app" => "tunwire")), level);
}

/// Append plain-text log lines to `path`.
pub fn init_file(path: &str, verbose: bool) -> anyhow::Result<()> {
    let level = level_from_env(default_level(verbose));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let decorator = slog_term::PlainDecorator::new(file);
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain)
        .overflow_strategy(slog_async::OverflowStrategy::Block)
        .build()
        .fuse();
    install(slog::Logger::root(drain, slog::o!("app" => "tunwire")), level);
    Ok(())
}
