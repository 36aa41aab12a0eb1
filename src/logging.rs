//! Replay-safe logging support.
//!
//! Orchestrator bodies buffer log entries on the context; the scheduler
//! flushes them through `tracing` only on turns that made progress, so a
//! replayed turn never re-emits messages from an earlier live turn.

/// Severity for buffered orchestration log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Flush buffered per-turn log entries into the tracing subscriber with
/// instance and turn metadata attached.
pub fn flush_turn_logs(instance: &str, turn_index: u64, logs: Vec<(LogLevel, String)>) {
    for (level, msg) in logs {
        match level {
            LogLevel::Debug => tracing::debug!(instance, turn_index, "{msg}"),
            LogLevel::Info => tracing::info!(instance, turn_index, "{msg}"),
            LogLevel::Warn => tracing::warn!(instance, turn_index, "{msg}"),
            LogLevel::Error => tracing::error!(instance, turn_index, "{msg}"),
        }
    }
}

/// Log from an orchestrator body without breaking replay: the entry is only
/// buffered when the current poll recorded new decisions.
#[macro_export]
macro_rules! durable_info {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.push_log($crate::LogLevel::Info, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_warn {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.push_log($crate::LogLevel::Warn, format!($($arg)+));
    }};
}

#[macro_export]
macro_rules! durable_error {
    ($ctx:expr, $($arg:tt)+) => {{
        $ctx.push_log($crate::LogLevel::Error, format!($($arg)+));
    }};
}
