//! Log-service contract used while streaming build output.

use super::ServiceFuture;

/// A single log event emitted by a build execution.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogEvent {
    /// Event timestamp, milliseconds since the epoch.
    pub timestamp_ms: i64,
    /// Raw event message, possibly carrying a trailing newline.
    pub message: String,
}

/// A batch of log events fetched from a stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LogBatch {
    /// Events in non-decreasing timestamp order.
    pub events: Vec<LogEvent>,
    /// Timestamp of the last event in the batch, used for incremental
    /// paging; absent when the batch is empty.
    pub last_timestamp_ms: Option<i64>,
}

/// Minimal log-service interface required by the dispatch core.
pub trait LogService: Send + Sync {
    /// Resolves the newest stream in `group` whose name starts with
    /// `prefix`.
    ///
    /// Returns `None` while the stream has not been created yet, an
    /// expected transient condition during build startup.
    fn stream_name_by_prefix<'a>(
        &'a self,
        group: &'a str,
        prefix: &'a str,
    ) -> ServiceFuture<'a, Option<String>>;

    /// Fetches events from `stream`, restricted to timestamps at or after
    /// `start_time_ms` when provided.
    fn log_events<'a>(
        &'a self,
        group: &'a str,
        stream: &'a str,
        start_time_ms: Option<i64>,
    ) -> ServiceFuture<'a, LogBatch>;
}
