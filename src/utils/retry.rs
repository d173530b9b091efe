//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff between failed pulls of a receive loop.
///
/// - Min delay: 100ms
/// - Max delay: `max_delay`
/// - Unbounded attempts
/// - Jitter enabled
pub fn pull_backoff(max_delay: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(max_delay)
        .without_max_times()
        .with_jitter()
}
