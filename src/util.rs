//! Small helpers shared by the responder and the proactive fetcher.

/// Current UNIX time in whole seconds, the unit every timestamp in
/// `CacheEntry`/`ProactiveFetchTimestamp` is stored in (spec.md §3).
pub fn now_unix() -> i64 {
    jiff::Timestamp::now().as_second()
}
