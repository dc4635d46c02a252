use chrono::{DateTime, Duration, Utc};

/// Neighbor cache entry TTL (§3).
pub const ARP_TIMEOUT: i64 = 600;

/// How long ago, in seconds, a timestamp is from now.
pub fn get_elapsed_time(since: DateTime<Utc>) -> Duration {
    Utc::now().signed_duration_since(since)
}

/// True if a neighbor cache entry installed at `installed_at` is still
/// within its TTL (§3 invariant: entries older than TTL are absent).
pub fn is_fresh(installed_at: DateTime<Utc>) -> bool {
    get_elapsed_time(installed_at) < Duration::seconds(ARP_TIMEOUT)
}
