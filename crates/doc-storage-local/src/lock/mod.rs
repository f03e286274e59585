mod file;
mod memory;
mod postgres;

pub use file::FileLock;
pub use memory::MemoryLocker;
pub use postgres::PgLocker;

/// Expiry of a lock taken now for `ttl`, in milliseconds since the epoch.
pub(crate) fn expiry_millis(ttl: std::time::Duration) -> i64 {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    chrono::Utc::now().timestamp_millis().saturating_add(ttl_ms)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_expiry_saturates_on_huge_ttl() {
        assert_eq!(expiry_millis(Duration::from_secs(u64::MAX)), i64::MAX);
        assert_eq!(expiry_millis(Duration::from_millis(i64::MAX as u64)), i64::MAX);

        let now = chrono::Utc::now().timestamp_millis();
        let soon = expiry_millis(Duration::from_secs(60));
        assert!(soon >= now + 60_000 && soon < now + 120_000);
    }
}
