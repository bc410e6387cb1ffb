use chrono::{DateTime, TimeZone, Utc};

/// Server wall clock in Unix-epoch milliseconds.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// `None` when `ms` is outside chrono's representable range.
pub fn to_datetime(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

#[cfg(test)]
pub use manual::ManualClock;


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_datetime_never_substitutes() {
        assert_eq!(to_datetime(1_760_000_000_000).map(|d| d.timestamp_millis()), Some(1_760_000_000_000));
        assert_eq!(to_datetime(crate::envelope::MAX_SENT_AT_MS).map(|d| d.timestamp_millis()), Some(crate::envelope::MAX_SENT_AT_MS));
        assert!(to_datetime(10_000_000_000_000_000).is_none());
    }
}
