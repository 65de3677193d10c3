use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch, monotonic enough for timer math.
///
/// `Timestamp::invalid()` (value `0`) marks a timer that has fired and is
/// not a repeat, or a timestamp that was never set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(i64);

pub const MICROSECONDS_PER_SECOND: i64 = 1_000_000;

impl Timestamp {
    pub const fn invalid() -> Timestamp {
        Timestamp(0)
    }

    pub const fn from_micros(micros: i64) -> Timestamp {
        Timestamp(micros)
    }

    pub fn now() -> Timestamp {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch");
        Timestamp(d.as_micros() as i64)
    }

    pub fn is_valid(&self) -> bool {
        self.0 > 0
    }

    pub fn micros_since_epoch(&self) -> i64 {
        self.0
    }

    /// Returns `self + seconds`, where `seconds` may be fractional.
    pub fn add_seconds(&self, seconds: f64) -> Timestamp {
        let delta = (seconds * MICROSECONDS_PER_SECOND as f64) as i64;
        Timestamp(self.0 + delta)
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{:06}",
            self.0 / MICROSECONDS_PER_SECOND,
            self.0 % MICROSECONDS_PER_SECOND
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_is_not_valid() {
        assert!(!Timestamp::invalid().is_valid());
    }

    #[test]
    fn now_is_valid_and_increasing() {
        let a = Timestamp::now();
        std::thread::sleep(std::time::Duration::from_millis(1));
        let b = Timestamp::now();
        assert!(a.is_valid());
        assert!(b > a);
    }

    #[test]
    fn add_seconds_moves_forward() {
        let a = Timestamp::from_micros(1_000_000);
        let b = a.add_seconds(1.5);
        assert_eq!(b.micros_since_epoch(), 2_500_000);
    }
}
