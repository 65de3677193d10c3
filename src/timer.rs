use crate::timestamp::Timestamp;

pub type TimerCallback = Box<dyn FnMut() + Send>;

/// A single scheduled callback. `sequence` is a process-wide monotone
/// counter used as the tie-break for timers sharing an `expiration` and as
/// the identity key for cancellation — a safe-Rust stand-in for the C++
/// original's reliance on raw `Timer*` pointer identity (§9).
pub struct Timer {
    pub callback: TimerCallback,
    pub expiration: Timestamp,
    pub interval_micros: i64,
    pub sequence: u64,
}

impl Timer {
    pub fn new(callback: TimerCallback, expiration: Timestamp, interval_micros: i64, sequence: u64) -> Timer {
        Timer {
            callback,
            expiration,
            interval_micros,
            sequence,
        }
    }

    pub fn is_repeat(&self) -> bool {
        self.interval_micros > 0
    }

    pub fn restart(&mut self, now: Timestamp) {
        self.expiration = now.add_seconds(self.interval_micros as f64 / 1_000_000.0);
    }

    pub fn run(&mut self) {
        (self.callback)();
    }
}
