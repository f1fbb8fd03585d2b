/// Admission Controller - token bucket in front of subprocess spawning
///
/// One instance is shared by every worker task in the process. It bounds the
/// rate of runtime launches independently of queue depth: a denied attempt
/// is handed back to the broker with a jittered delay instead of blocking a
/// worker slot.

use rand::Rng;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionConfig {
    /// Bucket capacity, i.e. the largest burst admitted at once
    pub burst: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
    /// Upper bound (exclusive) of the retry delay handed out on denial
    pub max_jitter: Duration,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            burst: 30,
            refill_per_sec: 10.0,
            max_jitter: Duration::from_secs(10),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
pub struct AdmissionController {
    config: AdmissionConfig,
    bucket: Mutex<Bucket>,
}

impl AdmissionController {
    /// The bucket starts full.
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            bucket: Mutex::new(Bucket {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available. Never blocks.
    pub fn try_admit(&self) -> bool {
        self.try_admit_at(Instant::now())
    }

    fn try_admit_at(&self, now: Instant) -> bool {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());

        if now > bucket.last_refill {
            let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
            bucket.tokens = (bucket.tokens + elapsed * self.config.refill_per_sec)
                .min(self.config.burst as f64);
            bucket.last_refill = now;
        }

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Delay for a denied attempt, uniform in `[0, max_jitter)`.
    pub fn backoff(&self) -> Duration {
        let max_ms = self.config.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
    }
}
