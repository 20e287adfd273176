use tokio::time::{Duration, Instant};

const NUM_BUCKETS: usize = 8;

/// Counts events over a sliding window of time.
///
/// Used as the per-block demand signal: the pool worker records acquire
/// misses here and the rebalancer reads the windowed sum, so one burst a
/// minute ago doesn't look like sustained demand. The worker task is the
/// only writer, which keeps this a plain struct with no interior locking.
#[derive(Debug)]
pub(crate) struct WindowedCounter {
    /// The instant the counter was created; bucket epochs are measured
    /// from here.
    anchor: Instant,

    /// Fraction of the window covered by one bucket.
    bucket_width: Duration,

    /// Monotonic index of the bucket currently accepting writes.
    head: u64,

    buckets: [u64; NUM_BUCKETS],
}

impl WindowedCounter {
    pub(crate) fn new(window: Duration) -> Self {
        let bucket_width = (window / NUM_BUCKETS as u32).max(Duration::from_millis(1));
        Self {
            anchor: Instant::now(),
            bucket_width,
            head: 0,
            buckets: [0; NUM_BUCKETS],
        }
    }

    pub(crate) fn add(&mut self, amount: u64) {
        self.roll();
        self.buckets[(self.head % NUM_BUCKETS as u64) as usize] += amount;
    }

    pub(crate) fn sum(&mut self) -> u64 {
        self.roll();
        self.buckets.iter().sum()
    }

    // Zero out any buckets that have fallen outside the window.
    fn roll(&mut self) {
        let epoch = (self.anchor.elapsed().as_nanos() / self.bucket_width.as_nanos()) as u64;
        if epoch <= self.head {
            return;
        }
        let steps = (epoch - self.head).min(NUM_BUCKETS as u64);
        for i in 1..=steps {
            self.buckets[((self.head + i) % NUM_BUCKETS as u64) as usize] = 0;
        }
        self.head = epoch;
    }
}
