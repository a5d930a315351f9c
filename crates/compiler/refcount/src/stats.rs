use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static US_REFCOUNTING: AtomicU64 = AtomicU64::new(0);

/// Wall-clock microseconds spent inserting refcounts, accumulated across
/// every function compiled by this process.
pub fn us_compiling_irgen_refcounting() -> u64 {
    US_REFCOUNTING.load(Ordering::Relaxed)
}

pub(crate) struct PassTimer {
    started: Instant,
}

impl PassTimer {
    pub(crate) fn start() -> Self {
        PassTimer {
            started: Instant::now(),
        }
    }

    pub(crate) fn finish(self, func_name: &str) {
        let us = self.started.elapsed().as_micros() as u64;
        let total = US_REFCOUNTING.fetch_add(us, Ordering::Relaxed) + us;
        pylon_tracing::debug!(
            function = func_name,
            us,
            total,
            "us_compiling_irgen_refcounting"
        );
    }
}
