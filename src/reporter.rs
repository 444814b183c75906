//! Progress reporting.
//!
//! A process-wide bag of counters that tracks how much work has been
//! scheduled vs completed while the backends are fetching data. Every
//! progress line is prefixed with a snapshot of the counters, so a stuck
//! run is diagnosable from the log alone.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::OnceLock;

use tracing::info;

/// Process-wide progress counters.
#[derive(Debug, Default)]
pub struct Reporter {
    addresses_scheduled: AtomicU32,
    addresses_fetched: AtomicU32,
    tx_scheduled: AtomicU32,
    tx_fetched: AtomicU32,
    tx_after_filter: AtomicI32,
    peers: AtomicI32,
}

static INSTANCE: OnceLock<Reporter> = OnceLock::new();

impl Reporter {
    /// The process-wide instance.
    pub fn global() -> &'static Reporter {
        INSTANCE.get_or_init(Reporter::default)
    }

    /// Emit one progress line, prefixed with the counter snapshot:
    /// `addresses scheduled/fetched txs scheduled/fetched peers: msg`.
    pub fn log(&self, msg: &str) {
        info!(
            "{}/{} {}/{} {}: {}",
            self.addresses_scheduled(),
            self.addresses_fetched(),
            self.tx_scheduled(),
            self.tx_fetched(),
            self.peers(),
            msg
        );
    }

    pub fn logf(&self, args: std::fmt::Arguments<'_>) {
        self.log(&args.to_string());
    }

    pub fn inc_addresses_scheduled(&self) {
        self.addresses_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn addresses_scheduled(&self) -> u32 {
        self.addresses_scheduled.load(Ordering::Relaxed)
    }

    pub fn inc_addresses_fetched(&self) {
        self.addresses_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn addresses_fetched(&self) -> u32 {
        self.addresses_fetched.load(Ordering::Relaxed)
    }

    pub fn inc_tx_scheduled(&self) {
        self.tx_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_scheduled(&self) -> u32 {
        self.tx_scheduled.load(Ordering::Relaxed)
    }

    pub fn inc_tx_fetched(&self) {
        self.tx_fetched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn tx_fetched(&self) -> u32 {
        self.tx_fetched.load(Ordering::Relaxed)
    }

    pub fn set_tx_after_filter(&self, n: i32) {
        self.tx_after_filter.store(n, Ordering::Relaxed);
    }

    pub fn set_peers(&self, n: i32) {
        self.peers.store(n, Ordering::Relaxed);
    }

    pub fn peers(&self) -> i32 {
        self.peers.load(Ordering::Relaxed)
    }
}

/// Log one progress line through the global reporter.
#[macro_export]
macro_rules! progress {
    ($($arg:tt)*) => {
        $crate::reporter::Reporter::global().logf(format_args!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let r = Reporter::default();
        r.inc_addresses_scheduled();
        r.inc_addresses_scheduled();
        r.inc_addresses_fetched();
        r.inc_tx_scheduled();
        r.inc_tx_fetched();
        r.set_peers(3);

        assert_eq!(r.addresses_scheduled(), 2);
        assert_eq!(r.addresses_fetched(), 1);
        assert_eq!(r.tx_scheduled(), 1);
        assert_eq!(r.tx_fetched(), 1);
        assert_eq!(r.peers(), 3);
    }
}
