//! Translates a wall-clock timestamp into a block height.
//!
//! The time of a block is defined as the median of the 11 header
//! timestamps centred on it (5 before through 5 after). Header times are
//! only loosely ordered, but any window of 11 consecutive headers has
//! monotonic medians, and centring the window keeps our answer close to
//! the block time a public explorer displays. The search is a plain binary
//! search over that monotonic mapping.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::backend::{Backend, BlockResponse};
use crate::progress;

/// Binary-searches block headers for a target timestamp.
pub struct BlockFinder {
    backend: Arc<dyn Backend>,
    block_rx: mpsc::Receiver<BlockResponse>,
    // header timestamps seen so far; median windows overlap heavily
    cache: HashMap<u32, i64>,
}

impl BlockFinder {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        let block_rx = backend.block_responses();
        BlockFinder {
            backend,
            block_rx,
            cache: HashMap::new(),
        }
    }

    /// Find the greatest height whose median time is at or before `target`.
    /// Returns (height, median time, header time).
    pub async fn search(&mut self, target: DateTime<Utc>) -> (u32, DateTime<Utc>, DateTime<Utc>) {
        let target = target.timestamp();

        let mut lo = 10u32; // any small height above 5 works
        let mut lo_median = self.median_time(lo).await;
        // Stay below the tip: 6 for confirmations, 5 for the median window.
        let mut hi = self.backend.chain_height() - 11;
        let mut hi_median = self.median_time(hi).await;

        while hi - lo > 1 {
            let mid = (lo + hi) / 2;
            let mid_median = self.median_time(mid).await;
            progress!(
                "lo: {} {}, mid: {} {}, hi: {} {}, target: {}",
                lo,
                lo_median,
                mid,
                mid_median,
                hi,
                hi_median,
                target
            );

            if mid_median < lo_median || mid_median > hi_median {
                panic!("non-monotonic medians");
            }

            if target == mid_median {
                lo = mid;
                lo_median = mid_median;
                break;
            } else if target > mid_median {
                lo = mid;
                lo_median = mid_median;
            } else {
                hi = mid;
                hi_median = mid_median;
            }
        }

        let header_time = self.cache[&lo];

        // Gives a recording backend the chance to write its transcript.
        self.backend.finish();

        (
            lo,
            DateTime::from_timestamp(lo_median, 0).expect("median within range"),
            DateTime::from_timestamp(header_time, 0).expect("header time within range"),
        )
    }

    /// Median of the 11 header timestamps centred on `height`. Issues one
    /// request per uncached header and reads exactly that many responses,
    /// in whatever order they arrive.
    async fn median_time(&mut self, height: u32) -> i64 {
        let window: Vec<u32> = (height - 5..=height + 5).collect();

        let mut outstanding = 0;
        for h in &window {
            if !self.cache.contains_key(h) {
                self.backend.block_request(*h).await;
                outstanding += 1;
            }
        }
        for _ in 0..outstanding {
            let resp = self
                .block_rx
                .recv()
                .await
                .expect("block responses closed mid-search");
            self.cache.insert(resp.height, resp.timestamp.timestamp());
        }

        let mut timestamps: Vec<i64> = window.iter().map(|h| self.cache[h]).collect();
        timestamps.sort_unstable();
        timestamps[5]
    }
}
