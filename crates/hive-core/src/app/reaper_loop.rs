//! LeaseReaper - 期限切れ lease の定期回収
//!
//! 読み出し時の lazy expiry だけだと、誰も触らない期限切れ lease が
//! テーブルに残り続ける。reaper は一定間隔で sweep してこれを掃除する。

use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::lease::LeaseStore;

pub struct LeaseReaper {
    store: LeaseStore,
    interval: Duration,
}

impl LeaseReaper {
    pub fn new(store: LeaseStore, interval: Duration) -> Self {
        Self {
            store,
            interval: interval.max(Duration::from_millis(10)),
        }
    }

    /// `shutdown_rx` が true になるか送信側が drop されるまで回り続ける
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // 最初の tick は即時に返るので読み捨てる
        ticker.tick().await;
        debug!(interval_secs = self.interval.as_secs_f64(), "lease reaper started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                _ = ticker.tick() => {}
            }

            let removed = self.store.sweep_expired().await;
            if removed > 0 {
                info!(removed, "swept expired leases");
            }
        }
        debug!("lease reaper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::LeaseSettings;
    use crate::ports::FixedClock;
    use chrono::Utc;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn sweeps_on_interval_until_shutdown() {
        let clock = Arc::new(FixedClock::new(Utc::now()));
        let store = LeaseStore::with_clock(LeaseSettings::default(), clock.clone());
        store
            .claim("t1", "w1", Some(Duration::from_secs(1)), false)
            .await
            .unwrap();
        clock.advance(chrono::Duration::seconds(2));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(LeaseReaper::new(store.clone(), Duration::from_secs(60)).run(rx));

        tokio::time::sleep(Duration::from_secs(61)).await;
        // Already swept by the reaper.
        assert_eq!(store.sweep_expired().await, 0);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_when_sender_dropped() {
        let store = LeaseStore::new(LeaseSettings::default());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(LeaseReaper::new(store, Duration::from_secs(60)).run(rx));
        drop(tx);
        handle.await.unwrap();
    }
}
