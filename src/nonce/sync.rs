//! Periodic nonce resynchronization against the node
//!
//! Every period, each cached address is refreshed from the node's pending
//! nonce. A query that keeps failing until its backoff gives up is fatal:
//! running on with stale nonces would only produce rejected or conflicting
//! actions.

use super::NonceCache;
use crate::client::ActionClient;
use crate::error::{InjectorError, InjectorResult};
use crate::metrics;
use crate::retry::{retry, ExponentialBackoff, ExponentialConfig};

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps the nonce cache aligned with the node
pub struct NonceSynchronizer {
    client: Arc<dyn ActionClient>,
    nonces: Arc<NonceCache>,
    period: Duration,
    /// Pause between two address queries
    query_delay: Duration,
    backoff: ExponentialConfig,
}

impl NonceSynchronizer {
    pub fn new(
        client: Arc<dyn ActionClient>,
        nonces: Arc<NonceCache>,
        period: Duration,
        query_delay: Duration,
        backoff: ExponentialConfig,
    ) -> Self {
        Self {
            client,
            nonces,
            period,
            query_delay,
            backoff,
        }
    }

    /// Refresh every known address once
    pub async fn sync_once(&self) -> InjectorResult<()> {
        let addresses = self.nonces.keys();
        debug!("Syncing nonces for {} addresses", addresses.len());

        for address in addresses {
            let backoff = ExponentialBackoff::new(self.backoff.clone());
            let pending = retry(backoff, "query pending nonce", || {
                self.client.pending_nonce(address)
            })
            .await
            .map_err(|e| InjectorError::NonceResync {
                address: format!("{:?}", address),
                message: e.to_string(),
            })?;

            if let Some(cached) = self.nonces.get(&address) {
                if cached != pending {
                    debug!(
                        "Nonce for {:?} moved from {} to {}",
                        address, cached, pending
                    );
                    metrics::record_nonce_drift();
                }
            }
            self.nonces.overwrite(address, pending);

            tokio::time::sleep(self.query_delay).await;
        }

        metrics::record_resync();
        Ok(())
    }

    /// Resync on every period until cancelled or a resync fails
    pub async fn run(&self, cancel: CancellationToken) -> InjectorResult<()> {
        let mut ticker = interval_at(Instant::now() + self.period, self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Nonce synchronizer started (period {:?})", self.period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                result = self.sync_once() => {
                    if let Err(e) = result {
                        warn!("Nonce synchronizer stopping: {}", e);
                        return Err(e);
                    }
                }
            }
        }

        info!("Nonce synchronizer stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::fake::FakeClient;
    use crate::client::MockActionClient;
    use ethers::types::Address;
    use std::sync::atomic::Ordering;

    fn fast_backoff() -> ExponentialConfig {
        ExponentialConfig {
            initial_interval: Duration::from_millis(10),
            multiplier: 2.0,
            randomization: 0.0,
            max_interval: Duration::from_millis(100),
            max_elapsed: Duration::from_secs(1),
        }
    }

    fn synchronizer(client: Arc<dyn ActionClient>, nonces: Arc<NonceCache>) -> NonceSynchronizer {
        NonceSynchronizer::new(
            client,
            nonces,
            Duration::from_secs(10),
            Duration::from_millis(10),
            fast_backoff(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_sync_overwrites_every_address() {
        let client = Arc::new(FakeClient::default());
        client.pending_nonces.insert(Address::repeat_byte(1), 17);
        client.pending_nonces.insert(Address::repeat_byte(2), 3);

        let nonces = Arc::new(NonceCache::new());
        nonces.insert(Address::repeat_byte(1), 1);
        nonces.insert(Address::repeat_byte(2), 9);

        synchronizer(client.clone(), nonces.clone())
            .sync_once()
            .await
            .unwrap();

        assert_eq!(nonces.get(&Address::repeat_byte(1)), Some(17));
        // the node is authoritative even when it is behind the cache
        assert_eq!(nonces.get(&Address::repeat_byte(2)), Some(3));
        assert_eq!(client.nonce_queries.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let mut client = MockActionClient::new();
        let mut seq = mockall::Sequence::new();
        client
            .expect_pending_nonce()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|address| {
                Err(InjectorError::NonceQuery {
                    address: format!("{:?}", address),
                    message: "timeout".to_string(),
                })
            });
        client
            .expect_pending_nonce()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(8));

        let nonces = Arc::new(NonceCache::new());
        nonces.insert(Address::repeat_byte(4), 0);

        synchronizer(Arc::new(client), nonces.clone())
            .sync_once()
            .await
            .unwrap();
        assert_eq!(nonces.get(&Address::repeat_byte(4)), Some(8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_is_fatal() {
        let client = Arc::new(FakeClient {
            fail_nonce_queries: true,
            ..Default::default()
        });
        let nonces = Arc::new(NonceCache::new());
        nonces.insert(Address::repeat_byte(5), 2);

        let err = synchronizer(client, nonces.clone())
            .run(CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, InjectorError::NonceResync { .. }));
        // cache untouched
        assert_eq!(nonces.get(&Address::repeat_byte(5)), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_on_period_until_cancelled() {
        let client = Arc::new(FakeClient::default());
        let nonces = Arc::new(NonceCache::new());
        nonces.insert(Address::repeat_byte(6), 0);

        let cancel = CancellationToken::new();
        let handle = {
            let sync = synchronizer(client.clone(), nonces);
            let cancel = cancel.clone();
            tokio::spawn(async move { sync.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_secs(35)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        // ticks at 10s, 20s and 30s
        assert_eq!(client.nonce_queries.load(Ordering::SeqCst), 3);
    }
}
