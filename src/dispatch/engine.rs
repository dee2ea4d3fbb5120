//! The pacing loop
//!
//! Token n is due at `began + n * interval`. The loop sleeps until then, never
//! negatively: when it falls behind, due tokens are issued back to back until
//! it catches up.

use super::worker::{UnitContext, WorkerPool};
use super::{DispatchConfig, DispatchToken, EngineState, EngineStats};
use crate::action::{ActionBuilder, SubmissionPipeline};
use crate::error::{InjectorError, InjectorResult};

use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// Issues tokens at a fixed rate to an elastic worker pool
pub struct DispatchEngine {
    config: DispatchConfig,
    builder: Arc<ActionBuilder>,
    pipeline: Arc<SubmissionPipeline>,
    stats: Arc<EngineStats>,
    tracker: TaskTracker,
    state: watch::Sender<EngineState>,
}

impl DispatchEngine {
    pub fn new(
        config: DispatchConfig,
        builder: Arc<ActionBuilder>,
        pipeline: Arc<SubmissionPipeline>,
    ) -> Self {
        let (state, _) = watch::channel(EngineState::Idle);
        Self {
            config,
            builder,
            pipeline,
            stats: Arc::new(EngineStats::default()),
            tracker: TaskTracker::new(),
            state,
        }
    }

    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    /// Follow state transitions
    pub fn subscribe(&self) -> watch::Receiver<EngineState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: EngineState) {
        debug!("Dispatch engine -> {:?}", state);
        self.state.send_replace(state);
    }

    /// Issue tokens until the run duration elapses or `cancel` fires
    ///
    /// Returns once every worker has exited. Submission units may still be in
    /// flight; see [`DispatchEngine::drain`].
    pub async fn run(&self, cancel: CancellationToken) -> InjectorResult<()> {
        if self.state() != EngineState::Idle {
            return Err(InjectorError::Internal(
                "Dispatch engine already started".to_string(),
            ));
        }

        let mut pool = WorkerPool::new(UnitContext {
            builder: self.builder.clone(),
            pipeline: self.pipeline.clone(),
            tracker: self.tracker.clone(),
            stats: self.stats.clone(),
        });
        for _ in 0..self.config.workers {
            pool.spawn(None);
        }

        let interval = self.config.interval();
        let began = Instant::now();
        let deadline = sleep_until(began + self.config.duration);
        tokio::pin!(deadline);

        self.set_state(EngineState::Running);
        info!(
            "Dispatching {} actions/s with {} workers (limit {:?}) for {:?}",
            self.config.actions_per_second,
            self.config.workers,
            self.config.max_workers,
            self.config.duration
        );

        let mut n: u64 = 0;
        loop {
            let due = began + interval.saturating_mul(u32::try_from(n).unwrap_or(u32::MAX));

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Dispatch cancelled after {} tokens", n);
                    break;
                }
                _ = &mut deadline => {
                    info!("Run duration elapsed after {} tokens", n);
                    break;
                }
                _ = sleep_until(due) => {}
            }

            self.dispatch(DispatchToken { seq: n }, &mut pool);
            n += 1;
        }

        self.set_state(EngineState::Draining);
        pool.shutdown().await;
        self.set_state(EngineState::Stopped);

        let stats = self.stats.snapshot();
        info!(
            "Dispatch stopped: {} dispatched, {} rejected, {} submissions in flight",
            stats.dispatched, stats.rejected, stats.in_flight
        );
        Ok(())
    }

    /// Route one token: idle worker, else a new worker, else reject
    fn dispatch(&self, token: DispatchToken, pool: &mut WorkerPool) {
        let token = match pool.try_handoff(token) {
            Ok(()) => {
                self.stats.record_dispatched();
                return;
            }
            Err(token) => token,
        };

        let at_limit = self
            .config
            .max_workers
            .map_or(false, |max| pool.size() >= max);
        if at_limit {
            warn!(
                "No idle worker and pool is at its limit ({}), rejecting token {}",
                pool.size(),
                token.seq
            );
            self.stats.record_rejected();
            return;
        }

        let size = pool.spawn(Some(token));
        debug!("No idle worker for token {}, pool grown to {}", token.seq, size);
        self.stats.record_dispatched();
    }

    /// Wait for in-flight submissions, up to the configured grace period
    ///
    /// Returns how many were abandoned.
    pub async fn drain(&self) -> usize {
        self.tracker.close();
        let in_flight = self.tracker.len();
        if in_flight == 0 {
            return 0;
        }

        info!(
            "Waiting up to {:?} for {} in-flight submissions",
            self.config.drain_grace, in_flight
        );
        match tokio::time::timeout(self.config.drain_grace, self.tracker.wait()).await {
            Ok(()) => 0,
            Err(_) => {
                let abandoned = self.tracker.len();
                warn!("Abandoning {} in-flight submissions", abandoned);
                abandoned
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountPool;
    use crate::action::{ActionParams, KindParams, PipelineConfig};
    use crate::client::fake::FakeClient;
    use crate::client::ActionClient;
    use crate::config::ActionPolicy;
    use crate::nonce::NonceCache;
    use ethers::types::{Address, U256};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        client: Arc<FakeClient>,
        accounts: Arc<AccountPool>,
        nonces: Arc<NonceCache>,
    }

    impl Fixture {
        fn new(client: FakeClient, accounts: usize) -> Self {
            let accounts = Arc::new(AccountPool::build(accounts, None).unwrap());
            let nonces = Arc::new(NonceCache::new());
            for account in accounts.accounts() {
                nonces.insert(account.address(), account.origin().initial_nonce());
            }
            Self {
                client: Arc::new(client),
                accounts,
                nonces,
            }
        }

        fn engine(&self, config: DispatchConfig) -> DispatchEngine {
            let kind = KindParams {
                amount: U256::one(),
                gas_price: U256::from(1_000u64),
                gas_limit: 20_000,
            };
            let params = ActionParams {
                policy: ActionPolicy::Transfer,
                transfer: kind.clone(),
                execution: kind,
                contract: Address::zero(),
            };
            let builder = ActionBuilder::new(self.accounts.clone(), self.nonces.clone(), params);
            let client: Arc<dyn ActionClient> = self.client.clone();
            let pipeline = SubmissionPipeline::new(
                client,
                PipelineConfig {
                    max_retries: 2,
                    retry_interval: Duration::from_millis(10),
                    check_receipt: false,
                    receipt_delay: Duration::ZERO,
                },
            );
            DispatchEngine::new(config, Arc::new(builder), Arc::new(pipeline))
        }
    }

    fn config(rate: u32, secs: u64, workers: usize, max_workers: Option<usize>) -> DispatchConfig {
        DispatchConfig {
            actions_per_second: rate,
            workers,
            max_workers,
            duration: Duration::from_secs(secs),
            drain_grace: Duration::from_secs(5),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_times_duration_tokens() {
        let fixture = Fixture::new(FakeClient::default(), 4);
        let engine = fixture.engine(config(10, 2, 2, None));

        engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(engine.drain().await, 0);

        let stats = engine.stats().snapshot();
        assert_eq!(stats.dispatched, 20);
        assert_eq!(stats.rejected, 0);
        assert_eq!(fixture.client.submitted().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_grows_from_empty() {
        let fixture = Fixture::new(FakeClient::default(), 2);
        let engine = fixture.engine(config(5, 1, 0, Some(1)));

        engine.run(CancellationToken::new()).await.unwrap();
        engine.drain().await;

        let stats = engine.stats().snapshot();
        // one worker spawned for the first token, then reused
        assert_eq!(stats.dispatched, 5);
        assert_eq!(stats.rejected, 0);
        assert_eq!(fixture.client.submitted().len(), 5);
    }

    #[tokio::test]
    async fn test_each_unserved_token_grows_pool_by_one() {
        let fixture = Fixture::new(FakeClient::default(), 1);
        let engine = fixture.engine(config(1, 1, 0, None));
        let mut pool = WorkerPool::new(UnitContext {
            builder: engine.builder.clone(),
            pipeline: engine.pipeline.clone(),
            tracker: engine.tracker.clone(),
            stats: engine.stats.clone(),
        });

        // no yield between calls, so new workers never get to register as idle
        for seq in 0..3 {
            engine.dispatch(DispatchToken { seq }, &mut pool);
            assert_eq!(pool.size(), seq as usize + 1);
        }
        assert_eq!(engine.stats().snapshot().dispatched, 3);

        pool.shutdown().await;
        engine.drain().await;
        assert_eq!(fixture.client.submitted().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_rejected_at_limit() {
        let fixture = Fixture::new(FakeClient::default(), 1);
        let engine = fixture.engine(config(4, 1, 0, Some(0)));

        engine.run(CancellationToken::new()).await.unwrap();

        let stats = engine.stats().snapshot();
        assert_eq!(stats.dispatched, 0);
        assert_eq!(stats.rejected, 4);
        assert!(fixture.client.submitted().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transfer_nonces_contiguous_per_sender() {
        let fixture = Fixture::new(FakeClient::default(), 3);
        let engine = fixture.engine(config(2, 1, 1, None));

        engine.run(CancellationToken::new()).await.unwrap();
        engine.drain().await;

        let submitted = fixture.client.submitted();
        assert!((1..=3).contains(&submitted.len()));

        let mut per_sender: HashMap<Address, Vec<u64>> = HashMap::new();
        for action in &submitted {
            per_sender
                .entry(action.sender.address())
                .or_default()
                .push(action.nonce);
        }
        for (sender, mut nonces) in per_sender {
            nonces.sort_unstable();
            // generated accounts start at 1
            let expected: Vec<u64> = (1..=nonces.len() as u64).collect();
            assert_eq!(nonces, expected, "sender {:?}", sender);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_submissions_do_not_stop_dispatch() {
        let fixture = Fixture::new(
            FakeClient {
                fail_submissions: true,
                ..Default::default()
            },
            2,
        );
        let engine = fixture.engine(config(5, 1, 1, None));

        engine.run(CancellationToken::new()).await.unwrap();
        assert_eq!(engine.drain().await, 0);
        assert_eq!(engine.stats().snapshot().dispatched, 5);
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_progression_on_cancel() {
        let fixture = Fixture::new(FakeClient::default(), 1);
        let engine = Arc::new(fixture.engine(config(10, 3600, 1, None)));
        let mut states = engine.subscribe();
        assert_eq!(*states.borrow(), EngineState::Idle);

        let cancel = CancellationToken::new();
        let handle = {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { engine.run(cancel).await })
        };

        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), EngineState::Running);

        tokio::time::sleep(Duration::from_millis(950)).await;
        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.stats().snapshot().dispatched, 10);

        // a stopped engine cannot be restarted
        assert!(engine.run(CancellationToken::new()).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_reports_abandoned_units() {
        let fixture = Fixture::new(FakeClient::default(), 1);
        let engine = fixture.engine(config(1, 1, 1, None));

        engine.tracker.spawn(tokio::time::sleep(Duration::from_secs(60)));
        assert_eq!(engine.drain().await, 1);
    }
}
