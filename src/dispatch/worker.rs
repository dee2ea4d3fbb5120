//! Dispatch workers and the elastic pool that owns them
//!
//! A worker is a dispatch slot, not an executor: each token it receives turns
//! into one submission unit spawned on the shared [`TaskTracker`], and the
//! worker goes straight back to waiting. Idleness is tracked with a counter
//! the pacing loop claims from before sending, so a token is only ever sent
//! when some worker is committed to taking it.

use super::{DispatchToken, EngineStats};
use crate::action::{ActionBuilder, SubmissionPipeline};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace, warn};

/// Everything a submission unit needs
#[derive(Clone)]
pub(crate) struct UnitContext {
    pub builder: Arc<ActionBuilder>,
    pub pipeline: Arc<SubmissionPipeline>,
    pub tracker: TaskTracker,
    pub stats: Arc<EngineStats>,
}

impl UnitContext {
    /// Build and submit one action in the background
    fn spawn_unit(&self, worker_id: usize, token: DispatchToken) {
        let ctx = self.clone();
        self.stats.unit_started();
        self.tracker.spawn(async move {
            let action = ctx.builder.build();
            trace!(
                "Worker {} token {}: {} from {:?} nonce {}",
                worker_id,
                token.seq,
                action.kind,
                action.sender.address(),
                action.nonce
            );
            let outcome = ctx.pipeline.submit(action).await;
            trace!("Token {} finished: {:?}", token.seq, outcome);
            ctx.stats.unit_finished();
        });
    }
}

type SharedReceiver = Arc<Mutex<mpsc::UnboundedReceiver<DispatchToken>>>;

struct Worker {
    id: usize,
    tokens: SharedReceiver,
    idle: Arc<AtomicUsize>,
    ctx: UnitContext,
}

impl Worker {
    async fn run(self, first: Option<DispatchToken>) {
        if let Some(token) = first {
            self.ctx.spawn_unit(self.id, token);
            self.idle.fetch_add(1, Ordering::SeqCst);
        }

        loop {
            let token = {
                let mut tokens = self.tokens.lock().await;
                tokens.recv().await
            };
            match token {
                Some(token) => {
                    self.ctx.spawn_unit(self.id, token);
                    self.idle.fetch_add(1, Ordering::SeqCst);
                }
                None => break,
            }
        }

        trace!("Worker {} exiting", self.id);
        self.ctx.stats.worker_stopped();
    }
}

/// The set of running workers and the channel feeding them
pub(crate) struct WorkerPool {
    sender: Option<mpsc::UnboundedSender<DispatchToken>>,
    receiver: SharedReceiver,
    /// Workers committed to taking the next token
    idle: Arc<AtomicUsize>,
    workers: JoinSet<()>,
    next_id: usize,
    ctx: UnitContext,
}

impl WorkerPool {
    pub fn new(ctx: UnitContext) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Some(sender),
            receiver: Arc::new(Mutex::new(receiver)),
            idle: Arc::new(AtomicUsize::new(0)),
            workers: JoinSet::new(),
            next_id: 0,
            ctx,
        }
    }

    /// Start one worker, optionally handing it its first token directly
    pub fn spawn(&mut self, first: Option<DispatchToken>) -> usize {
        let worker = Worker {
            id: self.next_id,
            tokens: self.receiver.clone(),
            idle: self.idle.clone(),
            ctx: self.ctx.clone(),
        };
        self.next_id += 1;

        // A seedless worker is available as soon as it exists
        if first.is_none() {
            self.idle.fetch_add(1, Ordering::SeqCst);
        }
        self.workers.spawn(worker.run(first));
        self.ctx.stats.worker_started()
    }

    /// Hand the token to an idle worker, giving it back when none is idle
    pub fn try_handoff(&self, token: DispatchToken) -> Result<(), DispatchToken> {
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Err(token),
        };

        if self
            .idle
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_err()
        {
            return Err(token);
        }

        sender.send(token).map_err(|e| {
            self.idle.fetch_add(1, Ordering::SeqCst);
            e.0
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Close the token channel and wait for every worker to exit
    pub async fn shutdown(&mut self) {
        self.sender.take();
        while let Some(result) = self.workers.join_next().await {
            if let Err(e) = result {
                warn!("Worker task failed: {}", e);
            }
        }
        debug!("All workers exited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountPool;
    use crate::action::{ActionParams, KindParams, PipelineConfig};
    use crate::client::fake::FakeClient;
    use crate::config::ActionPolicy;
    use crate::nonce::NonceCache;
    use ethers::types::{Address, U256};
    use std::time::Duration;

    fn context(client: Arc<FakeClient>) -> UnitContext {
        let pool = Arc::new(AccountPool::build(2, None).unwrap());
        let nonces = Arc::new(NonceCache::new());
        let kind = KindParams {
            amount: U256::one(),
            gas_price: U256::one(),
            gas_limit: 21_000,
        };
        let params = ActionParams {
            policy: ActionPolicy::Transfer,
            transfer: kind.clone(),
            execution: kind,
            contract: Address::zero(),
        };
        let pipeline = SubmissionPipeline::new(
            client,
            PipelineConfig {
                max_retries: 0,
                retry_interval: Duration::from_millis(1),
                check_receipt: false,
                receipt_delay: Duration::ZERO,
            },
        );
        UnitContext {
            builder: Arc::new(ActionBuilder::new(pool, nonces, params)),
            pipeline: Arc::new(pipeline),
            tracker: TaskTracker::new(),
            stats: Arc::new(EngineStats::default()),
        }
    }

    #[tokio::test]
    async fn test_handoff_needs_an_idle_worker() {
        let client = Arc::new(FakeClient::default());
        let mut pool = WorkerPool::new(context(client.clone()));

        let token = DispatchToken { seq: 0 };
        assert_eq!(pool.try_handoff(token), Err(token));

        pool.spawn(None);
        assert!(pool.try_handoff(token).is_ok());
        // the single idle slot is claimed
        assert_eq!(pool.try_handoff(DispatchToken { seq: 1 }), Err(DispatchToken { seq: 1 }));

        pool.shutdown().await;
        let ctx = &pool.ctx;
        ctx.tracker.close();
        ctx.tracker.wait().await;
        assert_eq!(client.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_seeded_worker_submits_its_first_token() {
        let client = Arc::new(FakeClient::default());
        let mut pool = WorkerPool::new(context(client.clone()));

        assert_eq!(pool.spawn(Some(DispatchToken { seq: 7 })), 1);
        assert_eq!(pool.size(), 1);

        pool.shutdown().await;
        pool.ctx.tracker.close();
        pool.ctx.tracker.wait().await;
        assert_eq!(client.submitted().len(), 1);
        assert_eq!(pool.ctx.stats.snapshot().workers, 0);
    }

    #[tokio::test]
    async fn test_shutdown_delivers_queued_tokens() {
        let client = Arc::new(FakeClient::default());
        let mut pool = WorkerPool::new(context(client.clone()));
        pool.spawn(None);
        pool.spawn(None);

        assert!(pool.try_handoff(DispatchToken { seq: 0 }).is_ok());
        assert!(pool.try_handoff(DispatchToken { seq: 1 }).is_ok());

        pool.shutdown().await;
        pool.ctx.tracker.close();
        pool.ctx.tracker.wait().await;
        assert_eq!(client.submitted().len(), 2);
    }
}
