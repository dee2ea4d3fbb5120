//! One injection run from connection to shutdown
//!
//! The session owns every shared component, performs the startup steps
//! (initial nonce sync, optional account funding), then runs the dispatch
//! engine next to the nonce synchronizer until the run duration elapses, the
//! caller cancels, or the synchronizer fails.

use crate::accounts::AccountPool;
use crate::action::{ActionBuilder, PipelineConfig, SubmissionOutcome, SubmissionPipeline};
use crate::client::{ActionClient, RpcActionClient};
use crate::config::Settings;
use crate::dispatch::{DispatchConfig, DispatchEngine};
use crate::error::{InjectorError, InjectorResult};
use crate::metrics::AppState;
use crate::nonce::{NonceCache, NonceSynchronizer};
use crate::retry::ExponentialConfig;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Pause between two rounds of funding transfers
const FUNDING_ROUND_PAUSE: Duration = Duration::from_secs(10);

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub dispatched: u64,
    pub rejected: u64,
    /// Submissions still running when the drain grace period ran out
    pub abandoned: usize,
}

pub struct InjectionSession {
    id: Uuid,
    settings: Settings,
    chain_id: u64,
    accounts: Arc<AccountPool>,
    builder: Arc<ActionBuilder>,
    pipeline: Arc<SubmissionPipeline>,
    synchronizer: Arc<NonceSynchronizer>,
    engine: Arc<DispatchEngine>,
    started: std::time::Instant,
}

impl InjectionSession {
    /// Connect to the configured node and build the account pool
    pub async fn connect(settings: Settings) -> InjectorResult<Self> {
        let client = RpcActionClient::connect(
            &settings.endpoint.address,
            settings.endpoint.secure,
            settings.connect_timeout(),
        )
        .await?;
        let accounts = AccountPool::build(
            settings.accounts.random,
            settings.accounts.key_file.as_deref(),
        )?;

        Self::with_client(settings, Arc::new(client), accounts).await
    }

    /// Assemble a session around an existing client
    pub async fn with_client(
        settings: Settings,
        client: Arc<dyn ActionClient>,
        accounts: AccountPool,
    ) -> InjectorResult<Self> {
        let id = Uuid::new_v4();
        let chain_id = client.chain_id().await?;
        let params = settings.action_params()?;

        let accounts = Arc::new(accounts);
        let nonces = Arc::new(NonceCache::new());
        for account in accounts.accounts() {
            nonces.insert(account.address(), account.origin().initial_nonce());
        }

        let builder = Arc::new(ActionBuilder::new(
            accounts.clone(),
            nonces.clone(),
            params,
        ));
        let pipeline = Arc::new(SubmissionPipeline::new(
            client.clone(),
            PipelineConfig {
                max_retries: settings.retry.max_retries,
                retry_interval: settings.retry_interval(),
                check_receipt: settings.receipt.check,
                receipt_delay: settings.receipt_delay(),
            },
        ));
        let synchronizer = Arc::new(NonceSynchronizer::new(
            client,
            nonces.clone(),
            settings.resync_interval(),
            settings.query_delay(),
            backoff_config(&settings),
        ));
        let engine = Arc::new(DispatchEngine::new(
            DispatchConfig {
                actions_per_second: settings.injector.actions_per_second,
                workers: settings.injector.workers,
                max_workers: settings.injector.max_workers,
                duration: settings.duration(),
                drain_grace: settings.drain_grace(),
            },
            builder.clone(),
            pipeline.clone(),
        ));

        info!(
            session = %id,
            chain_id,
            accounts = accounts.len(),
            "Injection session ready"
        );

        Ok(Self {
            id,
            settings,
            chain_id,
            accounts,
            builder,
            pipeline,
            synchronizer,
            engine,
            started: std::time::Instant::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// State served by the metrics and status routes
    pub fn app_state(&self) -> AppState {
        AppState {
            session_id: self.id.to_string(),
            stats: self.engine.stats(),
            engine_state: self.engine.subscribe(),
            started: self.started,
        }
    }

    /// Run to completion
    ///
    /// Returns an error only for fatal conditions; the engine is stopped and
    /// in-flight submissions drained before it is returned.
    pub async fn run(&self, shutdown: CancellationToken) -> InjectorResult<SessionReport> {
        let startup = async {
            info!(session = %self.id, "Initial nonce sync");
            self.synchronizer.sync_once().await?;
            self.fund_accounts().await;
            Ok::<(), InjectorError>(())
        };
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!(session = %self.id, "Shutdown requested before dispatch started");
                return Ok(self.report(0));
            }
            result = startup => result?,
        }

        let cancel = shutdown.child_token();
        let mut engine_task: JoinHandle<InjectorResult<()>> = tokio::spawn({
            let engine = self.engine.clone();
            let cancel = cancel.clone();
            async move { engine.run(cancel).await }
        });
        let mut sync_task: JoinHandle<InjectorResult<()>> = tokio::spawn({
            let synchronizer = self.synchronizer.clone();
            let cancel = cancel.clone();
            async move { synchronizer.run(cancel).await }
        });

        let (engine_result, sync_result) = tokio::select! {
            joined = &mut engine_task => {
                cancel.cancel();
                (joined, sync_task.await)
            }
            joined = &mut sync_task => {
                cancel.cancel();
                (engine_task.await, joined)
            }
        };

        let abandoned = self.engine.drain().await;

        let fatal = flatten("nonce synchronizer", sync_result)
            .err()
            .or_else(|| flatten("dispatch engine", engine_result).err());
        if let Some(e) = fatal {
            error!(session = %self.id, "Injection stopped: {}", e);
            return Err(e);
        }

        let report = self.report(abandoned);
        info!(
            session = %self.id,
            dispatched = report.dispatched,
            rejected = report.rejected,
            abandoned,
            "Injection finished"
        );
        Ok(report)
    }

    fn report(&self, abandoned: usize) -> SessionReport {
        let stats = self.engine.stats().snapshot();
        SessionReport {
            session_id: self.id,
            dispatched: stats.dispatched,
            rejected: stats.rejected,
            abandoned,
        }
    }

    /// Send `load_token_amount` from loaded accounts to each generated one
    ///
    /// Funders are used round-robin, pausing between rounds. Failures are
    /// logged and skipped.
    async fn fund_accounts(&self) {
        let amount = match self.settings.load_token_amount() {
            Ok(amount) if !amount.is_zero() => amount,
            _ => return,
        };
        let funders: Vec<_> = self.accounts.loaded().cloned().collect();
        if funders.is_empty() {
            return;
        }

        let recipients: Vec<_> = self.accounts.generated().map(|a| a.address()).collect();
        info!(
            "Funding {} generated accounts from {} loaded accounts",
            recipients.len(),
            funders.len()
        );

        for (i, recipient) in recipients.iter().enumerate() {
            let funder = &funders[i % funders.len()];
            let action = self.builder.build_funding(funder, *recipient, amount);
            if let SubmissionOutcome::Dropped = self.pipeline.submit(action).await {
                warn!("Failed to fund {:?} from {:?}", recipient, funder.address());
            }

            let round_done = (i + 1) % funders.len() == 0;
            if round_done && i + 1 < recipients.len() {
                tokio::time::sleep(FUNDING_ROUND_PAUSE).await;
            }
        }
    }
}

fn backoff_config(settings: &Settings) -> ExponentialConfig {
    let nonce = &settings.nonce;
    ExponentialConfig {
        initial_interval: Duration::from_millis(nonce.backoff_initial_ms),
        multiplier: nonce.backoff_multiplier,
        randomization: nonce.backoff_randomization,
        max_interval: Duration::from_secs(nonce.backoff_max_interval_secs),
        max_elapsed: Duration::from_secs(nonce.backoff_max_elapsed_secs),
    }
}

fn flatten(
    task: &str,
    joined: Result<InjectorResult<()>, tokio::task::JoinError>,
) -> InjectorResult<()> {
    joined.map_err(|e| InjectorError::Internal(format!("{} task failed: {}", task, e)))?
}
