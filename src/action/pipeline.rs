//! Submission pipeline with bounded retry and optional receipt checking
//!
//! Nothing here is fatal: failures are logged and counted, the action is
//! dropped, and the dispatch engine never hears about it.

use super::Action;
use crate::client::{ActionClient, ActionId, ActionReceipt};
use crate::error::InjectorError;
use crate::metrics;
use crate::retry::{retry, ConstantBackoff};

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Retry and receipt settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub check_receipt: bool,
    /// Wait before the first receipt query
    pub receipt_delay: Duration,
}

/// How one submission ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// Every send attempt failed; the action was abandoned
    Dropped,
    /// Sent; receipt checking disabled
    Submitted(ActionId),
    /// Sent and confirmed with a success status
    Confirmed(ActionId),
    /// Sent, but the receipt reported a failure status
    Failed { action_id: ActionId, status: u64 },
    /// Sent, but no receipt could be fetched
    Unconfirmed(ActionId),
}

/// Sends actions and optionally confirms them
pub struct SubmissionPipeline {
    client: Arc<dyn ActionClient>,
    config: PipelineConfig,
}

impl SubmissionPipeline {
    pub fn new(client: Arc<dyn ActionClient>, config: PipelineConfig) -> Self {
        Self { client, config }
    }

    fn backoff(&self) -> ConstantBackoff {
        ConstantBackoff::new(self.config.retry_interval, self.config.max_retries)
    }

    /// Submit one action, then check its receipt when enabled
    pub async fn submit(&self, action: Action) -> SubmissionOutcome {
        let kind = action.kind;
        let sent = retry(self.backoff(), "submit action", || {
            self.client.submit_action(&action)
        })
        .await;

        let action_id = match sent {
            Ok(action_id) => action_id,
            Err(e) => {
                error!(
                    "Failed to inject {} from {:?} nonce {}: {}",
                    kind,
                    action.sender.address(),
                    action.nonce,
                    e
                );
                metrics::record_submission_failed(kind);
                return SubmissionOutcome::Dropped;
            }
        };
        metrics::record_submitted(kind);

        if !self.config.check_receipt {
            return SubmissionOutcome::Submitted(action_id);
        }

        tokio::time::sleep(self.config.receipt_delay).await;
        self.confirm(action_id).await
    }

    /// Poll the receipt for a submitted action
    async fn confirm(&self, action_id: ActionId) -> SubmissionOutcome {
        let fetched = retry(self.backoff(), "get receipt", || async move {
            self.client
                .receipt(action_id)
                .await?
                .ok_or_else(|| InjectorError::ReceiptPending {
                    action_id: format!("{:?}", action_id),
                })
        })
        .await;

        match fetched {
            Ok(receipt) if receipt.is_success() => {
                debug!("Action {:?} confirmed", action_id);
                metrics::record_receipt(true);
                SubmissionOutcome::Confirmed(action_id)
            }
            Ok(ActionReceipt { status, .. }) => {
                error!(
                    "Receipt has failed status {} for action {:?}",
                    status, action_id
                );
                metrics::record_receipt(false);
                SubmissionOutcome::Failed { action_id, status }
            }
            Err(e) => {
                error!("Failed to get receipt for action {:?}: {}", action_id, e);
                metrics::record_receipt(false);
                SubmissionOutcome::Unconfirmed(action_id)
            }
        }
    }
}
