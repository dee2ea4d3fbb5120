//! Action construction and submission

mod builder;
mod pipeline;

pub use builder::ActionBuilder;
pub use pipeline::{PipelineConfig, SubmissionOutcome, SubmissionPipeline};

use crate::accounts::Account;
use crate::config::ActionPolicy;

use ethers::types::{Address, Bytes, U256};
use std::fmt;
use std::sync::Arc;

/// What an action does on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Transfer,
    Execution,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Transfer => "transfer",
            ActionKind::Execution => "execution",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully specified request, built once and submitted once
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    pub sender: Arc<Account>,
    /// Recipient for transfers, contract for executions
    pub to: Address,
    pub amount: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
    pub nonce: u64,
    pub payload: Bytes,
}

/// Amount and gas settings for one action kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindParams {
    pub amount: U256,
    pub gas_price: U256,
    pub gas_limit: u64,
}

/// Everything the builder needs from the run configuration
#[derive(Debug, Clone)]
pub struct ActionParams {
    pub policy: ActionPolicy,
    pub transfer: KindParams,
    pub execution: KindParams,
    pub contract: Address,
}
