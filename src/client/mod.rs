//! Client seam between the injector core and the remote ledger node
//!
//! The core only needs four calls: the chain id, an account's pending nonce,
//! submitting a built action, and fetching its receipt. [`RpcActionClient`] is
//! the JSON-RPC implementation used in production.

pub mod rpc;

pub use rpc::RpcActionClient;

use crate::action::Action;
use crate::error::InjectorResult;

use async_trait::async_trait;
use ethers::types::{Address, H256, U256};

/// Identifier the node assigns to a submitted action
pub type ActionId = H256;

/// Execution outcome reported by the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionReceipt {
    pub action_id: ActionId,
    pub status: u64,
    pub block_number: Option<u64>,
    pub gas_used: Option<U256>,
}

impl ActionReceipt {
    /// Status code of an accepted action
    pub const STATUS_SUCCESS: u64 = 1;

    pub fn is_success(&self) -> bool {
        self.status == Self::STATUS_SUCCESS
    }
}

/// Remote calls the injector depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActionClient: Send + Sync {
    /// Chain identifier used when signing
    async fn chain_id(&self) -> InjectorResult<u64>;

    /// Authoritative next nonce, including pending actions
    async fn pending_nonce(&self, address: Address) -> InjectorResult<u64>;

    /// Sign and send one action
    async fn submit_action(&self, action: &Action) -> InjectorResult<ActionId>;

    /// Receipt for a submitted action, `None` while it is not yet available
    async fn receipt(&self, action_id: ActionId) -> InjectorResult<Option<ActionReceipt>>;
}
