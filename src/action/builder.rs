//! Builds transfer and contract-execution actions from local state

use super::{Action, ActionKind, ActionParams};
use crate::accounts::{Account, AccountPool};
use crate::config::ActionPolicy;
use crate::nonce::NonceCache;

use alloy_sol_types::{sol, SolCall};
use ethers::types::{Address, Bytes, U256};
use rand::Rng;
use sha3::{Digest, Keccak256};
use std::sync::Arc;

sol! {
    function addHash(uint256 timestamp, string fileHash);
}

/// Composes actions; the only side effect is one nonce allocation per action
pub struct ActionBuilder {
    accounts: Arc<AccountPool>,
    nonces: Arc<NonceCache>,
    params: ActionParams,
}

impl ActionBuilder {
    pub fn new(accounts: Arc<AccountPool>, nonces: Arc<NonceCache>, params: ActionParams) -> Self {
        Self {
            accounts,
            nonces,
            params,
        }
    }

    /// Choose the next action kind according to the configured policy
    pub fn pick_kind<R: Rng + ?Sized>(&self, rng: &mut R) -> ActionKind {
        match self.params.policy {
            ActionPolicy::Transfer => ActionKind::Transfer,
            ActionPolicy::Execution => ActionKind::Execution,
            ActionPolicy::Mixed => {
                if rng.gen_bool(0.5) {
                    ActionKind::Transfer
                } else {
                    ActionKind::Execution
                }
            }
        }
    }

    /// Build the next action
    pub fn build(&self) -> Action {
        let mut rng = rand::thread_rng();
        match self.pick_kind(&mut rng) {
            ActionKind::Transfer => self.build_transfer(&mut rng),
            ActionKind::Execution => self.build_execution(&mut rng),
        }
    }

    /// Transfer between two random pool accounts
    pub fn build_transfer<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        let sender = self.accounts.random(rng).clone();
        let nonce = self.nonces.allocate(sender.address());
        let recipient = self.accounts.random(rng).address();
        let params = &self.params.transfer;

        Action {
            kind: ActionKind::Transfer,
            sender,
            to: recipient,
            amount: params.amount,
            gas_price: params.gas_price,
            gas_limit: params.gas_limit,
            nonce,
            payload: Bytes::from(random_hash(rng).to_vec()),
        }
    }

    /// `addHash(timestamp, hash)` call on the configured contract
    pub fn build_execution<R: Rng + ?Sized>(&self, rng: &mut R) -> Action {
        let sender = self.accounts.random(rng).clone();
        let nonce = self.nonces.allocate(sender.address());
        let params = &self.params.execution;

        let call = addHashCall {
            timestamp: alloy_primitives::U256::from(unix_timestamp()),
            fileHash: hex::encode(random_hash(rng)),
        };

        Action {
            kind: ActionKind::Execution,
            sender,
            to: self.params.contract,
            amount: params.amount,
            gas_price: params.gas_price,
            gas_limit: params.gas_limit,
            nonce,
            payload: Bytes::from(call.abi_encode()),
        }
    }

    /// Plain value transfer from a chosen sender, used for account funding
    pub fn build_funding(&self, sender: &Arc<Account>, recipient: Address, amount: U256) -> Action {
        let nonce = self.nonces.allocate(sender.address());
        let params = &self.params.transfer;

        Action {
            kind: ActionKind::Transfer,
            sender: sender.clone(),
            to: recipient,
            amount,
            gas_price: params.gas_price,
            gas_limit: params.gas_limit,
            nonce,
            payload: Bytes::new(),
        }
    }
}

/// Keccak-256 of a random 64-bit value, keeps payloads distinct
fn random_hash<R: Rng + ?Sized>(rng: &mut R) -> [u8; 32] {
    let data: u64 = rng.gen();
    let digest = Keccak256::digest(data.to_be_bytes());
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&digest);
    hash
}

fn unix_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}
