//! Signing identities used to send actions
//!
//! The pool is built once at startup from freshly generated wallets and/or a
//! TOML key file, and is read-only afterwards.

use crate::error::{InjectorError, InjectorResult};

use ethers::core::k256::ecdsa::VerifyingKey;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::Address;
use ethers::utils::public_key_to_address;
use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Where an account came from; decides its placeholder nonce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountOrigin {
    Generated,
    Loaded,
}

impl AccountOrigin {
    /// Nonce cached for the account until the first sync replaces it
    pub fn initial_nonce(&self) -> u64 {
        match self {
            AccountOrigin::Generated => 1,
            AccountOrigin::Loaded => 0,
        }
    }
}

/// A single signing identity
#[derive(Debug, Clone)]
pub struct Account {
    address: Address,
    wallet: LocalWallet,
    origin: AccountOrigin,
}

impl Account {
    /// Generate a fresh random account
    pub fn generate() -> Self {
        let wallet = LocalWallet::new(&mut rand::thread_rng());
        Self {
            address: wallet.address(),
            wallet,
            origin: AccountOrigin::Generated,
        }
    }

    /// Build an account from a hex private key, checking it against a public key
    pub fn from_key_pair(public_key: Option<&str>, private_key: &str) -> InjectorResult<Self> {
        let wallet = private_key
            .trim()
            .trim_start_matches("0x")
            .parse::<LocalWallet>()
            .map_err(|e| InjectorError::Account(format!("Invalid private key: {}", e)))?;

        if let Some(public_key) = public_key {
            let bytes = hex::decode(public_key.trim().trim_start_matches("0x"))
                .map_err(|e| InjectorError::Account(format!("Invalid public key hex: {}", e)))?;
            let key = VerifyingKey::from_sec1_bytes(&bytes)
                .map_err(|e| InjectorError::Account(format!("Invalid public key: {}", e)))?;
            if public_key_to_address(&key) != wallet.address() {
                return Err(InjectorError::Account(format!(
                    "Public key does not match private key for {:?}",
                    wallet.address()
                )));
            }
        }

        Ok(Self {
            address: wallet.address(),
            wallet,
            origin: AccountOrigin::Loaded,
        })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn wallet(&self) -> &LocalWallet {
        &self.wallet
    }

    pub fn origin(&self) -> AccountOrigin {
        self.origin
    }
}

/// Key file layout
#[derive(Debug, Deserialize)]
struct KeyFile {
    pairs: Vec<KeyPair>,
}

#[derive(Debug, Deserialize)]
struct KeyPair {
    public_key: Option<String>,
    private_key: String,
}

/// Load accounts from a TOML key file
pub fn load_key_file(path: &Path) -> InjectorResult<Vec<Account>> {
    let contents = std::fs::read_to_string(path)?;
    let key_file: KeyFile = toml::from_str(&contents)
        .map_err(|e| InjectorError::Account(format!("Failed to parse key file: {}", e)))?;

    let mut accounts = Vec::with_capacity(key_file.pairs.len());
    for pair in &key_file.pairs {
        let account = Account::from_key_pair(pair.public_key.as_deref(), &pair.private_key)?;
        info!("Loaded account {:?}", account.address());
        accounts.push(account);
    }

    Ok(accounts)
}

/// The fixed set of accounts available for sending
#[derive(Debug)]
pub struct AccountPool {
    accounts: Vec<Arc<Account>>,
}

impl AccountPool {
    /// Create a pool; an empty pool is rejected
    pub fn new(accounts: Vec<Account>) -> InjectorResult<Self> {
        if accounts.is_empty() {
            return Err(InjectorError::Account("Account pool is empty".to_string()));
        }
        Ok(Self {
            accounts: accounts.into_iter().map(Arc::new).collect(),
        })
    }

    /// Generate `count` accounts and append any loaded from `key_file`
    pub fn build(count: usize, key_file: Option<&Path>) -> InjectorResult<Self> {
        let mut accounts: Vec<Account> = (0..count).map(|_| Account::generate()).collect();
        debug!("Generated {} accounts", accounts.len());

        if let Some(path) = key_file {
            accounts.extend(load_key_file(path)?);
        }

        Self::new(accounts)
    }

    /// Pick an account uniformly at random
    pub fn random<R: Rng + ?Sized>(&self, rng: &mut R) -> &Arc<Account> {
        &self.accounts[rng.gen_range(0..self.accounts.len())]
    }

    pub fn accounts(&self) -> &[Arc<Account>] {
        &self.accounts
    }

    pub fn generated(&self) -> impl Iterator<Item = &Arc<Account>> {
        self.accounts
            .iter()
            .filter(|a| a.origin() == AccountOrigin::Generated)
    }

    pub fn loaded(&self) -> impl Iterator<Item = &Arc<Account>> {
        self.accounts
            .iter()
            .filter(|a| a.origin() == AccountOrigin::Loaded)
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // Well-known development key (anvil account #0)
    const PRIVATE_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const ADDRESS: &str = "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266";

    fn public_key_hex(wallet: &LocalWallet) -> String {
        let point = wallet.signer().verifying_key().to_encoded_point(false);
        hex::encode(point.as_bytes())
    }

    #[test]
    fn test_generated_accounts_are_distinct() {
        let pool = AccountPool::build(3, None).unwrap();
        assert_eq!(pool.len(), 3);
        assert_ne!(pool.accounts()[0].address(), pool.accounts()[1].address());
        assert!(pool
            .accounts()
            .iter()
            .all(|a| a.origin() == AccountOrigin::Generated));
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        assert!(AccountPool::new(Vec::new()).is_err());
    }

    #[test]
    fn test_key_pair_derives_address() {
        let account = Account::from_key_pair(None, PRIVATE_KEY).unwrap();
        assert_eq!(account.address(), ADDRESS.parse::<Address>().unwrap());
        assert_eq!(account.origin().initial_nonce(), 0);
    }

    #[test]
    fn test_mismatched_public_key_is_rejected() {
        let other = Account::generate();
        let err = Account::from_key_pair(Some(&public_key_hex(other.wallet())), PRIVATE_KEY);
        assert!(err.is_err());
    }

    #[test]
    fn test_load_key_file() {
        let wallet = PRIVATE_KEY.parse::<LocalWallet>().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[pairs]]\npublic_key = \"{}\"\nprivate_key = \"{}\"",
            public_key_hex(&wallet),
            PRIVATE_KEY
        )
        .unwrap();

        let pool = AccountPool::build(2, Some(file.path())).unwrap();
        assert_eq!(pool.len(), 3);
        assert_eq!(pool.generated().count(), 2);
        let loaded: Vec<_> = pool.loaded().collect();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].address(), wallet.address());
    }

    #[test]
    fn test_random_pick_stays_in_pool() {
        let pool = AccountPool::build(4, None).unwrap();
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let picked = pool.random(&mut rng).address();
            assert!(pool.accounts().iter().any(|a| a.address() == picked));
        }
    }
}
