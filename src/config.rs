//! Configuration management for the action injector
//!
//! Loads configuration from TOML files with environment variable substitution.
//! The resulting [`Settings`] value is built once at startup and handed to each
//! component; nothing mutates it afterwards.

use crate::action::{ActionParams, KindParams};
use crate::error::{InjectorError, InjectorResult};

use anyhow::{Context, Result};
use ethers::types::{Address, U256};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub injector: InjectorConfig,
    pub endpoint: EndpointConfig,
    pub nonce: NonceConfig,
    pub retry: RetryConfig,
    pub receipt: ReceiptConfig,
    pub accounts: AccountsConfig,
    pub actions: ActionsConfig,
    pub transfer: TransferConfig,
    pub execution: ExecutionConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InjectorConfig {
    pub actions_per_second: u32,
    pub workers: usize,
    /// Upper bound for the elastic worker pool; unbounded when unset
    pub max_workers: Option<usize>,
    pub duration_secs: u64,
    pub drain_grace_secs: u64,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            actions_per_second: 30,
            workers: 10,
            max_workers: None,
            duration_secs: 60 * 60 * 60,
            drain_grace_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub address: String,
    pub secure: bool,
    pub connect_timeout_secs: u64,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8545".to_string(),
            secure: true,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NonceConfig {
    pub resync_interval_secs: u64,
    pub query_delay_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_randomization: f64,
    pub backoff_max_interval_secs: u64,
    pub backoff_max_elapsed_secs: u64,
}

impl Default for NonceConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: 10,
            query_delay_ms: 10,
            backoff_initial_ms: 500,
            backoff_multiplier: 1.5,
            backoff_randomization: 0.5,
            backoff_max_interval_secs: 60,
            backoff_max_elapsed_secs: 15 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub interval_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReceiptConfig {
    pub check: bool,
    pub delay_secs: u64,
}

impl Default for ReceiptConfig {
    fn default() -> Self {
        Self {
            check: false,
            delay_secs: 25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccountsConfig {
    /// Number of freshly generated accounts
    pub random: usize,
    pub key_file: Option<PathBuf>,
    /// Decimal amount each generated account receives from the loaded ones
    pub load_token_amount: String,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            random: 20,
            key_file: None,
            load_token_amount: "0".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ActionsConfig {
    pub policy: ActionPolicy,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ActionPolicy {
    #[default]
    Transfer,
    Execution,
    Mixed,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub amount: String,
    pub gas_price: String,
    pub gas_limit: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            amount: "0".to_string(),
            gas_price: "1000000000000".to_string(),
            gas_limit: 20_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub contract: String,
    pub amount: String,
    pub gas_price: String,
    pub gas_limit: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            contract: String::new(),
            amount: "0".to_string(),
            gas_price: "1000000000000".to_string(),
            gas_limit: 100_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9100,
        }
    }
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub actions_per_second: Option<u32>,
    pub duration_secs: Option<u64>,
    pub policy: Option<ActionPolicy>,
    pub check_receipt: bool,
}

impl Settings {
    /// Load settings from a configuration file
    ///
    /// The path falls back to `INJECTOR_CONFIG`, then `config/default.toml`.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .or_else(|| env::var("INJECTOR_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml(&config_str, overrides)
    }

    /// Parse, override and validate settings from TOML text
    pub fn from_toml(input: &str, overrides: &Overrides) -> Result<Self> {
        let config_str = substitute_env_vars(input);

        let mut settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;
        settings.apply(overrides);
        settings.validate()?;

        Ok(settings)
    }

    fn apply(&mut self, overrides: &Overrides) {
        if let Some(aps) = overrides.actions_per_second {
            self.injector.actions_per_second = aps;
        }
        if let Some(secs) = overrides.duration_secs {
            self.injector.duration_secs = secs;
        }
        if let Some(policy) = overrides.policy {
            self.actions.policy = policy;
        }
        if overrides.check_receipt {
            self.receipt.check = true;
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.injector.actions_per_second == 0 {
            anyhow::bail!("actions_per_second must be greater than zero");
        }
        if let Some(max) = self.injector.max_workers {
            if max < self.injector.workers {
                anyhow::bail!(
                    "max_workers ({}) is smaller than the initial worker count ({})",
                    max,
                    self.injector.workers
                );
            }
        }
        if self.nonce.resync_interval_secs == 0 {
            anyhow::bail!("resync_interval_secs must be greater than zero");
        }
        if self.accounts.random == 0 && self.accounts.key_file.is_none() {
            anyhow::bail!("No accounts configured: set accounts.random or accounts.key_file");
        }
        if self.endpoint.address.is_empty() {
            anyhow::bail!("endpoint.address is empty");
        }

        // Surface amount and address typos before any dispatch starts
        self.action_params()?;
        self.load_token_amount()?;

        if self.accounts.key_file.is_none() && !self.load_token_amount()?.is_zero() {
            tracing::warn!("load_token_amount is set but no key file is configured - no funding");
        }

        Ok(())
    }

    /// Typed action parameters
    pub fn action_params(&self) -> InjectorResult<ActionParams> {
        let contract = if self.actions.policy == ActionPolicy::Transfer {
            parse_optional_address(&self.execution.contract)?
        } else {
            parse_address("execution.contract", &self.execution.contract)?
        };

        Ok(ActionParams {
            policy: self.actions.policy,
            transfer: KindParams {
                amount: parse_amount("transfer.amount", &self.transfer.amount)?,
                gas_price: parse_amount("transfer.gas_price", &self.transfer.gas_price)?,
                gas_limit: self.transfer.gas_limit,
            },
            execution: KindParams {
                amount: parse_amount("execution.amount", &self.execution.amount)?,
                gas_price: parse_amount("execution.gas_price", &self.execution.gas_price)?,
                gas_limit: self.execution.gas_limit,
            },
            contract,
        })
    }

    /// Amount used to fund generated accounts from loaded ones
    pub fn load_token_amount(&self) -> InjectorResult<U256> {
        parse_amount("accounts.load_token_amount", &self.accounts.load_token_amount)
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.injector.duration_secs)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_secs(self.injector.drain_grace_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.endpoint.connect_timeout_secs)
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.nonce.resync_interval_secs)
    }

    pub fn query_delay(&self) -> Duration {
        Duration::from_millis(self.nonce.query_delay_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry.interval_ms)
    }

    pub fn receipt_delay(&self) -> Duration {
        Duration::from_secs(self.receipt.delay_secs)
    }
}

fn parse_amount(field: &str, value: &str) -> InjectorResult<U256> {
    U256::from_dec_str(value.trim())
        .map_err(|e| InjectorError::Config(format!("Invalid {} {:?}: {}", field, value, e)))
}

fn parse_address(field: &str, value: &str) -> InjectorResult<Address> {
    value
        .trim()
        .parse::<Address>()
        .map_err(|e| InjectorError::Config(format!("Invalid {} {:?}: {}", field, value, e)))
}

fn parse_optional_address(value: &str) -> InjectorResult<Address> {
    if value.trim().is_empty() {
        Ok(Address::zero())
    } else {
        parse_address("execution.contract", value)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = match regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}") {
        Ok(re) => re,
        Err(_) => return result,
    };

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}
