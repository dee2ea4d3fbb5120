//! JSON-RPC action client for EVM-compatible nodes

use super::{ActionClient, ActionId, ActionReceipt};
use crate::action::Action;
use crate::error::{InjectorError, InjectorResult};

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Upper bound for a single submit or query round trip
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Action client over an HTTP JSON-RPC provider
pub struct RpcActionClient {
    provider: Provider<Http>,
    chain_id: u64,
    request_timeout: Duration,
}

impl RpcActionClient {
    /// Connect to `address` and fetch the chain id within `connect_timeout`
    ///
    /// A bare `host:port` gets `https://` when `secure`, `http://` otherwise.
    pub async fn connect(
        address: &str,
        secure: bool,
        connect_timeout: Duration,
    ) -> InjectorResult<Self> {
        let endpoint = endpoint_url(address, secure);
        info!("Server endpoint: {}", endpoint);
        if secure {
            info!("secure connection");
        } else {
            info!("insecure connection");
        }

        let provider = Provider::<Http>::try_from(endpoint.as_str())
            .map_err(|e| InjectorError::Connection {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?
            .interval(Duration::from_millis(100));

        let chain_id = timeout(connect_timeout, provider.get_chainid())
            .await
            .map_err(|_| InjectorError::Connection {
                endpoint: endpoint.clone(),
                message: format!("no response within {:?}", connect_timeout),
            })?
            .map_err(|e| InjectorError::Connection {
                endpoint: endpoint.clone(),
                message: e.to_string(),
            })?
            .as_u64();

        info!("Connected to chain {}", chain_id);

        Ok(Self {
            provider,
            chain_id,
            request_timeout: REQUEST_TIMEOUT,
        })
    }

    /// Build the legacy transaction for an action
    fn build_tx(&self, action: &Action) -> TypedTransaction {
        let tx = TransactionRequest::new()
            .from(action.sender.address())
            .to(action.to)
            .value(action.amount)
            .gas(action.gas_limit)
            .gas_price(action.gas_price)
            .nonce(action.nonce)
            .data(action.payload.clone())
            .chain_id(self.chain_id);
        TypedTransaction::Legacy(tx)
    }
}

#[async_trait]
impl ActionClient for RpcActionClient {
    async fn chain_id(&self) -> InjectorResult<u64> {
        Ok(self.chain_id)
    }

    async fn pending_nonce(&self, address: Address) -> InjectorResult<u64> {
        let nonce = timeout(
            self.request_timeout,
            self.provider
                .get_transaction_count(address, Some(BlockNumber::Pending.into())),
        )
        .await
        .map_err(|_| InjectorError::Timeout {
            operation: format!("pending nonce of {:?}", address),
        })?
        .map_err(|e| InjectorError::NonceQuery {
            address: format!("{:?}", address),
            message: e.to_string(),
        })?;

        Ok(nonce.as_u64())
    }

    async fn submit_action(&self, action: &Action) -> InjectorResult<ActionId> {
        let tx = self.build_tx(action);
        let wallet = action.sender.wallet().clone().with_chain_id(self.chain_id);

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| InjectorError::Signing(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let pending = timeout(self.request_timeout, self.provider.send_raw_transaction(raw))
            .await
            .map_err(|_| InjectorError::Timeout {
                operation: "send action".to_string(),
            })?
            .map_err(|e| InjectorError::Submission(e.to_string()))?;

        let action_id = pending.tx_hash();
        debug!(
            "Action sent: {:?} from {:?} nonce {}",
            action_id,
            action.sender.address(),
            action.nonce
        );
        Ok(action_id)
    }

    async fn receipt(&self, action_id: ActionId) -> InjectorResult<Option<ActionReceipt>> {
        let receipt = timeout(
            self.request_timeout,
            self.provider.get_transaction_receipt(action_id),
        )
        .await
        .map_err(|_| InjectorError::Timeout {
            operation: "fetch receipt".to_string(),
        })?
        .map_err(|e| InjectorError::Receipt(e.to_string()))?;

        Ok(receipt.map(|r| ActionReceipt {
            action_id,
            status: r.status.map(|s| s.as_u64()).unwrap_or_default(),
            block_number: r.block_number.map(|b| b.as_u64()),
            gas_used: r.gas_used,
        }))
    }
}

/// Prefix a bare `host:port` with the scheme matching the security mode
fn endpoint_url(address: &str, secure: bool) -> String {
    if address.contains("://") {
        return address.to_string();
    }
    let scheme = if secure { "https" } else { "http" };
    format!("{}://{}", scheme, address)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_scheme_follows_security_mode() {
        assert_eq!(endpoint_url("127.0.0.1:8545", false), "http://127.0.0.1:8545");
        assert_eq!(endpoint_url("rpc.example.org", true), "https://rpc.example.org");
    }

    #[test]
    fn test_explicit_scheme_is_kept() {
        assert_eq!(
            endpoint_url("http://localhost:8545", true),
            "http://localhost:8545"
        );
    }

    #[tokio::test]
    async fn test_silent_node_times_out_nonce_query() {
        // accepts connections and never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                open.push(stream);
            }
        });

        let client = RpcActionClient {
            provider: Provider::<Http>::try_from(format!("http://{}", address).as_str()).unwrap(),
            chain_id: 31337,
            request_timeout: Duration::from_millis(200),
        };
        let result = client.pending_nonce(Address::repeat_byte(1)).await;
        assert!(matches!(result, Err(InjectorError::Timeout { .. })));
        assert!(result.unwrap_err().is_retryable());

        server.abort();
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let result =
            RpcActionClient::connect("127.0.0.1:1", false, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(InjectorError::Connection { .. })));
    }
}
