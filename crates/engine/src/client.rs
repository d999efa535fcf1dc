//! HTTP ledger client.
//!
//! One [`LedgerClient`] wraps one RPC endpoint of one chain. Reads retry
//! with backoff; sends never do, a resubmitted transaction is not the same
//! request. [`LedgerClient::connect_with_failover`] walks a chain profile's
//! endpoint list and settles on the first one that answers.

use alloy_consensus::TxEnvelope;
use alloy_network::Ethereum;
use alloy_primitives::{Address, Bytes, TxHash, TxKind};
use alloy_provider::{Provider, ProviderBuilder, RootProvider};
use alloy_rpc_types::{
    Filter, Log, TransactionInput, TransactionReceipt, TransactionRequest,
};
use anyhow::{Context as AnyhowContext, Result};
use async_trait::async_trait;
use chainflow_registry::{ChainProfile, RPC_REQUEST_TIMEOUT, RPC_RETRY_COUNT, RPC_RETRY_DELAY};
use reqwest::ClientBuilder;
use std::{sync::Arc, time::Instant};
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};
use url::Url;

/// Raw read access to ledger state. The entity gateway builds typed reads
/// on top of this seam; tests substitute a scripted implementation.
#[async_trait]
pub trait LedgerCall: Send + Sync {
    /// Executes a read-only contract call and returns the raw return data.
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes>;
}

#[async_trait]
impl<T: LedgerCall + ?Sized> LedgerCall for Arc<T> {
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        (**self).call(to, input).await
    }
}

/// Client performance metrics
#[derive(Debug, Default, Clone)]
pub struct ProviderMetrics {
    /// Number of requests sent
    pub requests_sent: u64,
    /// Number of successful requests
    pub requests_succeeded: u64,
    /// Number of failed requests
    pub requests_failed: u64,
    /// Total latency time (milliseconds)
    pub total_latency_ms: u64,
}

/// Retry configuration for read requests
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries
    pub max_retries: usize,
    /// Base delay time
    pub base_delay: Duration,
    /// Maximum delay time
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: RPC_RETRY_COUNT,
            base_delay: RPC_RETRY_DELAY,
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

/// The distilled part of a transaction receipt the engine acts on.
#[derive(Debug, Clone, Copy)]
pub struct ReceiptInfo {
    /// Whether the transaction executed successfully.
    pub succeeded: bool,
    /// Block the transaction landed in, when the endpoint reports it.
    pub block_number: Option<u64>,
}

impl From<&TransactionReceipt> for ReceiptInfo {
    fn from(receipt: &TransactionReceipt) -> Self {
        Self { succeeded: receipt.status(), block_number: receipt.block_number }
    }
}

/// HTTP client for a single chain, providing reliable communication with
/// its RPC endpoints.
#[derive(Clone, Debug)]
pub struct LedgerClient {
    provider: RootProvider<Ethereum>,
    endpoint: Url,
    chain_id: u64,
    metrics: Arc<tokio::sync::Mutex<ProviderMetrics>>,
    retry_config: RetryConfig,
}

impl LedgerClient {
    /// Creates a client pinned to one endpoint.
    ///
    /// # Errors
    /// * Returns an error if the URL cannot be parsed or the HTTP client
    ///   cannot be built. No network traffic happens here.
    pub fn with_endpoint(chain_id: u64, rpc_url: &str) -> Result<Self> {
        debug!(target: "chainflow::client", chain_id, rpc_url, "creating ledger client");

        let url =
            Url::parse(rpc_url).with_context(|| format!("Failed to parse RPC URL: {rpc_url}"))?;

        let client_builder =
            ClientBuilder::new().no_proxy().use_rustls_tls().timeout(RPC_REQUEST_TIMEOUT);
        let client = client_builder.build().with_context(|| "Failed to build HTTP client")?;

        let provider: RootProvider<Ethereum> =
            ProviderBuilder::default().connect_reqwest(client, url.clone());

        Ok(Self {
            provider,
            endpoint: url,
            chain_id,
            metrics: Arc::new(tokio::sync::Mutex::new(ProviderMetrics::default())),
            retry_config: RetryConfig::default(),
        })
    }

    /// Creates a client on the profile's primary endpoint without probing it.
    pub fn connect(profile: &ChainProfile) -> Result<Self> {
        let first = profile
            .endpoints
            .first()
            .with_context(|| format!("No endpoints configured for chain {}", profile.chain_id))?;
        Self::with_endpoint(profile.chain_id, first)
    }

    /// Walks the profile's endpoint list in order and returns a client on
    /// the first endpoint that answers a block number query.
    pub async fn connect_with_failover(profile: &ChainProfile) -> Result<Self> {
        let mut last_error = None;
        for rpc_url in profile.endpoints {
            let client = match Self::with_endpoint(profile.chain_id, rpc_url) {
                Ok(client) => client,
                Err(err) => {
                    warn!(target: "chainflow::client", rpc_url, %err, "skipping malformed endpoint");
                    last_error = Some(err);
                    continue;
                }
            };
            match client.get_block_number().await {
                Ok(block) => {
                    debug!(
                        target: "chainflow::client",
                        chain_id = profile.chain_id,
                        rpc_url,
                        block,
                        "endpoint healthy"
                    );
                    return Ok(client);
                }
                Err(err) => {
                    warn!(target: "chainflow::client", rpc_url, %err, "endpoint unreachable, trying next");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| {
            anyhow::anyhow!("No endpoints configured for chain {}", profile.chain_id)
        }))
        .with_context(|| format!("All endpoints failed for chain {}", profile.chain_id))
    }

    /// Chain this client talks to.
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Endpoint this client settled on.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Gets the latest block number
    pub async fn get_block_number(&self) -> Result<u64> {
        let start = Instant::now();

        let result =
            self.retry_with_backoff(|| async { self.provider.get_block_number().await }).await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result.with_context(|| "Failed to get block number")
    }

    /// Gets the account's next nonce including transactions still in the
    /// mempool. Explicit sequencing starts from this value.
    pub async fn get_pending_nonce(&self, address: Address) -> Result<u64> {
        let start = Instant::now();

        let result = self
            .retry_with_backoff(|| async {
                self.provider.get_transaction_count(address).pending().await
            })
            .await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result
            .with_context(|| format!("Failed to get pending nonce for address: {address:?}"))
    }

    /// Gets the current gas price
    pub async fn get_gas_price(&self) -> Result<u128> {
        let start = Instant::now();

        let result =
            self.retry_with_backoff(|| async { self.provider.get_gas_price().await }).await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result.with_context(|| "Failed to get gas price")
    }

    /// Estimates gas for a call against latest state.
    pub async fn estimate_gas(&self, tx: &TransactionRequest) -> Result<u64> {
        let start = Instant::now();

        let result = self
            .retry_with_backoff(|| async { self.provider.estimate_gas(tx.clone()).await })
            .await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result.with_context(|| "Failed to estimate gas")
    }

    /// Get event logs - supports complete Filter object
    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        let start = Instant::now();

        let result =
            self.retry_with_backoff(|| async { self.provider.get_logs(filter).await }).await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result.with_context(|| "Failed to get logs with filter")
    }

    /// Fetches a receipt if the transaction has been mined. Single attempt,
    /// the confirmation watcher supplies the polling loop.
    pub async fn get_transaction_receipt(
        &self,
        hash: TxHash,
    ) -> Result<Option<TransactionReceipt>> {
        let start = Instant::now();

        let result = self.provider.get_transaction_receipt(hash).await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result.with_context(|| format!("Failed to get receipt for transaction: {hash}"))
    }

    /// Broadcasts a signed transaction envelope and returns its hash.
    /// Never retried.
    pub async fn send_envelope(&self, envelope: TxEnvelope) -> Result<TxHash> {
        let start = Instant::now();

        let result = self.provider.send_tx_envelope(envelope).await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        let pending = result.with_context(|| "Failed to send transaction")?;
        Ok(*pending.tx_hash())
    }

    /// Retries an operation with exponential backoff
    async fn retry_with_backoff<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, alloy_transport::TransportError>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.retry_config.max_retries {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(target: "chainflow::client", attempt = attempt + 1, "operation succeeded after retry");
                    }
                    return Ok(result);
                }
                Err(e) => {
                    last_error = Some(e);
                    if attempt < self.retry_config.max_retries {
                        let delay = std::cmp::min(
                            Duration::from_millis(
                                (self.retry_config.base_delay.as_millis() as f64 *
                                    self.retry_config.backoff_multiplier.powi(attempt as i32))
                                    as u64,
                            ),
                            self.retry_config.max_delay,
                        );
                        warn!(
                            target: "chainflow::client",
                            attempt = attempt + 1,
                            ?delay,
                            error = ?last_error,
                            "operation failed, retrying"
                        );
                        sleep(delay).await;
                    }
                }
            }
        }

        Err(anyhow::anyhow!(
            "Operation failed after {} attempts. Last error: {:?}",
            self.retry_config.max_retries + 1,
            last_error
        ))
    }

    /// Updates performance metrics with the result of an operation
    async fn update_metrics(&self, success: bool, latency: Duration) {
        let mut metrics = self.metrics.lock().await;
        metrics.requests_sent += 1;

        if success {
            metrics.requests_succeeded += 1;
        } else {
            metrics.requests_failed += 1;
        }

        // Record at least 1ms so fast local endpoints do not show as zero.
        let latency_ms = std::cmp::max(1, latency.as_millis() as u64);
        metrics.total_latency_ms += latency_ms;
    }

    /// Gets a copy of the current performance metrics
    pub async fn get_metrics(&self) -> ProviderMetrics {
        self.metrics.lock().await.clone()
    }

    /// Gets the success rate as a decimal (0.0 to 1.0), or 0.0 if no
    /// requests have been made
    pub async fn get_success_rate(&self) -> f64 {
        let metrics = self.metrics.lock().await;
        if metrics.requests_sent > 0 {
            metrics.requests_succeeded as f64 / metrics.requests_sent as f64
        } else {
            0.0
        }
    }
}

#[async_trait]
impl LedgerCall for LedgerClient {
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let start = Instant::now();

        let request = TransactionRequest {
            to: Some(TxKind::Call(to)),
            input: TransactionInput::new(input),
            ..Default::default()
        };
        let result =
            self.retry_with_backoff(|| async { self.provider.call(request.clone()).await }).await;

        self.update_metrics(result.is_ok(), start.elapsed()).await;

        result.with_context(|| format!("Contract call to {to} failed"))
    }
}
