//! Fixed pool of RPC providers with per-provider pacing and call timeouts.
//!
//! The pool is an explicit value handed to the scheduler; worker `i` uses
//! provider `i % N`. Calls on one provider are spaced at least `pacing`
//! apart no matter how many workers share it.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fpmm_data::{FetchError, JsonRpcClient, RpcClient};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ConfigError;

pub struct PacedProvider {
    index: usize,
    client: Arc<dyn RpcClient>,
    pacing: Duration,
    timeout: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl PacedProvider {
    pub fn new(
        index: usize,
        client: Arc<dyn RpcClient>,
        pacing: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            index,
            client,
            pacing,
            timeout,
            next_slot: Mutex::new(None),
        }
    }

    /// Position in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn endpoint(&self) -> &str {
        self.client.endpoint()
    }

    /// Waits for this provider's next free call slot and reserves it.
    async fn pace(&self) {
        if self.pacing.is_zero() {
            return;
        }
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            tokio::time::sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.pacing);
    }

    async fn call<T, Fut>(&self, request: Fut) -> Result<T, FetchError>
    where
        Fut: Future<Output = Result<T, FetchError>>,
    {
        self.pace().await;
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.timeout)),
        }
    }

    pub async fn get_transaction(&self, hash: &str) -> Result<Value, FetchError> {
        self.call(self.client.get_transaction(hash)).await
    }

    pub async fn get_transaction_receipt(&self, hash: &str) -> Result<Value, FetchError> {
        self.call(self.client.get_transaction_receipt(hash)).await
    }

    pub async fn get_block(&self, number: u64) -> Result<Value, FetchError> {
        self.call(self.client.get_block(number)).await
    }
}

pub struct ProviderPool {
    providers: Vec<Arc<PacedProvider>>,
}

impl ProviderPool {
    /// # Errors
    /// Returns [`ConfigError::NoProviders`] for an empty client list.
    pub fn new(
        clients: Vec<Arc<dyn RpcClient>>,
        pacing: Duration,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        if clients.is_empty() {
            return Err(ConfigError::NoProviders);
        }
        let providers = clients
            .into_iter()
            .enumerate()
            .map(|(index, client)| Arc::new(PacedProvider::new(index, client, pacing, timeout)))
            .collect();
        Ok(Self { providers })
    }

    /// Builds one [`JsonRpcClient`] per endpoint.
    ///
    /// # Errors
    /// Returns an error if the list is empty or an endpoint is not a valid URL.
    pub fn from_endpoints(
        endpoints: &[String],
        pacing: Duration,
        timeout: Duration,
    ) -> eyre::Result<Self> {
        let clients = endpoints
            .iter()
            .map(|endpoint| {
                JsonRpcClient::new(endpoint)
                    .map(|client| Arc::new(client) as Arc<dyn RpcClient>)
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(clients, pacing, timeout)?)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Provider pinned to `worker`.
    pub fn for_worker(&self, worker: usize) -> Arc<PacedProvider> {
        Arc::clone(&self.providers[worker % self.providers.len()])
    }
}
