//! Auto-registration of unknown symbols.
//!
//! The upstream probe runs with no database resources held; validation can
//! take seconds under provider latency, and holding a connection across it
//! would starve the pool. The insert happens afterwards in its own
//! transaction.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use crate::error::ServiceError;
use crate::provider::{ProviderError, UpstreamProvider};
use crate::store::symbols::SymbolStore;

pub struct SymbolRegistry {
    symbols: SymbolStore,
    provider: Arc<dyn UpstreamProvider>,
    enabled: bool,
    probe_timeout: Duration,
}

impl SymbolRegistry {
    pub fn new(
        symbols: SymbolStore,
        provider: Arc<dyn UpstreamProvider>,
        enabled: bool,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            symbols,
            provider,
            enabled,
            probe_timeout,
        }
    }

    /// Make sure `symbol` exists in the registry, probing upstream for
    /// unknown ones when auto-registration is enabled. Unknown or invalid
    /// symbols reject with `SYMBOL_NOT_FOUND`.
    pub async fn ensure_registered(&self, symbol: &str) -> Result<(), ServiceError> {
        if self.symbols.get(symbol).await?.is_some() {
            return Ok(());
        }
        if !self.enabled {
            return Err(ServiceError::SymbolNotFound(symbol.to_string()));
        }

        let valid = timeout(self.probe_timeout, self.provider.validate_symbol(symbol))
            .await
            .map_err(|_| ServiceError::Upstream(ProviderError::Timeout))??;
        if !valid {
            return Err(ServiceError::SymbolNotFound(symbol.to_string()));
        }

        self.symbols.register(symbol).await?;
        tracing::info!(%symbol, "auto-registered symbol");
        Ok(())
    }
}
