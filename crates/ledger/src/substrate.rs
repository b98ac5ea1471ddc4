//! Shared Redis handle with per-call timeouts.

use std::time::Duration;

use redis::aio::ConnectionManager;

use crate::error::LedgerError;

/// Default round-trip budget for a single substrate call.
pub const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(250);

/// A cloneable handle to the Redis substrate.
///
/// `ConnectionManager` multiplexes and reconnects internally, so clones are
/// cheap and safe to hold per component.
#[derive(Clone)]
pub struct RedisSubstrate {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisSubstrate {
    /// Connect to the substrate at `url`.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        Self::connect_with_timeout(url, DEFAULT_OP_TIMEOUT).await
    }

    /// Connect with a custom per-call timeout.
    pub async fn connect_with_timeout(
        url: &str,
        op_timeout: Duration,
    ) -> Result<Self, LedgerError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self {
            manager,
            op_timeout,
        })
    }

    /// A fresh multiplexed connection handle for one operation.
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    /// Run a substrate future under the configured round-trip budget.
    pub async fn bounded<T, F>(&self, fut: F) -> Result<T, LedgerError>
    where
        F: std::future::Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(LedgerError::Timeout(self.op_timeout)),
        }
    }

    /// Liveness probe used by the health surface.
    pub async fn ping(&self) -> Result<(), LedgerError> {
        let mut conn = self.connection();
        self.bounded(async {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(pong)
        })
        .await?;
        Ok(())
    }
}
