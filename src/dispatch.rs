//! Request-to-connection resolution.
//!
//! A dispatch looks in the pool first. On a miss it walks the route
//! candidates strictly in order, establishing one connection at a time, and
//! admits the first that succeeds.

use http::Uri;
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::endpoint::EndpointIdentity;
use crate::error::{Error, Result};
use crate::pool::{Connection, ConnectionPool, Lease};
use crate::route::RouteEnumerator;
use crate::timeouts::with_deadline;

/// Hands out pooled connections for request targets.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    pool: ConnectionPool,
    config: ClientConfig,
}

impl Dispatcher {
    pub fn new(pool: ConnectionPool, config: ClientConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Lease a connection for `uri`.
    pub async fn dispatch(&self, uri: &Uri) -> Result<Lease> {
        let identity = self.config.identity_for(uri)?;
        self.dispatch_identity(identity).await
    }

    /// Lease a connection for an already built identity.
    ///
    /// Bounded by the configured dispatch timeout, if any.
    pub async fn dispatch_identity(&self, identity: EndpointIdentity) -> Result<Lease> {
        with_deadline(
            self.config.timeouts().dispatch,
            Error::DispatchTimeout,
            self.run(identity),
        )
        .await
    }

    /// Like [`Dispatcher::dispatch_identity`], giving up with
    /// [`Error::Cancelled`] once `cancel` fires. A connection still being
    /// established is dropped and never admitted.
    pub async fn dispatch_cancellable(
        &self,
        identity: EndpointIdentity,
        cancel: &CancellationToken,
    ) -> Result<Lease> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Dispatch: cancelled for {}", identity.authority());
                Err(Error::Cancelled)
            }
            result = self.dispatch_identity(identity.clone()) => result,
        }
    }

    async fn run(&self, identity: EndpointIdentity) -> Result<Lease> {
        if let Some(lease) = self.pool.acquire(&identity)? {
            return Ok(lease);
        }

        let connect_timeout = self.config.timeouts().connect;
        let mut routes = RouteEnumerator::new(identity.clone()).with_resolve_timeout(connect_timeout);
        let mut attempts = 0;
        let mut last_error = None;

        while let Some(candidate) = routes.next().await {
            attempts += 1;
            tracing::debug!(
                "Dispatch: {} attempt {} via {}",
                identity.authority(),
                attempts,
                candidate
            );

            let result = match Connection::establish(candidate.clone(), &identity, connect_timeout).await {
                Ok(conn) => self.register(&identity, conn),
                Err(e) => Err(e),
            };
            match result {
                Ok(lease) => return Ok(lease),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::debug!(
                        "Dispatch: {} candidate {} failed: {}",
                        identity.authority(),
                        candidate,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        let last = last_error
            .or_else(|| routes.take_last_error())
            .unwrap_or_else(|| Error::resolution(identity.host(), "no routes"));
        tracing::warn!(
            "Dispatch: {} exhausted after {} attempt(s): {}",
            identity.authority(),
            attempts,
            last
        );
        Err(Error::Exhausted {
            attempts,
            last: Box::new(last),
        })
    }

    /// Admit a new connection, unless a concurrent dispatch already pooled a
    /// multiplexed one we can share.
    fn register(&self, identity: &EndpointIdentity, conn: Connection) -> Result<Lease> {
        if conn.is_multiplexed() {
            if let Some(lease) = self.pool.acquire(identity)? {
                tracing::debug!(
                    "Dispatch: {} coalesced onto connection {}, dropping {}",
                    identity.authority(),
                    lease.id(),
                    conn.id()
                );
                conn.close();
                return Ok(lease);
            }
        }
        self.pool.admit(conn)
    }
}
