//! Timeout configuration for connection dispatch.
//!
//! # Timeout Types
//!
//! - **connect**: socket connect + proxy tunnel + TLS handshake, applied to each
//!   route candidate separately
//! - **dispatch**: optional absolute bound on the whole fallback sequence
//!
//! # Usage
//!
//! ```rust
//! use linkpool::Timeouts;
//! use std::time::Duration;
//!
//! let timeouts = Timeouts::defaults()
//!     .connect(Duration::from_secs(5))
//!     .dispatch(Duration::from_secs(30));
//! assert_eq!(timeouts.connect, Some(Duration::from_secs(5)));
//! ```

use std::time::Duration;

/// Timeout configuration for establishing connections.
///
/// All timeouts are optional. When `None`, no timeout is applied for that phase.
///
/// # Timeout Semantics
///
/// - **connect**: Does NOT span candidates. Every route candidate gets a fresh
///   deadline, so a long fallback sequence does not shrink the per-attempt budget.
/// - **dispatch**: Does NOT reset. Caps pool lookup plus every candidate attempt.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for one candidate: TCP connect, CONNECT tunnel and TLS handshake.
    ///
    /// Default: 10s for defaults()
    pub connect: Option<Duration>,

    /// Deadline for one whole dispatch, across every candidate.
    ///
    /// Default: None
    pub dispatch: Option<Duration>,
}

impl Timeouts {
    /// Create a new Timeouts with all timeouts set to None.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sensible defaults.
    ///
    /// - connect: 10s
    /// - dispatch: None
    pub fn defaults() -> Self {
        Self {
            connect: Some(Duration::from_secs(10)),
            dispatch: None,
        }
    }

    /// Set per-candidate connect timeout.
    pub fn connect(mut self, timeout: Duration) -> Self {
        self.connect = Some(timeout);
        self
    }

    /// Set overall dispatch deadline.
    pub fn dispatch(mut self, timeout: Duration) -> Self {
        self.dispatch = Some(timeout);
        self
    }

    /// Disable connect timeout.
    pub fn no_connect_timeout(mut self) -> Self {
        self.connect = None;
        self
    }

    /// Disable dispatch deadline.
    pub fn no_dispatch_timeout(mut self) -> Self {
        self.dispatch = None;
        self
    }
}

/// Run `fut` under an optional deadline, mapping expiry with `on_elapsed`.
pub(crate) async fn with_deadline<F, T>(
    deadline: Option<Duration>,
    on_elapsed: impl FnOnce(Duration) -> crate::Error,
    fut: F,
) -> crate::Result<T>
where
    F: std::future::Future<Output = crate::Result<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(on_elapsed(limit)),
        },
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let t = Timeouts::defaults();
        assert_eq!(t.connect, Some(Duration::from_secs(10)));
        assert_eq!(t.dispatch, None);
    }

    #[test]
    fn test_builder_pattern() {
        let t = Timeouts::new()
            .connect(Duration::from_secs(5))
            .dispatch(Duration::from_secs(60));
        assert_eq!(t.connect, Some(Duration::from_secs(5)));
        assert_eq!(t.dispatch, Some(Duration::from_secs(60)));

        let t = t.no_connect_timeout().no_dispatch_timeout();
        assert_eq!(t, Timeouts::new());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_deadline_elapses() {
        let result: crate::Result<()> = with_deadline(
            Some(Duration::from_millis(50)),
            crate::Error::ConnectTimeout,
            async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            },
        )
        .await;
        assert!(matches!(result, Err(crate::Error::ConnectTimeout(d)) if d == Duration::from_millis(50)));
    }

    #[tokio::test]
    async fn test_with_deadline_unbounded() {
        let result = with_deadline(None, crate::Error::DispatchTimeout, async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
