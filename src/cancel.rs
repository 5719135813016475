//! Caller-side deadlines and cancellation.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// An optional point in time plus an optional cancellation token.
///
/// Operations taking a `&Deadline` return [`Error::Cancelled`] when either
/// fires. An already expired deadline fails before any network call.
#[derive(Clone, Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
    token: Option<CancellationToken>,
}

impl Deadline {
    /// Never expires.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            at: Some(Instant::now() + duration),
            token: None,
        }
    }

    pub fn at(instant: Instant) -> Self {
        Self {
            at: Some(instant),
            token: None,
        }
    }

    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
            || self.token.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Time left, or `None` when there is no time bound.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the deadline has already passed.
    pub fn check(&self) -> Result<()> {
        if self.is_expired() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` until it completes or the deadline fires, whichever is
    /// first. On expiry `fut` is dropped.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check()?;

        let sleep = async {
            match self.at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        let cancelled = async {
            match &self.token {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            out = fut => Ok(out),
            _ = sleep => Err(Error::Cancelled),
            _ = cancelled => Err(Error::Cancelled),
        }
    }
}
