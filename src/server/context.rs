//! Request Context
//!
//! Carries the per-request state the middleware consults before and during
//! every operation: the authorization marker, errors deferred by the
//! authorization middleware, the caller's own catalog client for
//! auto-provisioning, and cancellation.

use crate::catalog::CatalogClient;
use crate::server::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request state threaded through every middleware operation
#[derive(Default, Clone)]
pub struct RequestContext {
    auth_completed: bool,
    deferred: HashMap<(String, String), Arc<Error>>,
    user_client: Option<Arc<dyn CatalogClient>>,
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context for a request whose authorization has completed
    pub fn authorized() -> Self {
        Self {
            auth_completed: true,
            ..Default::default()
        }
    }

    /// A context without the authorization marker; every operation on it
    /// fails until authorization middleware marks it complete
    pub fn unauthorized() -> Self {
        Self::default()
    }

    /// Record an error for `namespace/name`, surfaced before any operation
    /// on that repository runs
    pub fn defer_error(&mut self, namespace: &str, name: &str, err: Error) {
        self.deferred
            .insert((namespace.to_string(), name.to_string()), Arc::new(err));
    }

    /// Attach the requesting user's catalog client, enabling image stream
    /// auto-provisioning with the user's credentials
    pub fn with_user_client(mut self, client: Arc<dyn CatalogClient>) -> Self {
        self.user_client = Some(client);
        self
    }

    /// Bound the request by a deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Tie the request to an external cancellation source
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub(crate) fn user_client(&self) -> Option<&Arc<dyn CatalogClient>> {
        self.user_client.as_ref()
    }

    /// Fail fast when the request was cancelled or ran past its deadline
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::Cancelled);
            }
        }
        Ok(())
    }

    /// Surface any error the authorization middleware recorded for this
    /// repository; an absent authorization marker is itself an error.
    pub fn check_pending_errors(&self, namespace: &str, name: &str) -> Result<()> {
        if !self.auth_completed {
            return Err(Error::AuthIncomplete);
        }
        if let Some(err) = self
            .deferred
            .get(&(namespace.to_string(), name.to_string()))
        {
            tracing::debug!("found deferred error for {}/{}: {}", namespace, name, err);
            return Err(Error::Deferred(err.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_missing_auth_marker_is_an_error() {
        let ctx = RequestContext::unauthorized();
        assert!(matches!(
            ctx.check_pending_errors("ns", "app"),
            Err(Error::AuthIncomplete)
        ));
    }

    #[test]
    fn test_deferred_errors_surface_for_their_repository() {
        let mut ctx = RequestContext::authorized();
        ctx.defer_error("ns", "app", Error::Denied("pull access denied".into()));

        let err = ctx.check_pending_errors("ns", "app").unwrap_err();
        assert_eq!(err.to_string(), "denied: pull access denied");

        assert!(ctx.check_pending_errors("ns", "other").is_ok());
    }

    #[test]
    fn test_deadline_expiry_cancels() {
        let ctx = RequestContext::authorized()
            .with_deadline(Instant::now() - Duration::from_secs(1));
        assert!(matches!(ctx.check_cancelled(), Err(Error::Cancelled)));
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let ctx = RequestContext::authorized().with_cancellation(token.clone());
        assert!(ctx.check_cancelled().is_ok());
        token.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(Error::Cancelled)));
    }
}
