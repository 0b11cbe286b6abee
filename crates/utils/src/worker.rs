//! Entry points exposed to the hosting process.
//!
//! [`email`] is invoked once per inbound message, [`fetch`] answers the
//! liveness check. Both are independent of the transport that delivered
//! the invocation (SMTP session, HTTP server or tests).

use std::{
    error::Error,
    fmt::Display,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::{
    ConfigError, DeliveryOutcome, DispatchError, Environment, Forwarder, ForwardingDispatcher,
    InboundMessage,
};

/// Body returned by the liveness endpoint.
pub const LIVENESS_BODY: &str = "Email handler is active";

/// Errors raised to the caller of [`email`].
#[derive(Debug)]
pub enum RelayError {
    /// Forwarding configuration is absent or incomplete.
    Config(ConfigError),
    /// Every destination refused the message.
    Dispatch(DispatchError),
}

impl Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Config(e) => write!(f, "{e}"),
            RelayError::Dispatch(e) => write!(f, "{e}"),
        }
    }
}

impl Error for RelayError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RelayError::Config(e) => Some(e),
            RelayError::Dispatch(e) => Some(e),
        }
    }
}

impl From<ConfigError> for RelayError {
    fn from(e: ConfigError) -> Self {
        RelayError::Config(e)
    }
}

impl From<DispatchError> for RelayError {
    fn from(e: DispatchError) -> Self {
        RelayError::Dispatch(e)
    }
}

/// Lifecycle handle passed alongside every invocation.
///
/// Work registered with [`wait_until`](Self::wait_until) keeps running after
/// the invocation returns, the host awaits it with [`settle`](Self::settle).
#[derive(Debug, Default)]
pub struct ExecutionContext {
    tasks: Mutex<JoinSet<()>>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers background work that may outlive the invocation.
    pub fn wait_until<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .spawn(future);
    }

    /// Waits for every registered background task to finish.
    pub async fn settle(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background task did not complete");
            }
        }
    }
}

/// Fixed response of the liveness endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessResponse {
    pub status: u16,
    pub body: &'static str,
}

/// Answers the liveness check, regardless of the request.
pub fn fetch() -> LivenessResponse {
    LivenessResponse {
        status: 200,
        body: LIVENESS_BODY,
    }
}

/// Handles one inbound email.
///
/// The forwarding configuration is validated before anything else, so a
/// missing `FORWARD_EMAIL` or `FALLBACK_EMAIL` is raised even for messages
/// that would otherwise be dropped. The execution context is accepted to
/// honor the host lifecycle and carries no forwarding logic.
pub async fn email(
    message: Option<&InboundMessage>,
    env: &Environment,
    forwarder: Arc<dyn Forwarder>,
    _ctx: &ExecutionContext,
) -> Result<DeliveryOutcome, RelayError> {
    let config = env.validate().inspect_err(|e| {
        if let ConfigError::MissingKeys(keys) = e {
            error!(missing = ?keys, "Error: Email configuration is missing");
        }
    })?;

    let dispatcher = ForwardingDispatcher::new(forwarder);
    Ok(dispatcher.dispatch(message, &config).await?)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tracing_test::traced_test;

    use super::*;
    use crate::{ForwardError, ForwardFuture, Rejection};

    /// Forwarder that fails the first `failures` calls and counts every call.
    struct FlakyForwarder {
        failures: usize,
        calls: Mutex<Vec<String>>,
    }

    impl FlakyForwarder {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Forwarder for FlakyForwarder {
        fn forward<'a>(&'a self, _message: &'a InboundMessage, address: &'a str) -> ForwardFuture<'a> {
            Box::pin(async move {
                let mut calls = self.calls.lock().unwrap();
                calls.push(address.to_string());
                if calls.len() <= self.failures {
                    let label = if calls.len() == 1 { "Primary" } else { "Fallback" };
                    return Err(ForwardError::Rejected(format!("{label} forward failed")));
                }
                Ok(())
            })
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn env() -> Environment {
        Environment::new(Some("forward@example.com"), Some("fallback@example.com"))
    }

    fn message() -> InboundMessage {
        InboundMessage::from_raw(
            "test@example.com",
            "recipient@example.com",
            "Subject: Test Email\r\n\r\nHello",
        )
    }

    #[test]
    fn test_fetch_liveness() {
        let response = fetch();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, "Email handler is active");
    }

    #[tokio::test]
    async fn test_email_forwards_to_primary() {
        let forwarder = FlakyForwarder::new(0);
        let ctx = ExecutionContext::new();

        let outcome = email(Some(&message()), &env(), forwarder.clone(), &ctx).await.unwrap();
        ctx.settle().await;

        assert_eq!(outcome, DeliveryOutcome::Delivered("forward@example.com".to_string()));
        assert_eq!(forwarder.calls(), vec!["forward@example.com"]);
    }

    #[tokio::test]
    async fn test_email_uses_fallback() {
        let forwarder = FlakyForwarder::new(1);
        let ctx = ExecutionContext::new();

        let outcome = email(Some(&message()), &env(), forwarder.clone(), &ctx).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Delivered("fallback@example.com".to_string()));
        assert_eq!(
            forwarder.calls(),
            vec!["forward@example.com", "fallback@example.com"]
        );
    }

    #[tokio::test]
    async fn test_email_both_forwards_fail() {
        let forwarder = FlakyForwarder::new(2);
        let ctx = ExecutionContext::new();

        let error = email(Some(&message()), &env(), forwarder.clone(), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(error, RelayError::Dispatch(_)));
        assert_eq!(error.to_string(), "Fallback forward failed");
        assert_eq!(forwarder.calls().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_email_missing_message() {
        let forwarder = FlakyForwarder::new(0);
        let ctx = ExecutionContext::new();

        let outcome = email(None, &env(), forwarder.clone(), &ctx).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Rejected(Rejection::MissingMessage));
        assert!(forwarder.calls().is_empty());
        assert!(logs_contain("Warning: message is missing. Exiting."));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_email_invalid_sender() {
        let forwarder = FlakyForwarder::new(0);
        let ctx = ExecutionContext::new();
        let message = InboundMessage::new(Some("invalid-email".to_string()), None, String::new());

        let outcome = email(Some(&message), &env(), forwarder.clone(), &ctx).await.unwrap();

        assert_eq!(outcome, DeliveryOutcome::Rejected(Rejection::InvalidSender));
        assert!(forwarder.calls().is_empty());
        assert!(logs_contain(
            "Warning: message.from is not a valid email address. Exiting."
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_email_missing_configuration() {
        let forwarder = FlakyForwarder::new(0);
        let ctx = ExecutionContext::new();

        let error = email(Some(&message()), &Environment::default(), forwarder.clone(), &ctx)
            .await
            .unwrap_err();

        assert!(matches!(error, RelayError::Config(ConfigError::MissingKeys(_))));
        assert_eq!(error.to_string(), "Email configuration is missing");
        assert!(forwarder.calls().is_empty());
        assert!(logs_contain("Email configuration is missing"));
    }

    #[tokio::test]
    async fn test_email_missing_configuration_precedes_validation() {
        let forwarder = FlakyForwarder::new(0);
        let ctx = ExecutionContext::new();
        let partial = Environment::new(Some("forward@example.com"), Some(""));

        let result = email(None, &partial, forwarder.clone(), &ctx).await;

        assert!(matches!(result, Err(RelayError::Config(_))));
        assert!(forwarder.calls().is_empty());
    }

    #[tokio::test]
    async fn test_execution_context_settles_background_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let ctx = ExecutionContext::new();

        for _ in 0..3 {
            let counter = counter.clone();
            ctx.wait_until(async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        ctx.settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
