//! Rate-limited request dispatcher.
//!
//! `submit` = classify → take budget → send with timeout → map status.
//! Budget is returned only when the request provably never left the
//! process; a timeout keeps it consumed because the exchange may have
//! counted the request.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::endpoints::classify;
use crate::error::{RestError, RestResult};
use crate::rate_limit::{BudgetPermit, RateBudget, WeightClass};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError, DEFAULT_TIMEOUT};

pub struct Dispatcher {
    transport: Arc<dyn HttpTransport>,
    budget: RateBudget,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(transport: Arc<dyn HttpTransport>, budget: RateBudget) -> Self {
        Self {
            transport,
            budget,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn budget(&self) -> &RateBudget {
        &self.budget
    }

    /// Reserve budget ahead of building the request.
    ///
    /// Used for signed transactions so a nonce is only allocated once the
    /// request is admitted.
    pub fn reserve(&self, class: WeightClass) -> RestResult<BudgetPermit> {
        self.budget.try_acquire(class)
    }

    pub async fn submit(&self, request: HttpRequest) -> RestResult<HttpResponse> {
        let permit = self.reserve(classify(&request.path))?;
        self.submit_reserved(permit, request).await
    }

    /// Send a request whose budget was already reserved.
    pub async fn submit_reserved(
        &self,
        permit: BudgetPermit,
        request: HttpRequest,
    ) -> RestResult<HttpResponse> {
        let class = permit.class();
        let path = request.path.clone();

        let outcome = tokio::time::timeout(self.timeout, self.transport.send(request)).await;

        let response = match outcome {
            Err(_elapsed) => {
                permit.commit();
                warn!(%path, timeout_ms = self.timeout.as_millis() as u64, "Request timed out");
                return Err(RestError::Timeout);
            }
            Ok(Err(TransportError::NotSent(reason))) => {
                // Permit dropped here: budget refunded
                drop(permit);
                debug!(%path, %reason, "Request never reached the network");
                return Err(RestError::NotSent(reason));
            }
            Ok(Err(TransportError::Timeout)) => {
                permit.commit();
                return Err(RestError::Timeout);
            }
            Ok(Err(TransportError::Io(reason))) => {
                permit.commit();
                return Err(RestError::Transport(reason));
            }
            Ok(Ok(response)) => {
                permit.commit();
                response
            }
        };

        if response.is_rate_limited() {
            let reset_at = self.budget.on_rate_limited(class, response.retry_after);
            let retry_after = reset_at.saturating_duration_since(tokio::time::Instant::now());
            return Err(RestError::RateLimitExceeded {
                class,
                reset_at,
                retry_after,
            });
        }

        if !response.is_success() {
            debug!(%path, status = response.status, "Remote error");
            return Err(RestError::Remote {
                status: response.status,
                body: response.body,
            });
        }

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoints;
    use crate::rate_limit::AccountTier;
    use crate::transport::FakeTransport;

    fn dispatcher(transport: Arc<FakeTransport>) -> Dispatcher {
        Dispatcher::new(transport, RateBudget::new(AccountTier::Standard))
    }

    #[tokio::test]
    async fn test_success_consumes_budget() {
        let transport = Arc::new(FakeTransport::new());
        transport.push_ok("{\"status\":\"ok\"}");
        let d = dispatcher(transport.clone());

        let resp = d.submit(HttpRequest::get(endpoints::STATUS)).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(d.budget().snapshot(WeightClass::Info).consumed, 100);
    }

    #[tokio::test]
    async fn test_remote_error_maps_status_and_body() {
        let transport = Arc::new(FakeTransport::new());
        transport.push(Ok(HttpResponse::status(400, "bad request")));
        let d = dispatcher(transport);

        match d.submit(HttpRequest::get(endpoints::ORDER)).await {
            Err(RestError::Remote { status, body }) => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad request");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_not_sent_refunds_budget() {
        let transport = Arc::new(FakeTransport::new());
        transport.push(Err(TransportError::NotSent("connection refused".into())));
        let d = dispatcher(transport);

        let err = d.submit(HttpRequest::get(endpoints::ACCOUNT)).await.unwrap_err();
        assert!(matches!(err, RestError::NotSent(_)));
        assert_eq!(d.budget().snapshot(WeightClass::AccountData).consumed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_keeps_budget_consumed() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_delay(Some(Duration::from_secs(30)));
        let d = dispatcher(transport).with_timeout(Duration::from_secs(1));

        let err = d.submit(HttpRequest::post(endpoints::SEND_TX)).await.unwrap_err();
        assert!(err.is_ambiguous());
        assert_eq!(d.budget().snapshot(WeightClass::Transaction).consumed, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_429_zeroes_class() {
        let transport = Arc::new(FakeTransport::new());
        transport.push(Ok(HttpResponse {
            status: 429,
            body: "Too Many Requests".into(),
            retry_after: Some(Duration::from_secs(90)),
        }));
        let d = dispatcher(transport.clone());

        let err = d.submit(HttpRequest::post(endpoints::SEND_TX)).await.unwrap_err();
        assert!(matches!(err, RestError::RateLimitExceeded { .. }));

        // Next request is rejected locally without reaching the transport
        let err = d.submit(HttpRequest::post(endpoints::SEND_TX)).await.unwrap_err();
        assert!(matches!(err, RestError::RateLimitExceeded { .. }));
        assert_eq!(transport.request_count(endpoints::SEND_TX), 1);

        tokio::time::advance(Duration::from_secs(91)).await;
        assert!(d.submit(HttpRequest::post(endpoints::SEND_TX)).await.is_ok());
    }

    #[tokio::test]
    async fn test_budget_exhaustion_blocks_before_network() {
        let transport = Arc::new(FakeTransport::new());
        let d = dispatcher(transport.clone());

        for _ in 0..60 {
            d.submit(HttpRequest::get(endpoints::ORDER_BOOK_DETAILS))
                .await
                .unwrap();
        }
        let err = d
            .submit(HttpRequest::get(endpoints::ORDER_BOOK_DETAILS))
            .await
            .unwrap_err();
        assert!(matches!(err, RestError::RateLimitExceeded { class: WeightClass::Default, .. }));
        assert_eq!(transport.request_count(endpoints::ORDER_BOOK_DETAILS), 60);
    }
}
