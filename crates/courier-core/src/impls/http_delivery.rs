//! HttpDelivery - webhook POST による DeliveryStrategy
//!
//! Each event type is routed to one URL. Every request carries the
//! idempotency token and the event id as headers so the receiver can drop
//! duplicates.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::ports::{DeliveryError, DeliveryOutcome, DeliveryRequest, DeliveryStrategy};

/// Header naming the event type on outbound calls.
pub const EVENT_TYPE_HEADER: &str = "X-Event-Type";

#[derive(Debug, Clone)]
pub struct HttpDelivery {
    client: Client,
    routes: HashMap<String, String>,
    client_errors_are_transient: bool,
}

impl HttpDelivery {
    pub fn new(timeout: Duration) -> Result<Self, DeliveryError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            routes: HashMap::new(),
            client_errors_are_transient: false,
        })
    }

    pub fn from_config(config: &DispatchConfig) -> Result<Self, DeliveryError> {
        let mut delivery = Self::new(config.delivery_timeout())?
            .client_errors_are_transient(config.client_errors_are_transient);
        for (event_type, url) in &config.webhook_routes {
            delivery = delivery.route(event_type.clone(), url.clone());
        }
        Ok(delivery)
    }

    pub fn route(mut self, event_type: impl Into<String>, url: impl Into<String>) -> Self {
        self.routes.insert(event_type.into(), url.into());
        self
    }

    pub fn client_errors_are_transient(mut self, transient: bool) -> Self {
        self.client_errors_are_transient = transient;
        self
    }

    /// Event types this strategy can deliver.
    pub fn event_types(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    fn classify(&self, status: u16) -> DeliveryOutcome {
        match DeliveryOutcome::from_status(status) {
            DeliveryOutcome::Permanent(msg)
                if self.client_errors_are_transient && (400..500).contains(&status) =>
            {
                DeliveryOutcome::Transient(msg)
            }
            outcome => outcome,
        }
    }

    async fn post(&self, url: &str, request: &DeliveryRequest) -> Result<u16, DeliveryError> {
        let mut builder = self
            .client
            .post(url)
            .header(CONTENT_TYPE, "application/json")
            .header(EVENT_TYPE_HEADER, &request.event_type);
        for (name, value) in request.headers() {
            builder = builder.header(name, value);
        }

        let response = builder
            .body(request.payload.clone())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else if e.is_builder() {
                    DeliveryError::InvalidRequest(e.to_string())
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;
        Ok(response.status().as_u16())
    }
}

#[async_trait]
impl DeliveryStrategy for HttpDelivery {
    async fn deliver(&self, request: &DeliveryRequest) -> DeliveryOutcome {
        let Some(url) = self.routes.get(&request.event_type) else {
            return DeliveryOutcome::Permanent(format!(
                "no webhook route for {}",
                request.event_type
            ));
        };

        match self.post(url, request).await {
            Ok(status) => {
                debug!(
                    event_id = %request.event_id,
                    event_type = %request.event_type,
                    status,
                    "webhook responded"
                );
                self.classify(status)
            }
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rstest::rstest;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::domain::{NewWorkItem, WorkItem, WorkItemId};
    use crate::ports::{EVENT_ID_HEADER, IDEMPOTENCY_KEY_HEADER};

    const EVENT: &str = "order.shipped.v1";

    fn request() -> DeliveryRequest {
        let item = WorkItem::from_new(
            WorkItemId::generate(),
            NewWorkItem::new("order", "42", EVENT, br#"{"order":"42"}"#.to_vec()),
            Utc::now(),
        );
        DeliveryRequest::for_item(&item)
    }

    async fn server_returning(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/orders"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&server)
            .await;
        server
    }

    fn delivery(server: &MockServer) -> HttpDelivery {
        HttpDelivery::new(Duration::from_secs(2))
            .unwrap()
            .route(EVENT, format!("{}/hooks/orders", server.uri()))
    }

    #[tokio::test]
    async fn posts_payload_with_dedup_headers() {
        let server = MockServer::start().await;
        let req = request();
        Mock::given(method("POST"))
            .and(path("/hooks/orders"))
            .and(header(IDEMPOTENCY_KEY_HEADER, req.idempotency_token.as_str()))
            .and(header(EVENT_ID_HEADER, req.event_id.to_storage().as_str()))
            .and(header(EVENT_TYPE_HEADER, EVENT))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        assert_eq!(delivery(&server).deliver(&req).await, DeliveryOutcome::Delivered);
    }

    #[rstest]
    #[case(409, DeliveryOutcome::AlreadyApplied)]
    #[case(422, DeliveryOutcome::AlreadyApplied)]
    #[case(503, DeliveryOutcome::Transient("status 503".into()))]
    #[case(429, DeliveryOutcome::Transient("status 429".into()))]
    #[case(400, DeliveryOutcome::Permanent("status 400".into()))]
    #[tokio::test]
    async fn statuses_are_classified(#[case] status: u16, #[case] expected: DeliveryOutcome) {
        let server = server_returning(status).await;
        assert_eq!(delivery(&server).deliver(&request()).await, expected);
    }

    #[tokio::test]
    async fn client_errors_can_be_made_retryable() {
        let server = server_returning(404).await;
        let outcome = delivery(&server)
            .client_errors_are_transient(true)
            .deliver(&request())
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Transient(_)));
    }

    #[tokio::test]
    async fn slow_receiver_times_out_as_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;
        let delivery = HttpDelivery::new(Duration::from_millis(100))
            .unwrap()
            .route(EVENT, format!("{}/hooks/orders", server.uri()));

        assert_eq!(
            delivery.deliver(&request()).await,
            DeliveryOutcome::Transient("delivery timed out".into())
        );
    }

    #[tokio::test]
    async fn unrouted_event_type_is_permanent() {
        let delivery = HttpDelivery::new(Duration::from_secs(1)).unwrap();
        assert!(matches!(
            delivery.deliver(&request()).await,
            DeliveryOutcome::Permanent(_)
        ));
    }
}
