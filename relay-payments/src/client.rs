use crate::error::{PaymentError, Result};
use crate::types::{CheckoutMode, CheckoutRequest, CheckoutSession, CheckoutStatus, WebhookEvent};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;

pub const DEFAULT_API_BASE_URL: &str = "https://api.stripe.com";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    mode: CheckoutMode,
}

impl StripeClient {
    pub fn new(api_key: &str) -> Self {
        Self {
            http: build_http_client(DEFAULT_TIMEOUT),
            api_key: api_key.to_string(),
            base_url: DEFAULT_API_BASE_URL.to_string(),
            mode: CheckoutMode::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim().trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.http = build_http_client(timeout);
        self
    }

    pub fn with_mode(mut self, mode: CheckoutMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn mode(&self) -> CheckoutMode {
        self.mode
    }

    /// Creates a hosted checkout session for a single price. Every call
    /// creates a new session; no idempotency key is sent.
    #[tracing::instrument(level = "info", skip_all, fields(price_id = %request.price_id))]
    pub async fn create_checkout_session(
        &self,
        request: &CheckoutRequest,
    ) -> Result<CheckoutSession> {
        require_non_empty("price_id", &request.price_id)?;
        require_non_empty("success_url", &request.success_url)?;
        require_non_empty("cancel_url", &request.cancel_url)?;

        let form = checkout_form(request, self.mode);
        let url = format!("{}/v1/checkout/sessions", self.base_url);
        let session: StripeSession = self.send_json(self.http.post(url).form(&form)).await?;

        let out = CheckoutSession {
            session_id: session.id,
            url: session.url.unwrap_or_default(),
        };
        tracing::info!(session_id = %out.session_id, "checkout session created");
        Ok(out)
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id))]
    pub async fn get_checkout_status(&self, session_id: &str) -> Result<CheckoutStatus> {
        require_path_segment("session_id", session_id)?;

        let url = format!("{}/v1/checkout/sessions/{session_id}", self.base_url);
        let session: StripeSession = self.send_json(self.http.get(url)).await?;

        Ok(CheckoutStatus {
            status: session.status.unwrap_or_default(),
            payment_status: session.payment_status.unwrap_or_default(),
            amount_total: session.amount_total.unwrap_or(0),
            currency: session.currency.unwrap_or_default(),
        })
    }

    /// Normalizes an inbound webhook delivery.
    ///
    /// The body is only trusted for the event id: the event itself is fetched
    /// back from the API, so a forged body can at most name an event that
    /// exists on the account.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn handle_webhook(&self, body: &[u8], signature: &str) -> Result<WebhookEvent> {
        if signature.trim().is_empty() {
            return Err(PaymentError::InvalidInput(
                "missing Stripe-Signature header".to_string(),
            ));
        }
        let envelope: StripeEventEnvelope = serde_json::from_slice(body)
            .map_err(|e| PaymentError::InvalidInput(format!("webhook body is not an event: {e}")))?;
        require_path_segment("event id", &envelope.id)?;

        let url = format!("{}/v1/events/{}", self.base_url, envelope.id);
        let event: StripeEvent = self.send_json(self.http.get(url)).await?;
        if event.id != envelope.id {
            return Err(PaymentError::ResponseFormat(format!(
                "event lookup returned id={} for id={}",
                event.id, envelope.id
            )));
        }

        let object = event.data.object;
        let out = WebhookEvent {
            event_type: event.event_type,
            session_id: object.id.unwrap_or_default(),
            payment_status: object.payment_status.unwrap_or_default(),
        };
        tracing::info!(
            event_id = %event.id,
            event_type = %out.event_type,
            session_id = %out.session_id,
            "webhook event resolved"
        );
        Ok(out)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.bearer_auth(&self.api_key).send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(api_error(status.as_u16(), &body));
        }
        Ok(serde_json::from_str(&body)?)
    }
}

fn build_http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!(%e, "reqwest client build failed; falling back to default client");
            reqwest::Client::new()
        })
}

fn checkout_form(request: &CheckoutRequest, mode: CheckoutMode) -> Vec<(String, String)> {
    let mut form = vec![
        ("mode".to_string(), mode.as_str().to_string()),
        ("line_items[0][price]".to_string(), request.price_id.clone()),
        ("line_items[0][quantity]".to_string(), "1".to_string()),
        ("success_url".to_string(), request.success_url.clone()),
        ("cancel_url".to_string(), request.cancel_url.clone()),
    ];
    for (key, value) in &request.metadata {
        form.push((format!("metadata[{key}]"), value.clone()));
    }
    form
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(PaymentError::InvalidInput(format!("{field} is required")));
    }
    Ok(())
}

// Ids are interpolated into URL paths.
fn require_path_segment(field: &str, value: &str) -> Result<()> {
    require_non_empty(field, value)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(PaymentError::InvalidInput(format!(
            "{field} contains invalid characters: {value:?}"
        )));
    }
    Ok(())
}

fn api_error(status: u16, body: &str) -> PaymentError {
    let message = serde_json::from_str::<StripeErrorBody>(body)
        .ok()
        .and_then(|b| b.error.message)
        .unwrap_or_else(|| body.to_string());
    PaymentError::Api { status, message }
}

#[derive(Debug, Deserialize)]
struct StripeSession {
    id: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeEventEnvelope {
    id: String,
}

#[derive(Debug, Deserialize)]
struct StripeEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: StripeEventData,
}

#[derive(Debug, Deserialize)]
struct StripeEventData {
    object: StripeEventObject,
}

#[derive(Debug, Deserialize)]
struct StripeEventObject {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payment_status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Form, Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeStripe {
        created: Arc<AtomicUsize>,
        forms: Arc<Mutex<Vec<Vec<(String, String)>>>>,
        auth: Arc<Mutex<Vec<String>>>,
    }

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind test listener");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    fn fake_router(fake: FakeStripe) -> Router {
        Router::new()
            .route("/v1/checkout/sessions", post(create_session))
            .route("/v1/checkout/sessions/{id}", get(get_session))
            .route("/v1/events/{id}", get(get_event))
            .with_state(fake)
    }

    async fn create_session(
        State(fake): State<FakeStripe>,
        headers: HeaderMap,
        Form(form): Form<Vec<(String, String)>>,
    ) -> Json<Value> {
        if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            fake.auth.lock().expect("auth lock").push(auth.to_string());
        }
        fake.forms.lock().expect("forms lock").push(form);
        let n = fake.created.fetch_add(1, Ordering::SeqCst);
        Json(json!({
            "id": format!("cs_test_{n}"),
            "object": "checkout.session",
            "url": format!("https://checkout.stripe.com/c/pay/cs_test_{n}"),
        }))
    }

    async fn get_session(Path(id): Path<String>) -> (StatusCode, Json<Value>) {
        if id == "cs_missing" {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({
                    "error": {"type": "invalid_request_error", "message": "No such checkout.session: 'cs_missing'"}
                })),
            );
        }
        (
            StatusCode::OK,
            Json(json!({
                "id": id,
                "status": "complete",
                "payment_status": "paid",
                "amount_total": 1999,
                "currency": "usd"
            })),
        )
    }

    async fn get_event(Path(id): Path<String>) -> Json<Value> {
        Json(json!({
            "id": id,
            "type": "checkout.session.completed",
            "data": {"object": {"id": "cs_test_0", "object": "checkout.session", "payment_status": "paid"}}
        }))
    }

    fn request() -> CheckoutRequest {
        let mut metadata = BTreeMap::new();
        metadata.insert("planId".to_string(), "premium".to_string());
        metadata.insert("userId".to_string(), "u-1".to_string());
        CheckoutRequest {
            price_id: "price_123".to_string(),
            success_url: "https://app.example/ok".to_string(),
            cancel_url: "https://app.example/cancel".to_string(),
            metadata,
        }
    }

    #[test]
    fn checkout_form_flattens_line_item_and_metadata() {
        let form = checkout_form(&request(), CheckoutMode::Subscription);
        let field = |k: &str| {
            form.iter()
                .find(|(key, _)| key == k)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(field("mode"), Some("subscription"));
        assert_eq!(field("line_items[0][price]"), Some("price_123"));
        assert_eq!(field("line_items[0][quantity]"), Some("1"));
        assert_eq!(field("metadata[planId]"), Some("premium"));
        assert_eq!(field("metadata[userId]"), Some("u-1"));
    }

    #[test]
    fn api_error_prefers_stripe_message() {
        let err = api_error(401, r#"{"error":{"message":"Invalid API Key provided"}}"#);
        match err {
            PaymentError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "Invalid API Key provided");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        let raw = api_error(502, "bad gateway");
        assert_eq!(raw.to_string(), "stripe api error (status 502): bad gateway");
    }

    #[test]
    fn path_segments_reject_traversal() {
        assert!(require_path_segment("session_id", "cs_test_a1").is_ok());
        assert!(require_path_segment("session_id", "../v1/charges").is_err());
        assert!(require_path_segment("session_id", " ").is_err());
    }

    #[tokio::test]
    async fn create_checkout_session_is_not_idempotent() {
        let fake = FakeStripe::default();
        let base = spawn_server(fake_router(fake.clone())).await;
        let client = StripeClient::new("sk_test_abc").with_base_url(&base);

        let first = client
            .create_checkout_session(&request())
            .await
            .expect("first session");
        let second = client
            .create_checkout_session(&request())
            .await
            .expect("second session");

        assert_ne!(first.session_id, second.session_id);
        assert_eq!(first.url, "https://checkout.stripe.com/c/pay/cs_test_0");
        assert_eq!(fake.created.load(Ordering::SeqCst), 2);
        let auth = fake.auth.lock().expect("auth lock");
        assert!(auth.iter().all(|a| a == "Bearer sk_test_abc"));
        let forms = fake.forms.lock().expect("forms lock");
        assert!(forms[0].contains(&("mode".to_string(), "payment".to_string())));
    }

    #[tokio::test]
    async fn create_checkout_session_validates_before_request() {
        let client = StripeClient::new("sk_test_abc").with_base_url("http://127.0.0.1:9");
        let mut req = request();
        req.price_id = String::new();
        let err = client
            .create_checkout_session(&req)
            .await
            .expect_err("empty price id");
        assert!(matches!(err, PaymentError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn get_checkout_status_maps_fields() {
        let base = spawn_server(fake_router(FakeStripe::default())).await;
        let client = StripeClient::new("sk_test_abc").with_base_url(&base);

        let status = client
            .get_checkout_status("cs_test_9")
            .await
            .expect("status");
        assert_eq!(
            status,
            CheckoutStatus {
                status: "complete".to_string(),
                payment_status: "paid".to_string(),
                amount_total: 1999,
                currency: "usd".to_string(),
            }
        );

        let err = client
            .get_checkout_status("cs_missing")
            .await
            .expect_err("missing session");
        assert!(err.to_string().contains("No such checkout.session"));
    }

    #[tokio::test]
    async fn handle_webhook_resolves_event_through_api() {
        let base = spawn_server(fake_router(FakeStripe::default())).await;
        let client = StripeClient::new("sk_test_abc").with_base_url(&base);

        let body = br#"{"id":"evt_1","type":"checkout.session.expired"}"#;
        let event = client
            .handle_webhook(body, "t=1,v1=abc")
            .await
            .expect("webhook");
        assert_eq!(event.event_type, "checkout.session.completed");
        assert_eq!(event.session_id, "cs_test_0");
        assert_eq!(event.payment_status, "paid");
    }

    #[tokio::test]
    async fn handle_webhook_requires_signature_and_event_body() {
        let client = StripeClient::new("sk_test_abc").with_base_url("http://127.0.0.1:9");
        let missing_sig = client
            .handle_webhook(br#"{"id":"evt_1"}"#, "")
            .await
            .expect_err("no signature");
        assert!(matches!(missing_sig, PaymentError::InvalidInput(_)));

        let bad_body = client
            .handle_webhook(b"not json", "t=1,v1=abc")
            .await
            .expect_err("bad body");
        assert!(matches!(bad_body, PaymentError::InvalidInput(_)));
    }
}
