use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::{Message, client::IntoClientRequest};
use ulid::Ulid;

use holdfast::app::{App, Collaborators};
use holdfast::clock::ManualClock;
use holdfast::config::Config;
use holdfast::engine::Engine;
use holdfast::gateway::{GatewayPaymentStatus, InMemoryGateway};
use holdfast::identity::{ConsumerProfile, ProviderProfile, StaticDirectory};
use holdfast::signature::SignatureVerifier;
use holdfast::sweeper::TimeoutSweeper;

// 2024-01-01T00:00:00Z
const START: i64 = 1_704_067_200_000;
const PAYMENT_SECRET: &str = "test-payment-secret";
const WEBHOOK_SECRET: &str = "test-webhook-secret";

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    engine: Arc<Engine>,
    clock: Arc<ManualClock>,
    gateway: Arc<InMemoryGateway>,
    verifier: SignatureVerifier,
    provider: Ulid,
    other_provider: Ulid,
    alice: Ulid,
    bob: Ulid,
}

async fn start_test_server() -> TestServer {
    let dir = std::env::temp_dir().join(format!("holdfast_http_test_{}", Ulid::new()));
    let data_dir = dir.to_string_lossy().into_owned();
    let config = Config::from_lookup(|name| match name {
        "HOLDFAST_DATA_DIR" => Some(data_dir.clone()),
        "HOLDFAST_PAYMENT_SECRET" => Some(PAYMENT_SECRET.into()),
        "HOLDFAST_WEBHOOK_SECRET" => Some(WEBHOOK_SECRET.into()),
        _ => None,
    })
    .unwrap();

    let (provider, other_provider, alice, bob) = (Ulid::new(), Ulid::new(), Ulid::new(), Ulid::new());
    let directory = StaticDirectory::new();
    for (id, name) in [(provider, "Dr. Rao"), (other_provider, "Dr. Iyer")] {
        directory.add_provider(ProviderProfile {
            id,
            display_name: name.into(),
            hourly_rate: 6000,
            currency: "INR".into(),
        });
    }
    for (id, name) in [(alice, "Alice"), (bob, "Bob")] {
        directory.add_consumer(ConsumerProfile {
            id,
            name: name.into(),
            email: None,
        });
    }

    let clock = Arc::new(ManualClock::new(START));
    let gateway = Arc::new(InMemoryGateway::new());
    let app = App::start(
        &config,
        Collaborators {
            clock: clock.clone(),
            gateway: gateway.clone(),
            directory: Arc::new(directory),
        },
    )
    .unwrap();
    let engine = app.engine().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(app.serve(listener, std::future::pending::<()>()));

    TestServer {
        addr,
        client: reqwest::Client::new(),
        engine,
        clock,
        gateway,
        verifier: SignatureVerifier::new(PAYMENT_SECRET, WEBHOOK_SECRET),
        provider,
        other_provider,
        alice,
        bob,
    }
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn send(&self, req: reqwest::RequestBuilder) -> (u16, Value) {
        let resp = req.send().await.unwrap();
        let status = resp.status().as_u16();
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, path: &str, role: &str, actor: Ulid) -> (u16, Value) {
        self.send(
            self.client
                .get(self.url(path))
                .header("x-actor-role", role)
                .header("x-actor-id", actor.to_string()),
        )
        .await
    }

    async fn put(&self, path: &str, role: &str, actor: Ulid, body: Value) -> (u16, Value) {
        self.send(
            self.client
                .put(self.url(path))
                .header("x-actor-role", role)
                .header("x-actor-id", actor.to_string())
                .json(&body),
        )
        .await
    }

    async fn post(&self, path: &str, role: &str, actor: Ulid, body: Value) -> (u16, Value) {
        self.send(
            self.client
                .post(self.url(path))
                .header("x-actor-role", role)
                .header("x-actor-id", actor.to_string())
                .json(&body),
        )
        .await
    }

    async fn book(&self, consumer: Ulid, provider: Ulid, start: &str, duration: u32) -> (u16, Value) {
        self.post(
            "/bookings",
            "consumer",
            consumer,
            json!({
                "providerId": provider.to_string(),
                "sessionType": "video",
                "duration": duration,
                "scheduledDate": "2024-01-15",
                "startTime": start,
            }),
        )
        .await
    }

    /// Book a slot and open a gateway order for it. Returns (session id, order id).
    async fn booked_with_order(&self, start: &str) -> (String, String) {
        let (status, body) = self.book(self.alice, self.provider, start, 60).await;
        assert_eq!(status, 201, "{body}");
        let session_id = body["data"]["id"].as_str().unwrap().to_string();
        let (status, body) = self
            .post(
                "/payments/orders",
                "consumer",
                self.alice,
                json!({ "sessionId": session_id }),
            )
            .await;
        assert_eq!(status, 200, "{body}");
        let order_id = body["data"]["orderId"].as_str().unwrap().to_string();
        (session_id, order_id)
    }

    async fn verify(&self, order_id: &str, payment_id: &str, signature: &str) -> (u16, Value) {
        self.send(self.client.post(self.url("/payments/verify")).json(&json!({
            "externalOrderId": order_id,
            "externalPaymentId": payment_id,
            "signature": signature,
        })))
        .await
    }

    async fn webhook(&self, body: &str, signature: &str) -> (u16, Value) {
        self.send(
            self.client
                .post(self.url("/payments/webhook"))
                .header("x-webhook-signature", signature)
                .body(body.to_string()),
        )
        .await
    }
}

fn error_kind(body: &Value) -> &str {
    assert_eq!(body["success"], false, "{body}");
    body["error"]["kind"].as_str().unwrap()
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_clock() {
    let srv = start_test_server().await;
    let (status, body) = srv.send(srv.client.get(srv.url("/health"))).await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["now"], START);
}

#[tokio::test]
async fn overlapping_booking_is_rejected() {
    let srv = start_test_server().await;

    let (status, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    assert_eq!(status, 201, "{body}");
    let session = &body["data"];
    assert_eq!(session["status"], "pending");
    assert_eq!(session["paymentStatus"], "pending");
    assert_eq!(session["endTime"], "11:00:00");
    assert_eq!(session["price"], 6000);
    assert_eq!(session["currency"], "INR");

    let (status, body) = srv.book(srv.bob, srv.provider, "10:30", 60).await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "SlotConflict");

    // Adjacent slot and the other provider are fine.
    let (status, _) = srv.book(srv.bob, srv.provider, "11:00", 60).await;
    assert_eq!(status, 201);
    let (status, _) = srv.book(srv.bob, srv.other_provider, "10:30", 60).await;
    assert_eq!(status, 201);
}

#[tokio::test]
async fn booking_validation_errors() {
    let srv = start_test_server().await;

    let (status, body) = srv.book(srv.alice, srv.provider, "25:00", 60).await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "ValidationError");

    let (status, body) = srv.book(srv.alice, srv.provider, "23:30", 60).await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "ValidationError");

    let (status, body) = srv.book(srv.alice, Ulid::new(), "10:00", 60).await;
    assert_eq!(status, 404);
    assert_eq!(error_kind(&body), "NotFound");

    // Providers cannot book.
    let (status, body) = srv
        .post(
            "/bookings",
            "provider",
            srv.other_provider,
            json!({
                "providerId": srv.provider.to_string(),
                "sessionType": "video",
                "duration": 60,
                "scheduledDate": "2024-01-15",
                "startTime": "10:00",
            }),
        )
        .await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "Forbidden");

    let (status, body) = srv
        .send(
            srv.client
                .post(srv.url("/bookings"))
                .header("x-actor-role", "consumer")
                .header("x-actor-id", srv.alice.to_string())
                .header("content-type", "application/json")
                .body("{not json"),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "ValidationError");
}

#[tokio::test]
async fn missing_actor_is_forbidden() {
    let srv = start_test_server().await;
    let (status, body) = srv
        .send(srv.client.get(srv.url("/bookings/mine")))
        .await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "Forbidden");

    let (status, body) = srv
        .send(
            srv.client
                .get(srv.url("/bookings/mine"))
                .header("x-actor-role", "system")
                .header("x-actor-id", Ulid::new().to_string()),
        )
        .await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "Forbidden");
}

#[tokio::test]
async fn only_owning_provider_confirms() {
    let srv = start_test_server().await;
    let (_, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = srv
        .put(&format!("/bookings/{id}/confirm"), "provider", srv.other_provider, json!({}))
        .await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "Forbidden");

    let (status, body) = srv
        .put(&format!("/bookings/{id}/confirm"), "consumer", srv.alice, json!({}))
        .await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "Forbidden");

    let (status, body) = srv
        .put(&format!("/bookings/{id}/confirm"), "provider", srv.provider, json!({}))
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["data"]["status"], "confirmed");

    let (status, body) = srv
        .put(&format!("/bookings/{id}/confirm"), "provider", srv.provider, json!({}))
        .await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "InvalidTransition");

    let (status, body) = srv
        .put(&format!("/bookings/{id}/complete"), "provider", srv.provider, json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "completed");

    let (status, body) = srv
        .put(
            &format!("/bookings/{id}/cancel"),
            "consumer",
            srv.alice,
            json!({ "reason": "too late" }),
        )
        .await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "InvalidTransition");
}

#[tokio::test]
async fn consumer_cancels_with_reason() {
    let srv = start_test_server().await;
    let (_, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, body) = srv
        .put(&format!("/bookings/{id}/cancel"), "consumer", srv.alice, json!({ "reason": " " }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "ValidationError");

    let (status, body) = srv
        .put(
            &format!("/bookings/{id}/cancel"),
            "consumer",
            srv.alice,
            json!({ "reason": "schedule changed" }),
        )
        .await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["data"]["status"], "cancelled");
    assert_eq!(body["data"]["cancellation"]["reason"], "schedule changed");
    assert_eq!(body["data"]["cancellation"]["cancelledBy"], "consumer");

    // The slot is free again.
    let (status, _) = srv.book(srv.bob, srv.provider, "10:00", 60).await;
    assert_eq!(status, 201);
}

#[tokio::test]
async fn no_show_after_confirm() {
    let srv = start_test_server().await;
    let (_, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    srv.put(&format!("/bookings/{id}/confirm"), "provider", srv.provider, json!({}))
        .await;
    let (status, body) = srv
        .put(&format!("/bookings/{id}/no-show"), "provider", srv.provider, json!({}))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["status"], "no-show");
}

#[tokio::test]
async fn expired_hold_is_cancelled_by_sweep() {
    let srv = start_test_server().await;
    let (_, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    let id = body["data"]["id"].as_str().unwrap().to_string();
    assert_eq!(body["data"]["timeoutAt"], START + 5 * 60_000);

    srv.clock.advance(Duration::from_secs(6 * 60));
    let sweeper = TimeoutSweeper::new(srv.engine.clone(), Duration::from_secs(60));
    let report = sweeper.sweep_once().await;
    assert_eq!(report.expired, 1);

    let (status, body) = srv.get(&format!("/bookings/{id}"), "consumer", srv.alice).await;
    assert_eq!(status, 200);
    let session = &body["data"];
    assert_eq!(session["status"], "cancelled");
    assert_eq!(session["timeoutStatus"], "expired");
    assert_eq!(session["cancellation"]["cancelledBy"], "system");
    assert_eq!(session["cancellation"]["reason"], "expired");

    // A second sweep changes nothing.
    assert_eq!(sweeper.sweep_once().await.expired, 0);
}

#[tokio::test]
async fn repeated_verification_settles_once() {
    let srv = start_test_server().await;
    let (session_id, order_id) = srv.booked_with_order("10:00").await;
    srv.gateway
        .settle(&order_id, "P1", GatewayPaymentStatus::Captured)
        .unwrap();
    let signature = srv.verifier.sign_payment(&order_id, "P1");

    let (status, first) = srv.verify(&order_id, "P1", &signature).await;
    assert_eq!(status, 200, "{first}");
    assert_eq!(first["data"]["verified"], true);
    assert_eq!(first["data"]["duplicate"], false);

    let (status, second) = srv.verify(&order_id, "P1", &signature).await;
    assert_eq!(status, 200);
    assert_eq!(second["data"]["duplicate"], true);
    assert_eq!(first["data"]["transactionId"], second["data"]["transactionId"]);
    assert_eq!(srv.engine.transaction_count(), 1);

    let (_, body) = srv
        .get(&format!("/bookings/{session_id}"), "consumer", srv.alice)
        .await;
    assert_eq!(body["data"]["paymentStatus"], "paid");
    assert_eq!(body["data"]["transactionId"], first["data"]["transactionId"]);

    let tx_id = first["data"]["transactionId"].as_str().unwrap();
    let (status, tx) = srv
        .get(&format!("/transactions/{tx_id}"), "provider", srv.provider)
        .await;
    assert_eq!(status, 200);
    assert_eq!(tx["data"]["paymentId"], "P1");
    assert_eq!(tx["data"]["amount"], 6000);
    let (status, _) = srv
        .get(&format!("/transactions/{tx_id}"), "consumer", srv.bob)
        .await;
    assert_eq!(status, 403);

    let (_, mine) = srv.get("/bookings/mine", "consumer", srv.alice).await;
    assert_eq!(mine["data"]["totalSpent"], 6000);
}

#[tokio::test]
async fn tampered_signature_is_rejected() {
    let srv = start_test_server().await;
    let (session_id, order_id) = srv.booked_with_order("10:00").await;
    srv.gateway
        .settle(&order_id, "P1", GatewayPaymentStatus::Captured)
        .unwrap();
    let mut signature = srv.verifier.sign_payment(&order_id, "P1");
    signature.replace_range(0..2, if signature.starts_with("00") { "11" } else { "00" });

    let (status, body) = srv.verify(&order_id, "P1", &signature).await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "Unauthorized");
    assert_eq!(srv.engine.transaction_count(), 0);

    let (_, body) = srv
        .get(&format!("/bookings/{session_id}"), "consumer", srv.alice)
        .await;
    assert_eq!(body["data"]["paymentStatus"], "pending");
}

#[tokio::test]
async fn order_is_reused_per_session() {
    let srv = start_test_server().await;
    let (session_id, order_id) = srv.booked_with_order("10:00").await;
    let (status, body) = srv
        .post("/payments/orders", "consumer", srv.alice, json!({ "sessionId": session_id }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["orderId"], order_id.as_str());
    assert_eq!(srv.gateway.order(&order_id).unwrap().amount, 6000);

    let (status, body) = srv
        .post("/payments/orders", "consumer", srv.bob, json!({ "sessionId": session_id }))
        .await;
    assert_eq!(status, 403);
    assert_eq!(error_kind(&body), "Forbidden");
}

#[tokio::test]
async fn webhook_failure_releases_hold() {
    let srv = start_test_server().await;
    let (session_id, order_id) = srv.booked_with_order("10:00").await;
    srv.gateway
        .settle(&order_id, "P9", GatewayPaymentStatus::Failed)
        .unwrap();
    let body = json!({
        "event": "payment.failed",
        "payment": { "id": "P9", "orderId": order_id },
    })
    .to_string();

    let (status, _) = srv.webhook(&body, "deadbeef").await;
    assert_eq!(status, 400);

    let signature = srv.verifier.sign_webhook(body.as_bytes());
    let (status, first) = srv.webhook(&body, &signature).await;
    assert_eq!(status, 200, "{first}");
    assert_eq!(first["data"]["received"], true);
    let (status, again) = srv.webhook(&body, &signature).await;
    assert_eq!(status, 200);
    assert_eq!(first["data"]["transactionId"], again["data"]["transactionId"]);
    assert_eq!(srv.engine.transaction_count(), 1);

    let (_, session) = srv
        .get(&format!("/bookings/{session_id}"), "consumer", srv.alice)
        .await;
    assert_eq!(session["data"]["status"], "cancelled");
    assert_eq!(session["data"]["paymentStatus"], "failed");
    assert_eq!(session["data"]["cancellation"]["reason"], "payment_failed");

    let (status, _) = srv.book(srv.bob, srv.provider, "10:00", 60).await;
    assert_eq!(status, 201);
}

#[tokio::test]
async fn unknown_webhook_event_is_acknowledged() {
    let srv = start_test_server().await;
    let body = json!({ "event": "order.paid" }).to_string();
    let signature = srv.verifier.sign_webhook(body.as_bytes());
    let (status, resp) = srv.webhook(&body, &signature).await;
    assert_eq!(status, 200);
    assert_eq!(resp["data"]["ignored"], "order.paid");
}

#[tokio::test]
async fn provider_lists_own_sessions() {
    let srv = start_test_server().await;
    srv.book(srv.alice, srv.provider, "14:00", 60).await;
    srv.book(srv.bob, srv.provider, "09:00", 30).await;

    let path = format!("/providers/{}/sessions", srv.provider);
    let (status, body) = srv.get(&path, "provider", srv.provider).await;
    assert_eq!(status, 200);
    let sessions = body["data"].as_array().unwrap();
    assert_eq!(sessions.len(), 2);
    assert_eq!(sessions[0]["startTime"], "09:00:00");

    let (status, _) = srv.get(&path, "provider", srv.other_provider).await;
    assert_eq!(status, 403);

    let (status, body) = srv
        .get(&format!("/bookings/{}", Ulid::new()), "consumer", srv.alice)
        .await;
    assert_eq!(status, 404);
    assert_eq!(error_kind(&body), "NotFound");

    let (status, body) = srv.get("/bookings/not-a-ulid", "consumer", srv.alice).await;
    assert_eq!(status, 400);
    assert_eq!(error_kind(&body), "ValidationError");
}

#[tokio::test]
async fn websocket_receives_transitions() {
    let srv = start_test_server().await;
    let (_, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    let session_id = body["data"]["id"].as_str().unwrap().to_string();
    let booking_id = body["data"]["bookingId"].as_str().unwrap().to_string();

    let mut request = format!("ws://{}/bookings/{booking_id}/events", srv.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-actor-role", "consumer".parse().unwrap());
    request
        .headers_mut()
        .insert("x-actor-id", srv.alice.to_string().parse().unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();

    srv.put(
        &format!("/bookings/{session_id}/confirm"),
        "provider",
        srv.provider,
        json!({}),
    )
    .await;

    let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for notice")
        .unwrap()
        .unwrap();
    let text = match frame {
        Message::Text(text) => text,
        other => panic!("expected text frame, got {other:?}"),
    };
    let notice: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(notice["sessionId"], session_id.as_str());
    assert_eq!(notice["status"], "confirmed");
    assert_eq!(notice["reason"], "confirmed");
}

#[tokio::test]
async fn websocket_refuses_outsiders() {
    let srv = start_test_server().await;
    let (_, body) = srv.book(srv.alice, srv.provider, "10:00", 60).await;
    let booking_id = body["data"]["bookingId"].as_str().unwrap().to_string();

    let mut request = format!("ws://{}/bookings/{booking_id}/events", srv.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("x-actor-role", "consumer".parse().unwrap());
    request
        .headers_mut()
        .insert("x-actor-id", srv.bob.to_string().parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());
}
