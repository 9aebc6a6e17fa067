//! HTTP surface tests
//!
//! Drives the real router (JWT middleware, webhook signature checks, error
//! envelope) over the in-memory store and the mock gateway.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use tower::ServiceExt;

use escrow_engine::api::{AppState, build_router};
use escrow_engine::auth::signature::{generate_keypair, sign_body};
use escrow_engine::auth::{JwtAuth, ROLE_ADMIN, ROLE_USER, WebhookKey};
use escrow_engine::escrow::gateway::mock::MockPaymentGateway;
use escrow_engine::escrow::{EscrowConfig, EscrowService, LogSink, MemoryStore, WebhookIngress};

const BUYER: u64 = 1001;
const SELLER: u64 = 2002;
const OUTSIDER: u64 = 3003;
const ADMIN: u64 = 9000;

struct TestApp {
    router: Router,
    jwt: JwtAuth,
    pg_signer: [u8; 32],
    courier_signer: [u8; 32],
}

impl TestApp {
    fn new() -> Self {
        let service = Arc::new(EscrowService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockPaymentGateway::new()),
            Arc::new(LogSink),
            EscrowConfig::default(),
        ));
        let (pg_signer, pg_public) = generate_keypair();
        let (courier_signer, courier_public) = generate_keypair();
        let ingress = Arc::new(WebhookIngress::new(
            service.clone(),
            Some(WebhookKey::from_hex(&pg_public).unwrap()),
            Some(WebhookKey::from_hex(&courier_public).unwrap()),
        ));
        let jwt = JwtAuth::new("test-secret");
        let state = Arc::new(AppState::new(service, ingress, jwt.clone()));

        Self {
            router: build_router(state),
            jwt,
            pg_signer,
            courier_signer,
        }
    }

    fn token(&self, user: u64, role: &str) -> String {
        self.jwt
            .issue(user, role, chrono::Duration::hours(1))
            .unwrap()
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    async fn post(&self, uri: &str, user: Option<(u64, &str)>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some((id, role)) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(id, role)));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn get(&self, uri: &str, user: Option<(u64, &str)>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method("GET").uri(uri);
        if let Some((id, role)) = user {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", self.token(id, role)));
        }
        self.send(builder.body(Body::empty()).unwrap()).await
    }

    async fn webhook(&self, uri: &str, signer: Option<&[u8; 32]>, body: Value) -> (StatusCode, Value) {
        let raw = body.to_string();
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = signer {
            builder = builder.header("X-Signature", sign_body(key, raw.as_bytes()));
        }
        self.send(builder.body(Body::from(raw)).unwrap()).await
    }

    async fn pg(&self, body: Value) -> (StatusCode, Value) {
        let signer = self.pg_signer;
        self.webhook("/api/v1/webhook/pg", Some(&signer), body).await
    }

    async fn courier(&self, tx_id: &str, event: &str) -> (StatusCode, Value) {
        let signer = self.courier_signer;
        self.webhook(
            "/api/v1/webhook/courier",
            Some(&signer),
            json!({ "transactionId": tx_id, "eventType": event, "data": {} }),
        )
        .await
    }

    /// Open and pay; returns (transaction id, pg transaction id)
    async fn paid(&self, amount: &str) -> (String, String) {
        let (status, body) = self
            .post(
                "/api/v1/transaction/open",
                Some((BUYER, ROLE_USER)),
                json!({ "listingId": "listing-7", "sellerId": SELLER, "amount": amount }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let tx_id = body["data"]["id"].as_str().unwrap().to_string();

        let (status, body) = self
            .post(
                "/api/v1/payment/initiate",
                Some((BUYER, ROLE_USER)),
                json!({
                    "transactionId": tx_id,
                    "amount": amount,
                    "method": "card",
                    "pgProvider": "mock",
                    "idempotencyKey": format!("key-{}", tx_id),
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let pg_id = body["data"]["pgTransactionId"].as_str().unwrap().to_string();
        (tx_id, pg_id)
    }

    async fn awaiting_shipment(&self, amount: &str) -> String {
        let (tx_id, pg_id) = self.paid(amount).await;
        let (status, body) = self
            .pg(json!({ "transactionId": tx_id, "pgTransactionId": pg_id, "status": "completed" }))
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["data"]["transactionStatus"], "AWAITING_SHIPMENT");
        tx_id
    }
}

#[tokio::test]
async fn test_health_is_public() {
    let app = TestApp::new();
    let (status, body) = app.get("/api/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 0);
    assert_eq!(body["data"]["store"], "memory");
}

#[tokio::test]
async fn test_openapi_document_served() {
    let app = TestApp::new();
    let (status, body) = app.get("/api-docs/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/api/v1/payment/initiate"].is_object());
}

#[tokio::test]
async fn test_missing_token_rejected() {
    let app = TestApp::new();
    let (status, body) = app
        .post(
            "/api/v1/transaction/open",
            None,
            json!({ "listingId": "l", "sellerId": SELLER, "amount": "1000" }),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 2001);
}

#[tokio::test]
async fn test_foreign_token_rejected() {
    let app = TestApp::new();
    let forged = JwtAuth::new("other-secret")
        .issue(BUYER, ROLE_USER, chrono::Duration::hours(1))
        .unwrap();
    let request = Request::builder()
        .method("GET")
        .uri("/api/v1/transaction/01HZX3Q5V9M2J8K7N6P4R3T2W1")
        .header(header::AUTHORIZATION, format!("Bearer {}", forged))
        .body(Body::empty())
        .unwrap();
    let (status, body) = app.send(request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 2002);
}

#[tokio::test]
async fn test_happy_path_over_http() {
    let app = TestApp::new();
    let tx_id = app.awaiting_shipment("100000").await;

    let (status, body) = app
        .post(
            "/api/v1/payment/ship",
            Some((SELLER, ROLE_USER)),
            json!({ "transactionId": tx_id, "courier": "cj", "trackingNumber": "1234-5678" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "SHIPPED");

    assert_eq!(app.courier(&tx_id, "picked_up").await.0, StatusCode::OK);
    let (status, body) = app.courier(&tx_id, "delivered").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["transactionStatus"], "DELIVERED");

    let id_body = json!({ "transactionId": tx_id });
    let (status, body) = app
        .post("/api/v1/payment/confirm", Some((BUYER, ROLE_USER)), id_body.clone())
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "DELIVERY_CONFIRMED");

    let (status, body) = app
        .post("/api/v1/payment/final-confirm", Some((BUYER, ROLE_USER)), id_body)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "BUYER_CONFIRMED");

    let (status, body) = app
        .get(&format!("/api/v1/transaction/{}", tx_id), Some((SELLER, ROLE_USER)))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["transaction"]["status"], "BUYER_CONFIRMED");
    assert_eq!(body["data"]["shipment"]["trackingNumber"], "1234-5678");
    assert!(!body["data"]["recentEvents"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_transition_envelope() {
    let app = TestApp::new();
    let tx_id = app.awaiting_shipment("50000").await;

    let (status, body) = app
        .post(
            "/api/v1/payment/final-confirm",
            Some((BUYER, ROLE_USER)),
            json!({ "transactionId": tx_id }),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], 4003);
    assert_eq!(body["error"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn test_outsider_forbidden() {
    let app = TestApp::new();
    let (tx_id, _) = app.paid("20000").await;

    let (status, body) = app
        .get(&format!("/api/v1/transaction/{}", tx_id), Some((OUTSIDER, ROLE_USER)))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 3001);

    // admins may look at anything
    let (status, _) = app
        .get(&format!("/api/v1/transaction/{}", tx_id), Some((ADMIN, ROLE_ADMIN)))
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_operator_routes_require_admin() {
    let app = TestApp::new();
    let retry = json!({ "refundId": "6f1c2a3e-52f4-4c1b-9a1d-0c6a7e2b9f10" });

    let (status, body) = app
        .post("/api/v1/payment/refund/retry", Some((BUYER, ROLE_USER)), retry.clone())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 2007);
    assert_eq!(body["error"], "PERMISSION_DENIED");

    // Still authenticated first
    let (status, body) = app.post("/api/v1/payment/refund/retry", None, retry.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 2001);

    let (status, _) = app
        .post("/api/v1/payment/refund/retry", Some((ADMIN, ROLE_ADMIN)), retry)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_malformed_id_and_unknown_id() {
    let app = TestApp::new();
    let (status, body) = app
        .get("/api/v1/transaction/not-a-ulid", Some((BUYER, ROLE_USER)))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 1001);

    let (status, body) = app
        .get("/api/v1/transaction/01HZX3Q5V9M2J8K7N6P4R3T2W1", Some((BUYER, ROLE_USER)))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], 4001);
}

#[tokio::test]
async fn test_body_validation() {
    let app = TestApp::new();
    let (status, body) = app
        .post(
            "/api/v1/transaction/open",
            Some((BUYER, ROLE_USER)),
            json!({ "listingId": "", "sellerId": SELLER, "amount": "1000" }),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 1001);
}

#[tokio::test]
async fn test_webhook_signature_required() {
    let app = TestApp::new();
    let (tx_id, pg_id) = app.paid("30000").await;
    let payload = json!({ "transactionId": tx_id, "pgTransactionId": pg_id, "status": "completed" });

    let (status, body) = app.webhook("/api/v1/webhook/pg", None, payload.clone()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 2004);

    // signed by the courier key, not the gateway's
    let wrong = app.courier_signer;
    let (status, body) = app.webhook("/api/v1/webhook/pg", Some(&wrong), payload).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], 2005);

    let (_, view) = app
        .get(&format!("/api/v1/transaction/{}", tx_id), Some((BUYER, ROLE_USER)))
        .await;
    assert_eq!(view["data"]["transaction"]["status"], "PAID");
}

#[tokio::test]
async fn test_duplicate_pg_webhook_acknowledged() {
    let app = TestApp::new();
    let (tx_id, pg_id) = app.paid("30000").await;
    let payload = json!({ "transactionId": tx_id, "pgTransactionId": pg_id, "status": "completed" });

    let (status, body) = app.pg(payload.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["result"], "applied");

    let (status, body) = app.pg(payload).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["result"], "duplicate");
    assert!(body["data"].get("transactionStatus").is_none());
}

#[tokio::test]
async fn test_out_of_order_courier_event_is_retryable() {
    let app = TestApp::new();
    let tx_id = app.awaiting_shipment("40000").await;
    app.post(
        "/api/v1/payment/ship",
        Some((SELLER, ROLE_USER)),
        json!({ "transactionId": tx_id, "courier": "cj", "trackingNumber": "T-1" }),
    )
    .await;

    let (status, body) = app.courier(&tx_id, "delivered").await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["retryable"], true);

    let (status, body) = app.courier(&tx_id, "lost_in_space").await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], 4004);
}

#[tokio::test]
async fn test_cancel_and_refund_over_http() {
    let app = TestApp::new();
    let tx_id = app.awaiting_shipment("80000").await;

    let (status, body) = app
        .post(
            "/api/v1/payment/cancel-request",
            Some((BUYER, ROLE_USER)),
            json!({ "transactionId": tx_id, "reason": "changed my mind" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "CANCEL_REQUESTED");

    // buyer cannot approve their own cancel request
    let (status, _) = app
        .post(
            "/api/v1/payment/cancel-approve",
            Some((BUYER, ROLE_USER)),
            json!({ "transactionId": tx_id }),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .post(
            "/api/v1/payment/cancel-approve",
            Some((SELLER, ROLE_USER)),
            json!({ "transactionId": tx_id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (_, view) = app
        .get(&format!("/api/v1/transaction/{}", tx_id), Some((BUYER, ROLE_USER)))
        .await;
    assert_eq!(view["data"]["transaction"]["status"], "REFUNDED");
    assert_eq!(view["data"]["refunds"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_dispute_resolution_requires_admin() {
    let app = TestApp::new();
    let tx_id = app.awaiting_shipment("60000").await;
    app.post(
        "/api/v1/payment/ship",
        Some((SELLER, ROLE_USER)),
        json!({ "transactionId": tx_id, "courier": "cj", "trackingNumber": "T-2" }),
    )
    .await;
    app.courier(&tx_id, "picked_up").await;
    app.courier(&tx_id, "delivered").await;

    let (status, body) = app
        .post(
            "/api/v1/dispute/open",
            Some((BUYER, ROLE_USER)),
            json!({
                "transactionId": tx_id,
                "type": "quality_issue",
                "reason": "screen cracked",
                "evidenceUrls": ["https://img.example.com/1.jpg"],
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = app
        .post(
            "/api/v1/dispute/upload-evidence",
            Some((BUYER, ROLE_USER)),
            json!({ "transactionId": tx_id, "evidenceUrls": ["https://img.example.com/2.jpg"] }),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["evidenceUrls"].as_array().unwrap().len(), 2);

    let resolve = json!({ "transactionId": tx_id, "resolution": "release" });
    let (status, body) = app
        .post("/api/v1/dispute/resolve", Some((SELLER, ROLE_USER)), resolve.clone())
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 2007);

    let (status, body) = app
        .post("/api/v1/dispute/resolve", Some((ADMIN, ROLE_ADMIN)), resolve)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["status"], "BUYER_CONFIRMED");
}
