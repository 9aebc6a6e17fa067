//! OpenAPI / Swagger UI Documentation
//!
//! - Swagger UI: `http://localhost:8080/docs`
//! - OpenAPI JSON: `http://localhost:8080/api-docs/openapi.json`

use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::api::handlers::HealthResponse;
use crate::api::types::{
    ApiErrorBody, CancelRequestBody, InitiatePaymentBody, OpenDisputeBody, OpenTransactionBody,
    RefundBody, RefundRetryBody, ResolveDisputeBody, ShipBody, TransactionIdBody,
    UploadEvidenceBody, WebhookAck,
};

/// JWT bearer scheme used by every non-webhook route except health
struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_jwt",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .description(Some(
                            "HS256 token with `sub` = user id and `role` = user | admin",
                        ))
                        .build(),
                ),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Escrow Engine API",
        version = "1.0.0",
        description = "Marketplace escrow: payment capture, shipment tracking, cancellation, refunds and disputes.",
        license(
            name = "MIT"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Development"),
    ),
    paths(
        crate::api::handlers::health::health_check,
        crate::api::handlers::transaction::open_transaction,
        crate::api::handlers::transaction::get_transaction,
        crate::api::handlers::payment::initiate_payment,
        crate::api::handlers::payment::request_cancel,
        crate::api::handlers::payment::approve_cancel,
        crate::api::handlers::payment::register_shipment,
        crate::api::handlers::payment::confirm_delivery,
        crate::api::handlers::payment::final_confirm,
        crate::api::handlers::payment::process_refund,
        crate::api::handlers::payment::retry_refund,
        crate::api::handlers::dispute::open_dispute,
        crate::api::handlers::dispute::upload_evidence,
        crate::api::handlers::dispute::resolve_dispute,
        crate::api::handlers::webhook::pg_webhook,
        crate::api::handlers::webhook::courier_webhook,
    ),
    components(
        schemas(
            HealthResponse,
            ApiErrorBody,
            OpenTransactionBody,
            InitiatePaymentBody,
            TransactionIdBody,
            CancelRequestBody,
            ShipBody,
            RefundBody,
            RefundRetryBody,
            OpenDisputeBody,
            UploadEvidenceBody,
            ResolveDisputeBody,
            WebhookAck,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Transaction", description = "Create and inspect escrow transactions"),
        (name = "Payment", description = "Payment, shipment, confirmation, cancellation and refunds"),
        (name = "Dispute", description = "Buyer disputes and administrator resolution"),
        (name = "Webhook", description = "Signed provider callbacks (no JWT)"),
        (name = "System", description = "Health checks and system info")
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;
    use utoipa::OpenApi;

    #[test]
    fn test_openapi_spec_generates() {
        let spec = ApiDoc::openapi();
        assert_eq!(spec.info.title, "Escrow Engine API");
        assert_eq!(spec.info.version, "1.0.0");
    }

    #[test]
    fn test_openapi_json_serializable() {
        let json_str = ApiDoc::openapi().to_json().unwrap();
        assert!(json_str.contains("Escrow Engine API"));
        assert!(json_str.contains("OpenTransactionBody"));
    }

    #[test]
    fn test_endpoints_registered() {
        let paths = ApiDoc::openapi().paths.paths;
        for path in [
            "/api/v1/health",
            "/api/v1/transaction/open",
            "/api/v1/transaction/{id}",
            "/api/v1/payment/initiate",
            "/api/v1/payment/cancel-request",
            "/api/v1/payment/cancel-approve",
            "/api/v1/payment/ship",
            "/api/v1/payment/confirm",
            "/api/v1/payment/final-confirm",
            "/api/v1/payment/refund",
            "/api/v1/payment/refund/retry",
            "/api/v1/dispute/open",
            "/api/v1/dispute/upload-evidence",
            "/api/v1/dispute/resolve",
            "/api/v1/webhook/pg",
            "/api/v1/webhook/courier",
        ] {
            assert!(paths.contains_key(path), "missing {path}");
        }
    }

    #[test]
    fn test_security_scheme_registered() {
        let components = ApiDoc::openapi().components.unwrap();
        assert!(components.security_schemes.contains_key("bearer_jwt"));
    }
}
