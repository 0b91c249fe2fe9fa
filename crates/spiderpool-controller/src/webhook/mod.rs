//! Admission webhook server for SpiderIPPool and SpiderSubnet.

pub mod admission;
pub mod common;
pub mod field;
pub mod ippool;
pub mod subnet;

pub use admission::{AdmissionRequest, AdmissionReview};
pub use field::{ErrorList, FieldError, FieldErrorKind};
pub use ippool::IPPoolWebhook;
pub use subnet::SubnetWebhook;

use crate::tls::{resolve_tls, TlsMode};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use miette::IntoDiagnostic;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Webhook server configuration
#[derive(Clone)]
pub struct WebhookConfig {
    pub listen_addr: SocketAddr,
    pub tls: TlsMode,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:5722".parse().unwrap(),
            tls: TlsMode::Disabled,
        }
    }
}

/// The validators shared by the webhook handlers
pub struct WebhookState {
    pub ippool: IPPoolWebhook,
    pub subnet: SubnetWebhook,
}

/// HTTPS admission webhook server; `/healthz` gates controller readiness
pub struct WebhookServer {
    config: WebhookConfig,
    state: Arc<WebhookState>,
}

impl WebhookServer {
    pub fn new(config: WebhookConfig, state: Arc<WebhookState>) -> Self {
        Self { config, state }
    }

    fn build_router(&self) -> Router {
        Router::new()
            .route("/healthz", get(healthz))
            .route("/validate/spiderippool", post(validate_ippool))
            .route("/validate/spidersubnet", post(validate_subnet))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Serve until cancelled, with a graceful drain window
    pub async fn run(&self, token: CancellationToken) -> miette::Result<()> {
        let router = self.build_router();
        let handle = Handle::new();

        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            token.cancelled().await;
            shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
        });

        match resolve_tls(&self.config.tls)? {
            Some(material) => {
                info!("Webhook server listening on https://{}", self.config.listen_addr);
                let rustls_config = RustlsConfig::from_pem(material.cert_pem, material.key_pem)
                    .await
                    .into_diagnostic()?;
                axum_server::bind_rustls(self.config.listen_addr, rustls_config)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                    .into_diagnostic()
            }
            None => {
                info!("Webhook server listening on http://{}", self.config.listen_addr);
                axum_server::bind(self.config.listen_addr)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                    .into_diagnostic()
            }
        }
    }
}

/// Readiness check for the controller
async fn healthz() -> &'static str {
    "ok"
}

async fn validate_ippool(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    Json(handle_review(review, |request| {
        dispatch(request, |op, object, old| match op {
            "CREATE" => state.ippool.validate_create(&object),
            "UPDATE" => state.ippool.validate_update(&old.unwrap_or_default(), &object),
            "DELETE" => state.ippool.validate_delete(&object),
            other => vec![FieldError::not_supported(
                "request.operation",
                format!("unsupported operation {}", other),
            )],
        })
    }))
}

async fn validate_subnet(
    State(state): State<Arc<WebhookState>>,
    Json(review): Json<AdmissionReview>,
) -> Json<AdmissionReview> {
    Json(handle_review(review, |request| {
        dispatch(request, |op, object, old| match op {
            "CREATE" => state.subnet.validate_create(&object),
            "UPDATE" => state.subnet.validate_update(&old.unwrap_or_default(), &object),
            "DELETE" => state.subnet.validate_delete(&object),
            other => vec![FieldError::not_supported(
                "request.operation",
                format!("unsupported operation {}", other),
            )],
        })
    }))
}

fn handle_review(
    review: AdmissionReview,
    validate: impl FnOnce(&AdmissionRequest) -> ErrorList,
) -> AdmissionReview {
    let Some(request) = review.request else {
        return AdmissionReview::deny(
            "",
            &vec![FieldError::invalid("request", "empty admission request")],
        );
    };

    let errors = validate(&request);
    if errors.is_empty() {
        AdmissionReview::allow(&request.uid)
    } else {
        AdmissionReview::deny(&request.uid, &errors)
    }
}

/// Decode the (old)object payloads for the operation and run the validator.
/// DELETE carries the resource in `oldObject`.
fn dispatch<T: DeserializeOwned + Default>(
    request: &AdmissionRequest,
    validate: impl FnOnce(&str, T, Option<T>) -> ErrorList,
) -> ErrorList {
    let decode = |value: &serde_json::Value| -> Result<T, ErrorList> {
        serde_json::from_value(value.clone()).map_err(|err| {
            vec![FieldError::invalid(
                "request.object",
                format!("failed to decode resource: {}", err),
            )]
        })
    };

    let operation = request.operation.as_str();
    let object = match operation {
        "DELETE" => request.old_object.as_ref().or(request.object.as_ref()),
        _ => request.object.as_ref(),
    };
    let Some(object) = object else {
        return vec![FieldError::invalid("request.object", "missing object")];
    };
    let object = match decode(object) {
        Ok(object) => object,
        Err(errors) => return errors,
    };

    let old = if operation == "UPDATE" {
        match request.old_object.as_ref().map(decode) {
            Some(Ok(old)) => Some(old),
            Some(Err(errors)) => return errors,
            None => None,
        }
    } else {
        None
    };

    validate(operation, object, old)
}
