//! HTTP API: the thin payment/merchant endpoints plus the soundbox control surface.
//!
//! Payment routes keep the web checkout's JSON contract
//! (`{merchants}`, `{success, transaction}`, `{error}`). Soundbox routes
//! forward to the service task through [`SoundboxHandle`].

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::amount::Amount;
use crate::notifier::Notifier;
use crate::service::{ServiceError, SoundboxHandle};
use crate::session::{SessionError, SettingsUpdate};
use crate::speech::catalog::VoiceCatalog;
use crate::speech::presets::{VoicePreset, MESSAGE_TEMPLATES};
use crate::store::PaymentStore;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn PaymentStore>,
    pub soundbox: SoundboxHandle,
    pub catalog: Arc<VoiceCatalog>,
    pub notifier: Arc<Notifier>,
}

type ApiResponse = (StatusCode, Json<Value>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (status, Json(json!({ "error": message.into() })))
}

// --- Request/Response types ---

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct PaymentRequest {
    merchant_id: Option<String>,
    /// Number or numeric string.
    amount: Option<Value>,
    customer_name: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwitchMerchantRequest {
    merchant_id: String,
}

#[derive(Serialize)]
struct PresetInfo {
    name: VoicePreset,
    description: &'static str,
    rate: f32,
    pitch: f32,
    volume: f32,
}

/// Build the axum router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/merchants/list", get(handle_list_merchants))
        .route("/api/merchants/{id}", get(handle_get_merchant))
        .route("/api/payment", post(handle_payment))
        .route("/soundbox/status", get(handle_status))
        .route("/soundbox/start", post(handle_start))
        .route("/soundbox/stop", post(handle_stop))
        .route("/soundbox/merchant", post(handle_switch_merchant))
        .route("/soundbox/settings", post(handle_settings))
        .route("/soundbox/voices", get(handle_voices))
        .route("/soundbox/presets", get(handle_presets))
        .route("/soundbox/templates", get(handle_templates))
        .route("/soundbox/test-voice", post(handle_test_voice))
        .route("/soundbox/test-sound", post(handle_test_sound))
        .with_state(state)
}

/// Bind the API server and serve it as a background tokio task.
pub async fn start_api(state: ApiState, host: &str, port: u16) -> std::io::Result<()> {
    let app = router(state);
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on {addr}");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            warn!("API server error: {e}");
        }
    });
    Ok(())
}

// --- Payment handlers ---

async fn handle_list_merchants(State(state): State<ApiState>) -> ApiResponse {
    match state.store.list_merchants() {
        Ok(merchants) => (StatusCode::OK, Json(json!({ "merchants": merchants }))),
        Err(e) => {
            warn!("Failed to fetch merchants: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch merchants")
        }
    }
}

async fn handle_get_merchant(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> ApiResponse {
    match state.store.get_merchant(&id) {
        Ok(Some(merchant)) => (StatusCode::OK, Json(json!(merchant))),
        Ok(None) => error(StatusCode::NOT_FOUND, "Merchant not found"),
        Err(e) => {
            warn!("Failed to fetch merchant {id}: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch merchant")
        }
    }
}

enum ParsedAmount {
    Missing,
    Invalid,
    Valid(Amount),
}

fn parse_amount(value: Option<&Value>) -> ParsedAmount {
    let parsed = match value {
        None | Some(Value::Null) => return ParsedAmount::Missing,
        Some(Value::String(s)) if s.trim().is_empty() => return ParsedAmount::Missing,
        Some(Value::Number(n)) => n.as_f64().map(Amount::from_decimal),
        Some(Value::String(s)) => Some(s.trim().parse::<Amount>()),
        Some(_) => None,
    };
    match parsed {
        Some(Ok(amount)) if amount.is_zero() => ParsedAmount::Missing,
        Some(Ok(amount)) => ParsedAmount::Valid(amount),
        _ => ParsedAmount::Invalid,
    }
}

async fn handle_payment(
    State(state): State<ApiState>,
    Json(req): Json<PaymentRequest>,
) -> ApiResponse {
    let merchant_id = req.merchant_id.as_deref().unwrap_or("").trim();
    let customer_name = req.customer_name.as_deref().unwrap_or("").trim();
    let amount = parse_amount(req.amount.as_ref());

    let amount = match amount {
        ParsedAmount::Valid(amount) if !merchant_id.is_empty() && !customer_name.is_empty() => {
            amount
        }
        ParsedAmount::Invalid if !merchant_id.is_empty() && !customer_name.is_empty() => {
            return error(StatusCode::BAD_REQUEST, "Invalid amount");
        }
        _ => return error(StatusCode::BAD_REQUEST, "Missing required fields"),
    };

    match state
        .store
        .create_transaction(merchant_id, amount, customer_name)
    {
        Ok(transaction) => {
            info!(
                "HTTP /api/payment: {} from {} to {merchant_id}",
                transaction.amount, transaction.customer_name
            );
            (
                StatusCode::OK,
                Json(json!({ "success": true, "transaction": transaction })),
            )
        }
        Err(e) => {
            warn!("Payment error: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "Payment failed")
        }
    }
}

// --- Soundbox handlers ---

fn service_error(e: ServiceError) -> ApiResponse {
    let status = match &e {
        ServiceError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
        ServiceError::Session(session) => match session {
            SessionError::CapabilityAbsent
            | SessionError::CatalogNotReady
            | SessionError::NoMerchant => StatusCode::CONFLICT,
            SessionError::Subscription(_) => StatusCode::BAD_GATEWAY,
            SessionError::UnknownTemplate(_) | SessionError::UnknownVoice(_) => {
                StatusCode::BAD_REQUEST
            }
        },
    };
    error(status, e.to_string())
}

fn snapshot_response(
    result: Result<crate::session::SessionSnapshot, ServiceError>,
) -> ApiResponse {
    match result {
        Ok(snapshot) => (StatusCode::OK, Json(json!(snapshot))),
        Err(e) => service_error(e),
    }
}

async fn handle_status(State(state): State<ApiState>) -> ApiResponse {
    match state.soundbox.status().await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "soundbox": snapshot,
                "catalog": state.catalog.state(),
                "notices": state.notifier.recent(),
            })),
        ),
        Err(e) => service_error(e),
    }
}

async fn handle_start(State(state): State<ApiState>) -> ApiResponse {
    snapshot_response(state.soundbox.start().await)
}

async fn handle_stop(State(state): State<ApiState>) -> ApiResponse {
    snapshot_response(state.soundbox.stop().await)
}

async fn handle_switch_merchant(
    State(state): State<ApiState>,
    Json(req): Json<SwitchMerchantRequest>,
) -> ApiResponse {
    match state.store.get_merchant(&req.merchant_id) {
        Ok(Some(_)) => {}
        Ok(None) => return error(StatusCode::NOT_FOUND, "Merchant not found"),
        Err(e) => {
            warn!("Failed to fetch merchant {}: {e}", req.merchant_id);
            return error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch merchant");
        }
    }
    snapshot_response(state.soundbox.switch_merchant(req.merchant_id).await)
}

async fn handle_settings(
    State(state): State<ApiState>,
    Json(update): Json<SettingsUpdate>,
) -> ApiResponse {
    snapshot_response(state.soundbox.update_settings(update).await)
}

async fn handle_voices(State(state): State<ApiState>) -> ApiResponse {
    (
        StatusCode::OK,
        Json(json!({
            "catalog": state.catalog.state(),
            "defaultVoice": state.catalog.default_voice(),
            "voices": state.catalog.voices(),
        })),
    )
}

async fn handle_presets() -> Json<Vec<PresetInfo>> {
    Json(
        VoicePreset::ALL
            .iter()
            .map(|&preset| {
                let settings = preset.settings();
                PresetInfo {
                    name: preset,
                    description: preset.description(),
                    rate: settings.rate,
                    pitch: settings.pitch,
                    volume: settings.volume,
                }
            })
            .collect(),
    )
}

async fn handle_templates() -> ApiResponse {
    (StatusCode::OK, Json(json!(MESSAGE_TEMPLATES)))
}

async fn handle_test_voice(State(state): State<ApiState>) -> ApiResponse {
    match state.soundbox.test_voice().await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({ "status": format!("{outcome:?}").to_lowercase() })),
        ),
        Err(e) => service_error(e),
    }
}

async fn handle_test_sound(State(state): State<ApiState>) -> ApiResponse {
    match state.soundbox.test_sound().await {
        Ok(()) => (StatusCode::OK, Json(json!({ "status": "played" }))),
        Err(e) => service_error(e),
    }
}
