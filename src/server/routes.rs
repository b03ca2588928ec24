//! HTTP routes over the orchestrator

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::chain::{parse_chain_id, ChainId, NetworkConfig};
use crate::error::SessionError;
use crate::messaging::{Conversation, Message};
use crate::orchestrator::{Orchestrator, Snapshot};
use crate::provider::{ProviderKind, TransactionRequest};
use crate::wallet::{WalletSession, WalletState};

#[derive(Clone)]
pub struct AppState { pub core: Orchestrator, pub app_name: String }

impl AppState {
    pub fn new(core: Orchestrator, app_name: impl Into<String>) -> Self {
        Self { core, app_name: app_name.into() }
    }
}

/// Error body: `{"error": {"code", "message"}}`.
#[derive(Debug)]
pub struct ApiError(pub SessionError);

impl From<SessionError> for ApiError {
    fn from(error: SessionError) -> Self { Self(error) }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"error": {"code": self.0.code(), "message": self.0.to_string()}});
        (status_for(&self.0), Json(body)).into_response()
    }
}

pub fn status_for(error: &SessionError) -> StatusCode {
    match error {
        SessionError::ConnectionRejected(_) | SessionError::SigningRejected(_) => StatusCode::FORBIDDEN,
        SessionError::ProviderUnavailable(_) | SessionError::HandshakeFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        SessionError::QueryFailed(_) | SessionError::DeliveryFailed(_) | SessionError::TransactionFailed(_) => {
            StatusCode::BAD_GATEWAY
        }
        SessionError::UnsupportedNetwork(_) | SessionError::InvalidAddress(_) => StatusCode::BAD_REQUEST,
        SessionError::SignerUnavailable
        | SessionError::NotConnected(_)
        | SessionError::AlreadyConnecting { .. }
        | SessionError::ConnectCancelled => StatusCode::CONFLICT,
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
pub struct ConnectRequest { #[serde(default)] pub kind: Option<String> }

/// Chain id as a number, a hex string or a CAIP-2 `eip155:` string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ChainArg { Id(ChainId), Text(String) }

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest { pub chain_id: ChainArg }

#[derive(Debug, Deserialize)]
pub struct SignRequest { pub message: String }

#[derive(Debug, Deserialize)]
pub struct SendRequest { pub peer: String, pub body: String }

#[derive(Debug, Deserialize)]
pub struct MessagesQuery { #[serde(default)] pub limit: Option<usize> }

#[derive(Debug, Serialize)]
pub struct Reachability { pub identity: String, pub reachable: bool }

pub fn create_router(core: Orchestrator) -> Router {
    let app_name = core.config().app.clone();
    create_router_with_name(core, &app_name)
}

pub fn create_router_with_name(core: Orchestrator, app_name: &str) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/state", get(state))
        .route("/networks", get(networks))
        .route("/wallet/connect", post(connect_wallet))
        .route("/wallet/disconnect", post(disconnect_wallet))
        .route("/wallet/network", post(switch_network))
        .route("/wallet/balance", post(refresh_balance))
        .route("/wallet/sign", post(sign_message))
        .route("/wallet/transaction", post(send_transaction))
        .route("/conversations", get(conversations))
        .route("/messages", post(send_message))
        .route("/messages/:peer", get(messages))
        .route("/reachable/:identity", get(reachable))
        .route("/error/clear", post(clear_error))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState::new(core, app_name))
}

async fn health(State(s): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "service": s.app_name}))
}

async fn state(State(s): State<AppState>) -> Json<Snapshot> {
    Json(s.core.snapshot())
}

async fn networks(State(s): State<AppState>) -> Json<Vec<NetworkConfig>> {
    Json(s.core.networks().to_vec())
}

async fn connect_wallet(State(s): State<AppState>, body: Option<Json<ConnectRequest>>) -> ApiResult<WalletSession> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let kind = match request.kind.as_deref() {
        Some(raw) => Some(
            ProviderKind::from_str(raw)
                .ok_or_else(|| SessionError::unavailable(format!("unknown provider kind '{raw}'")))?,
        ),
        None => None,
    };
    Ok(Json(s.core.connect_wallet(kind).await?))
}

async fn disconnect_wallet(State(s): State<AppState>) -> Json<Snapshot> {
    s.core.disconnect_wallet().await;
    Json(s.core.snapshot())
}

async fn switch_network(State(s): State<AppState>, Json(request): Json<NetworkRequest>) -> ApiResult<WalletState> {
    let chain_id = match request.chain_id {
        ChainArg::Id(id) => id,
        ChainArg::Text(raw) => parse_chain_id(&raw)?,
    };
    s.core.switch_network(chain_id).await?;
    Ok(Json(s.core.wallet().state()))
}

async fn refresh_balance(State(s): State<AppState>) -> ApiResult<WalletState> {
    s.core.fetch_balance().await?;
    Ok(Json(s.core.wallet().state()))
}

async fn sign_message(State(s): State<AppState>, Json(request): Json<SignRequest>) -> ApiResult<Value> {
    let signature = s.core.sign_message(&request.message).await?;
    Ok(Json(json!({"signature": signature})))
}

async fn send_transaction(State(s): State<AppState>, Json(tx): Json<TransactionRequest>) -> ApiResult<Value> {
    let hash = s.core.send_transaction(tx).await?;
    Ok(Json(json!({"hash": hash})))
}

async fn conversations(State(s): State<AppState>) -> Json<Vec<Conversation>> {
    Json(s.core.messaging().conversations())
}

async fn messages(State(s): State<AppState>, Path(peer): Path<String>, Query(q): Query<MessagesQuery>) -> ApiResult<Vec<Message>> {
    Ok(Json(s.core.get_messages(&peer, q.limit).await?))
}

async fn send_message(State(s): State<AppState>, Json(request): Json<SendRequest>) -> ApiResult<Message> {
    Ok(Json(s.core.send_message(&request.peer, &request.body).await?))
}

async fn reachable(State(s): State<AppState>, Path(identity): Path<String>) -> Json<Reachability> {
    let reachable = s.core.can_message(&identity).await;
    Json(Reachability { identity, reachable })
}

async fn clear_error(State(s): State<AppState>) -> Json<Snapshot> {
    s.core.clear_error();
    Json(s.core.snapshot())
}
