use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use axum::{
    Extension, Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use brigade_core::billing::{parse_event, verify_signature};
use brigade_core::editor::{EditorError, SaveOutcome};
use brigade_core::import::{ImportError, extract_file};
use brigade_core::models::{
    Account, HydratedRecipe, Invitation, RecipeForm, RecipeSnapshot, RecipeSummary,
    SessionContext, SharingGroup, Subscription, TeamMember, TeamRole,
};
use brigade_core::service::BrigadeService;

use crate::config::ServicesConfig;
use crate::importer::{ImportFailure, Importer};
use crate::payments::{CheckoutRequest, PaymentsClient};
use crate::tls::TlsConfig;
use crate::upstream::UpstreamError;

const BODY_LIMIT: usize = 20 * 1024 * 1024; // 20 MB
const SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Clone)]
struct AppState {
    service: Arc<Mutex<BrigadeService>>,
    importer: Arc<Importer>,
    payments: Arc<PaymentsClient>,
    webhook_secret: Option<String>,
    public_url: String,
}

impl AppState {
    fn new(service: BrigadeService, services: &ServicesConfig) -> anyhow::Result<Self> {
        Ok(Self {
            service: Arc::new(Mutex::new(service)),
            importer: Arc::new(Importer::new(services)?),
            payments: Arc::new(PaymentsClient::new(&services.payments)?),
            webhook_secret: services.payments.webhook_secret.clone(),
            public_url: services.public_url.clone(),
        })
    }

    // Never hold the guard across an `.await`.
    fn service(&self) -> MutexGuard<'_, BrigadeService> {
        self.service.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The bearer token of the current request, for `DELETE /api/session`.
#[derive(Clone)]
struct SessionToken(String);

// --- Request / Response types ---

#[derive(Deserialize)]
struct CreateRecipeRequest {
    form: RecipeForm,
}

#[derive(Deserialize)]
struct SaveRecipeRequest {
    form: RecipeForm,
    snapshot: Option<RecipeSnapshot>,
}

#[derive(Serialize)]
struct SavedRecipe {
    outcome: &'static str,
    recipe_id: i64,
    recipe: HydratedRecipe,
}

#[derive(Deserialize)]
struct ImportQuery {
    #[serde(default)]
    save: bool,
}

#[derive(Serialize)]
struct ImportDraft {
    form: RecipeForm,
}

#[derive(Deserialize)]
struct InviteRequest {
    email: String,
    role: String,
}

#[derive(Serialize)]
struct TeamResponse {
    members: Vec<TeamMember>,
    invitations: Vec<Invitation>,
}

#[derive(Deserialize)]
struct CreateGroupRequest {
    name: String,
}

#[derive(Deserialize)]
struct AddMemberRequest {
    email: String,
}

#[derive(Deserialize)]
struct ShareRecipeRequest {
    recipe_id: i64,
}

#[derive(Serialize)]
struct SessionUrl {
    url: String,
}

#[derive(Serialize)]
struct BillingStatus {
    entitled: bool,
    subscription: Option<Subscription>,
}

#[derive(Serialize)]
struct WebhookAck {
    received: bool,
    applied: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

// --- Error handling ---

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Upstream(String),
    Unavailable(String),
    SaveFailed(EditorError),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg),
            Self::SaveFailed(err) => {
                error!("Recipe save failed: {err}");
                let message = match &err {
                    EditorError::Step { step, source }
                    | EditorError::Cleanup { step, source, .. } => {
                        format!("Recipe was not saved: failed {step}: {source:#}")
                    }
                    EditorError::Validation(msg) => msg.clone(),
                };
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            Self::Internal(err) => {
                error!("Internal server error: {err:#}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };
        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(err)
    }
}

impl From<brigade_core::Error> for ApiError {
    fn from(err: brigade_core::Error) -> Self {
        match err {
            brigade_core::Error::NotFound(msg) => Self::NotFound(msg),
            brigade_core::Error::Forbidden(msg) => Self::Forbidden(msg),
            brigade_core::Error::Invalid(msg)
            | brigade_core::Error::Save(EditorError::Validation(msg)) => Self::BadRequest(msg),
            brigade_core::Error::Save(err) => Self::SaveFailed(err),
            brigade_core::Error::Storage(err) => Self::Internal(err),
        }
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::NotConfigured(_) => Self::Unavailable(err.to_string()),
            UpstreamError::Failed { .. } => Self::Upstream(err.to_string()),
        }
    }
}

impl From<ImportFailure> for ApiError {
    fn from(err: ImportFailure) -> Self {
        match err {
            ImportFailure::Document(err @ ImportError::InvalidResponse(_)) => {
                Self::Upstream(err.to_string())
            }
            ImportFailure::Document(err) => Self::BadRequest(err.to_string()),
            ImportFailure::Upstream(err) => err.into(),
        }
    }
}

// --- Middleware ---

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

async fn require_auth(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let Some(token) = bearer_token(request.headers()).map(str::to_string) else {
        return ApiError::Unauthorized("Missing session token".to_string()).into_response();
    };

    let resolved = state.service().resolve_session(&token);
    match resolved {
        Ok(Some(ctx)) => {
            request.extensions_mut().insert(ctx);
            request.extensions_mut().insert(SessionToken(token));
            next.run(request).await
        }
        Ok(None) => {
            ApiError::Unauthorized("Invalid or expired session".to_string()).into_response()
        }
        Err(err) => ApiError::from(err).into_response(),
    }
}

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        "x-content-type-options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    response
}

// --- Account handlers ---

async fn get_me(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Account>, ApiError> {
    Ok(Json(state.service().account(&ctx)?))
}

async fn delete_session(
    State(state): State<AppState>,
    Extension(SessionToken(token)): Extension<SessionToken>,
) -> Result<StatusCode, ApiError> {
    state.service().revoke_session(&token)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Recipe handlers ---

async fn list_recipes(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Vec<RecipeSummary>>, ApiError> {
    Ok(Json(state.service().list_recipes(&ctx)?))
}

fn save_and_load(
    service: &BrigadeService,
    ctx: &SessionContext,
    recipe_id: Option<i64>,
    form: RecipeForm,
    snapshot: Option<RecipeSnapshot>,
) -> Result<SavedRecipe, ApiError> {
    let outcome = service.save_recipe(ctx, recipe_id, form, snapshot)?;
    let recipe = service.load_recipe(ctx, outcome.recipe_id())?;
    Ok(SavedRecipe {
        outcome: match outcome {
            SaveOutcome::Created(_) => "created",
            SaveOutcome::Saved(_) => "saved",
        },
        recipe_id: outcome.recipe_id(),
        recipe,
    })
}

async fn create_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Json(req): Json<CreateRecipeRequest>,
) -> Result<(StatusCode, Json<SavedRecipe>), ApiError> {
    let saved = save_and_load(&state.service(), &ctx, None, req.form, None)?;
    Ok((StatusCode::CREATED, Json(saved)))
}

async fn get_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(id): Path<i64>,
) -> Result<Json<HydratedRecipe>, ApiError> {
    Ok(Json(state.service().load_recipe(&ctx, id)?))
}

async fn save_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(id): Path<i64>,
    Json(req): Json<SaveRecipeRequest>,
) -> Result<Json<SavedRecipe>, ApiError> {
    let saved = save_and_load(&state.service(), &ctx, Some(id), req.form, req.snapshot)?;
    Ok(Json(saved))
}

async fn delete_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.service().delete_recipe(&ctx, id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn import_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Query(query): Query<ImportQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let file = extract_file(content_type, &body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let form = state.importer.import(file).await?;

    if !query.save {
        return Ok(Json(ImportDraft { form }).into_response());
    }
    let saved = save_and_load(&state.service(), &ctx, None, form, None)?;
    Ok((StatusCode::CREATED, Json(saved)).into_response())
}

// --- Team handlers ---

async fn get_team(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<TeamResponse>, ApiError> {
    let service = state.service();
    Ok(Json(TeamResponse {
        members: service.list_team(&ctx)?,
        invitations: service.list_invitations(&ctx)?,
    }))
}

async fn remove_team_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(member_id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.service().remove_team_member(&ctx, member_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_invitation(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Json(req): Json<InviteRequest>,
) -> Result<(StatusCode, Json<Invitation>), ApiError> {
    let role = TeamRole::parse(&req.role).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let invitation = state.service().invite(&ctx, &req.email, role)?;
    Ok((StatusCode::CREATED, Json(invitation)))
}

async fn accept_invitation(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(token): Path<String>,
) -> Result<Json<TeamMember>, ApiError> {
    Ok(Json(state.service().accept_invitation(&ctx, &token)?))
}

// --- Group handlers ---

async fn list_groups(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<Vec<SharingGroup>>, ApiError> {
    Ok(Json(state.service().list_groups(&ctx)?))
}

async fn create_group(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Json(req): Json<CreateGroupRequest>,
) -> Result<(StatusCode, Json<SharingGroup>), ApiError> {
    let group = state.service().create_group(&ctx, &req.name)?;
    Ok((StatusCode::CREATED, Json(group)))
}

async fn add_group_member(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(group_id): Path<i64>,
    Json(req): Json<AddMemberRequest>,
) -> Result<Json<SharingGroup>, ApiError> {
    Ok(Json(state.service().add_group_member(&ctx, group_id, &req.email)?))
}

async fn share_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path(group_id): Path<i64>,
    Json(req): Json<ShareRecipeRequest>,
) -> Result<Json<SharingGroup>, ApiError> {
    Ok(Json(state.service().share_recipe(&ctx, group_id, req.recipe_id)?))
}

async fn unshare_recipe(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
    Path((group_id, recipe_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    state.service().unshare_recipe(&ctx, group_id, recipe_id)?;
    Ok(StatusCode::NO_CONTENT)
}

// --- Billing handlers ---

async fn billing_checkout(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<SessionUrl>, ApiError> {
    let account = state.service().account(&ctx)?;
    let checkout = CheckoutRequest {
        user_id: account.user.id,
        email: &account.user.email,
        customer_id: account.subscription.as_ref().map(|s| s.customer_id.as_str()),
        success_url: format!("{}/billing/success", state.public_url),
        cancel_url: format!("{}/billing/cancel", state.public_url),
    };
    let url = state.payments.create_checkout(&checkout).await?;
    Ok(Json(SessionUrl { url }))
}

async fn billing_portal(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<SessionUrl>, ApiError> {
    let subscription = state
        .service()
        .subscription(&ctx)?
        .ok_or_else(|| ApiError::NotFound("No billing account for this user".to_string()))?;
    let url = state
        .payments
        .create_portal(&subscription.customer_id, state.public_url.clone())
        .await?;
    Ok(Json(SessionUrl { url }))
}

async fn billing_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<SessionContext>,
) -> Result<Json<BillingStatus>, ApiError> {
    let subscription = state.service().subscription(&ctx)?;
    Ok(Json(BillingStatus {
        entitled: subscription.as_ref().is_some_and(|s| s.status.is_entitled()),
        subscription,
    }))
}

async fn billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookAck>, ApiError> {
    let secret = state
        .webhook_secret
        .as_deref()
        .ok_or_else(|| ApiError::Unavailable("Billing webhooks are not configured".to_string()))?;
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    if let Err(err) = verify_signature(signature, &body, secret, chrono::Utc::now().timestamp()) {
        warn!(reason = %err, "rejected billing webhook");
        return Err(ApiError::BadRequest(err.to_string()));
    }

    let event = parse_event(&body).map_err(|e| ApiError::BadRequest(format!("{e:#}")))?;
    let applied = state.service().apply_billing_event(&event)?;
    Ok(Json(WebhookAck {
        received: true,
        applied,
    }))
}

// --- Router builder ---

fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/me", get(get_me))
        .route("/api/session", delete(delete_session))
        .route("/api/recipes", get(list_recipes).post(create_recipe))
        .route(
            "/api/recipes/{id}",
            get(get_recipe).put(save_recipe).delete(delete_recipe),
        )
        .route("/api/import", post(import_recipe))
        .route("/api/team", get(get_team))
        .route("/api/team/{member_id}", delete(remove_team_member))
        .route("/api/team/invitations", post(create_invitation))
        .route(
            "/api/team/invitations/{token}/accept",
            post(accept_invitation),
        )
        .route("/api/groups", get(list_groups).post(create_group))
        .route("/api/groups/{id}/members", post(add_group_member))
        .route("/api/groups/{id}/recipes", post(share_recipe))
        .route(
            "/api/groups/{id}/recipes/{recipe_id}",
            delete(unshare_recipe),
        )
        .route("/api/billing/checkout", post(billing_checkout))
        .route("/api/billing/portal", post(billing_portal))
        .route("/api/billing/status", get(billing_status))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/api/billing/webhook", post(billing_webhook))
        .merge(api)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(RequestBodyLimitLayer::new(BODY_LIMIT))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// --- Server startup ---

pub async fn start_server(
    service: BrigadeService,
    services: &ServicesConfig,
    port: u16,
    bind: &str,
    tls: Option<TlsConfig>,
) -> anyhow::Result<()> {
    let purged = service.purge_expired_sessions()?;
    if purged > 0 {
        info!(purged, "removed expired sessions");
    }
    if services.ai.api_key.is_none() {
        warn!("BRIGADE_AI_API_KEY is not set; document import is disabled");
    }
    if services.payments.webhook_secret.is_none() {
        warn!("BRIGADE_PAYMENTS_WEBHOOK_SECRET is not set; billing webhooks are disabled");
    }

    let app = build_router(AppState::new(service, services)?);
    let addr = format!("{bind}:{port}")
        .parse::<std::net::SocketAddr>()
        .context("invalid bind address")?;

    if let Some(tls_config) = tls {
        let fingerprint = tls_config.ensure_cert()?;
        let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &tls_config.cert_path,
            &tls_config.key_path,
        )
        .await
        .context("failed to load TLS certificate")?;

        info!(%addr, %fingerprint, "listening on https");
        axum_server::bind_rustls(addr, rustls_config)
            .serve(app.into_make_service())
            .await?;
    } else {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "listening on http");
        axum::serve(listener, app).await?;
    }

    Ok(())
}
