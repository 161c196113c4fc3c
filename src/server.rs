use std::{env, net::SocketAddr, time::Duration};

use anyhow::{anyhow, Context};
use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    auth,
    capture::Site,
    conf,
    conf::ConfJwt,
    data::Storage,
    docs::ApiDoc,
    error::Error,
    idp::Idp,
    types::{
        BridgeUser, Health, HistoryResponse, LeaderboardResponse,
        PromptBody, RecordResponse, ResponseBody, StatsResponse, TokenBody,
        TokenResponse,
    },
};


#[derive(Debug)]
pub struct ApiError(StatusCode, Json<ErrorResponse>);

impl ApiError {
    fn new(status: StatusCode, error: impl Into<String>) -> Self {
        ApiError(
            status,
            Json(ErrorResponse {
                error: error.into(),
                details: None,
            }),
        )
    }
}

impl From<StatusCode> for ApiError {
    fn from(status: StatusCode) -> Self {
        ApiError::new(
            status,
            status.canonical_reason().unwrap_or("Unknown error"),
        )
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        match &error {
            Error::InvalidModel(_) | Error::InvalidInput(_) => {
                ApiError::new(StatusCode::BAD_REQUEST, error.to_string())
            }
            // Provider-side rejections and provider unreachability both
            // mean the caller could not be authenticated.
            Error::Unauthorized | Error::Idp(_) => {
                ApiError::new(StatusCode::UNAUTHORIZED, "Unauthorized")
            }
            Error::MissingSecret => ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                error.to_string(),
            ),
            Error::Store(_) => {
                tracing::error!(%error, "Store failure.");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Store failure",
                )
            }
        }
    }
}

impl axum::response::IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError(status, body) = self;
        (status, body).into_response()
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

#[derive(Clone)]
pub struct AppState {
    pub storage: Storage,
    pub idp: Idp,
    pub jwt: ConfJwt,
    pub leaderboard_limit: u32,
    pub extension_token_ttl: Duration,
}

#[derive(Debug, Clone)]
struct User {
    pub uid: String,
    #[allow(dead_code)] // Logged, not otherwise read.
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
struct ReqId {
    pub req_id: String,
}

impl ReqId {
    fn new() -> Self {
        let req_id = cuid2::create_id();
        Self { req_id }
    }
}

tokio::task_local! {
    static USER: User;
    static REQ_ID: ReqId;
}

#[tracing::instrument(name = "server", skip_all)]
pub async fn run() -> anyhow::Result<()> {
    let conf = conf::global();
    let dir = env::current_dir()?;
    tracing::info!(?dir, ?conf, "Starting.");
    let addr = SocketAddr::from((conf.addr, conf.port));

    let storage = Storage::connect().await?;
    let idp = Idp::new(conf.idp.clone());
    let state = AppState {
        storage,
        idp,
        jwt: conf.jwt.clone(),
        leaderboard_limit: conf.leaderboard_limit,
        extension_token_ttl: Duration::from_secs(
            conf.extension_token_ttl_days * 24 * 60 * 60,
        ),
    };
    let routes = router(state, &conf.cors_origins);
    let service = routes.into_make_service();

    match &conf.tls {
        None => {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tracing::warn!(?addr, "Listening unencrypted.");
            axum::serve(listener, service).await?;
        }
        Some(conf::Tls {
            cert_file,
            key_file,
        }) => {
            // XXX One MUST do this manual init of rustls provider when using
            //     more than a single dep which itself depends on rustls.
            //     Here we using 2:
            //     - axum_server
            //     - reqwest
            rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .map_err(|crypto_provider| {
                    anyhow!(
                        "Failed to install default crypto provider: \
                        {crypto_provider:?}"
                    )
                })?;

            let config =
                axum_server::tls_rustls::RustlsConfig::from_pem_file(
                    cert_file, key_file,
                )
                .await
                .context(format!(
                    "Failed to construct RustlsConfig. \
                    cert_file={cert_file:?}, key_file={key_file:?}"
                ))?;

            tracing::info!(
                ?addr,
                ?cert_file,
                ?key_file,
                "Listening with TLS."
            );
            axum_server::bind_rustls(addr, config)
                .serve(service)
                .await?;
        }
    }

    Ok(())
}

pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let allowed: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin, _| {
            // Extension contexts are always allowed alongside the
            // configured dashboard origins.
            allowed.iter().any(|allow| allow == origin)
                || origin.as_bytes().starts_with(b"chrome-extension://")
                || origin.as_bytes().starts_with(b"moz-extension://")
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::ORIGIN,
        ]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/leaderboard", get(leaderboard_handler))
        .merge(
            SwaggerUi::new("/swagger-ui")
                .url("/api-docs/openapi.json", ApiDoc::openapi()),
        )
        .nest(
            "/api",
            Router::new()
                .route("/prompt", post(prompt_handler))
                .route("/response", post(response_handler))
                .route("/stats", get(stats_handler))
                .route("/history/year", get(history_year_handler))
                .route_layer(middleware::from_fn_with_state(
                    state.clone(),
                    auth_layer,
                ))
                // Registered after the auth layer: the token exchange
                // is what callers use to obtain credentials.
                .route(
                    "/auth/extension-token",
                    post(extension_token_handler),
                ),
        )
        .layer(cors)
        .route_layer(middleware::from_fn({
            |req, next: Next| REQ_ID.scope(ReqId::new(), next.run(req))
        }))
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up", body = Health))
)]
pub(crate) async fn health_handler() -> Json<Health> {
    Json(Health { ok: true })
}

fn parse_model(model: &str) -> Result<Site, ApiError> {
    model
        .parse()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "Invalid model"))
}

fn check_non_negative(name: &str, count: i64) -> Result<u64, ApiError> {
    u64::try_from(count).map_err(|_| {
        ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("{name} must be non-negative"),
        )
    })
}

fn check_co2(co2: f64) -> Result<f64, ApiError> {
    if !co2.is_finite() || co2 < 0.0 {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "co2 must be a non-negative number",
        ));
    }
    Ok(co2)
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().uid)
)]
#[utoipa::path(
    post,
    path = "/api/prompt",
    request_body = PromptBody,
    responses(
        (status = 200, description = "Prompt recorded", body = RecordResponse),
        (status = 400, description = "Invalid model or malformed body"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Store failure"),
    ),
    security(("jwt" = []))
)]
pub(crate) async fn prompt_handler(
    State(state): State<AppState>,
    Json(body): Json<PromptBody>,
) -> Result<Json<RecordResponse>, ApiError> {
    let model = parse_model(&body.model)?;
    // Input tokens are validated but intentionally not aggregated;
    // only the prompt count and CO2 feed the counters.
    check_non_negative("inputTokens", body.input_tokens)?;
    let co2 = check_co2(body.co2)?;
    let user = USER.get();
    let (exceeded, user, today) =
        state.storage.record_prompt(&user.uid, model, co2).await?;
    Ok(Json(RecordResponse {
        success: true,
        exceeded,
        user,
        today,
    }))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().uid)
)]
#[utoipa::path(
    post,
    path = "/api/response",
    request_body = ResponseBody,
    responses(
        (status = 200, description = "Response recorded", body = RecordResponse),
        (status = 400, description = "Invalid model or malformed body"),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Store failure"),
    ),
    security(("jwt" = []))
)]
pub(crate) async fn response_handler(
    State(state): State<AppState>,
    Json(body): Json<ResponseBody>,
) -> Result<Json<RecordResponse>, ApiError> {
    let model = parse_model(&body.model)?;
    let output_tokens =
        check_non_negative("outputTokens", body.output_tokens)?;
    let co2 = check_co2(body.co2)?;
    let user = USER.get();
    let (exceeded, user, today) = state
        .storage
        .record_response(&user.uid, model, output_tokens, co2)
        .await?;
    Ok(Json(RecordResponse {
        success: true,
        exceeded,
        user,
        today,
    }))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().uid)
)]
#[utoipa::path(
    get,
    path = "/api/stats",
    responses(
        (status = 200, description = "Current user and day snapshot", body = StatsResponse),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Store failure"),
    ),
    security(("jwt" = []))
)]
pub(crate) async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<StatsResponse>, ApiError> {
    let user = USER.get();
    let (user, today, exceeded) =
        state.storage.get_stats(&user.uid).await?;
    Ok(Json(StatsResponse {
        success: true,
        user,
        today,
        exceeded,
    }))
}

#[tracing::instrument(
    skip_all,
    fields(req_id = REQ_ID.get().req_id, uid = USER.get().uid)
)]
#[utoipa::path(
    get,
    path = "/api/history/year",
    responses(
        (status = 200, description = "Daily records for the trailing year", body = HistoryResponse),
        (status = 401, description = "Missing or invalid bearer token"),
        (status = 500, description = "Store failure"),
    ),
    security(("jwt" = []))
)]
pub(crate) async fn history_year_handler(
    State(state): State<AppState>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let user = USER.get();
    let history = state.storage.history_year(&user.uid).await?;
    Ok(Json(HistoryResponse {
        success: true,
        history,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct LeaderboardQuery {
    limit: Option<u32>,
}

#[tracing::instrument(skip_all, fields(req_id = REQ_ID.get().req_id))]
#[utoipa::path(
    get,
    path = "/leaderboard",
    params(("limit" = Option<u32>, Query, description = "Max rows to return")),
    responses(
        (status = 200, description = "Users by lifetime prompt count, descending", body = LeaderboardResponse),
        (status = 500, description = "Store failure"),
    )
)]
pub(crate) async fn leaderboard_handler(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<LeaderboardResponse>, ApiError> {
    let limit = query.limit.unwrap_or(state.leaderboard_limit);
    let data = state.storage.leaderboard(limit).await?;
    Ok(Json(LeaderboardResponse {
        success: true,
        data,
    }))
}

#[tracing::instrument(skip_all, fields(req_id = REQ_ID.get().req_id))]
#[utoipa::path(
    post,
    path = "/api/auth/extension-token",
    request_body = TokenBody,
    responses(
        (status = 200, description = "Extension credential minted", body = TokenResponse),
        (status = 400, description = "Missing idToken"),
        (status = 401, description = "Invalid identity-provider token"),
        (status = 500, description = "Signing secret not configured"),
    )
)]
pub(crate) async fn extension_token_handler(
    State(state): State<AppState>,
    Json(body): Json<TokenBody>,
) -> Result<Json<TokenResponse>, ApiError> {
    let id_token = body
        .id_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ApiError::new(StatusCode::BAD_REQUEST, "Missing idToken")
        })?;
    if state.jwt.secret.is_empty() {
        return Err(Error::MissingSecret.into());
    }

    let identity = state.idp.verify_id_token(id_token).await?;
    state
        .storage
        .ensure_user(
            &identity.uid,
            identity.display_name.as_deref(),
            identity.email.as_deref(),
        )
        .await?;

    let claims = auth::Claims::extension(
        &identity.uid,
        identity.email.as_deref(),
        state.extension_token_ttl,
        &state.jwt,
    )
    .map_err(|error| {
        tracing::error!(%error, "Clock error while minting claims.");
        ApiError::from(StatusCode::INTERNAL_SERVER_ERROR)
    })?;
    let token = claims.to_str(&state.jwt).map_err(|error| {
        tracing::error!(%error, "Failed to sign extension token.");
        ApiError::from(StatusCode::INTERNAL_SERVER_ERROR)
    })?;

    tracing::info!(uid = %identity.uid, "Extension credential minted.");
    Ok(Json(TokenResponse {
        success: true,
        token,
        user: BridgeUser {
            uid: identity.uid,
            email: identity.email,
            username: identity.display_name,
        },
    }))
}

async fn auth_layer(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_token = req
        .headers()
        .get(header::AUTHORIZATION)
        .ok_or_else(|| {
            tracing::warn!("Missing Authorization header");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?
        .to_str()
        .map_err(|error| {
            tracing::warn!(%error, "Invalid Authorization header encoding");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?
        .strip_prefix("Bearer ")
        .ok_or_else(|| {
            tracing::warn!("Authorization header missing 'Bearer ' prefix");
            ApiError::from(StatusCode::UNAUTHORIZED)
        })?;

    match authorize(auth_token, &state.jwt) {
        Some(user) => Ok(USER.scope(user, next.run(req)).await),
        None => {
            tracing::warn!(
                token_prefix = ?auth_token.get(..10).unwrap_or(""),
                "Authentication failed"
            );
            Err(StatusCode::UNAUTHORIZED.into())
        }
    }
}

fn authorize(auth_token: &str, jwt_conf: &ConfJwt) -> Option<User> {
    auth::Claims::from_str(auth_token, jwt_conf)
        .inspect_err(|error| {
            tracing::warn!(?error, "JWT validation failed");
        })
        .ok()
        .filter(|claims| {
            // Only bridged extension credentials may hit the API.
            if !claims.is_extension() {
                tracing::warn!(
                    token_type = %claims.token_type,
                    "Rejected non-extension token."
                );
            }
            claims.is_extension()
        })
        .map(|claims| User {
            uid: claims.sub,
            email: claims.email,
        })
}
