use axum::{
    Json,
    extract::{FromRequestParts, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, warn};

use usersys_client::{ClientError, RpcClient};
use usersys_protocol::UserProfile;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct LoginBody {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ProfileBody {
    #[serde(default)]
    pub nickname: String,
    #[serde(default)]
    pub profile_pic: String,
}

/// Body of every `/api` reply except health.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

impl ApiResponse {
    fn ok(message: &str) -> Self {
        Self {
            success: true,
            message: message.to_string(),
            token: None,
            user: None,
        }
    }

    fn with_user(mut self, user: UserProfile) -> Self {
        self.user = Some(user);
        self
    }
}

pub enum ApiError {
    /// No usable bearer token on a route that needs one.
    Unauthorized,
    /// The user service answered with an error. Reported as a 200.
    Rejected(String),
    /// The user service could not be reached or answered nonsense.
    Unavailable,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "missing or invalid authorization header".to_string(),
            ),
            ApiError::Rejected(message) => (StatusCode::OK, message),
            ApiError::Unavailable => (
                StatusCode::BAD_GATEWAY,
                "user service unavailable".to_string(),
            ),
        };
        let body = ApiResponse {
            success: false,
            message,
            token: None,
            user: None,
        };
        (status, Json(body)).into_response()
    }
}

impl From<ClientError> for ApiError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Rejected { message, .. } => ApiError::Rejected(message),
            e => {
                warn!("User service call failed: {}", e);
                ApiError::Unavailable
            }
        }
    }
}

/// Bearer token from the `Authorization` header. Missing, malformed or
/// empty headers are all a 401.
pub struct BearerToken(pub String);

impl<S: Send + Sync> FromRequestParts<S> for BearerToken {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| ApiError::Unauthorized)?;

        let token = bearer.token().trim();
        if token.is_empty() {
            return Err(ApiError::Unauthorized);
        }
        Ok(BearerToken(token.to_string()))
    }
}

/// Run one blocking client interaction off the async executor.
async fn rpc<T, F>(state: &AppState, call: F) -> Result<T, ApiError>
where
    F: FnOnce(&RpcClient) -> Result<T, ClientError> + Send + 'static,
    T: Send + 'static,
{
    let client = state.client();
    match tokio::task::spawn_blocking(move || call(&client)).await {
        Ok(result) => result.map_err(ApiError::from),
        Err(e) => {
            error!("RPC task failed: {}", e);
            Err(ApiError::Unavailable)
        }
    }
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().timestamp(),
    }))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginBody>,
) -> Result<Json<ApiResponse>, ApiError> {
    let reply = rpc(&state, move |c| c.login(&req.username, &req.password)).await?;

    Ok(Json(ApiResponse {
        token: Some(reply.token),
        ..ApiResponse::ok("login successful").with_user(reply.user)
    }))
}

pub async fn get_profile(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<ApiResponse>, ApiError> {
    let user = rpc(&state, move |c| c.get_profile(&token)).await?;
    Ok(Json(ApiResponse::ok("profile loaded").with_user(user)))
}

pub async fn update_profile(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(req): Json<ProfileBody>,
) -> Result<Json<ApiResponse>, ApiError> {
    let user = rpc(&state, move |c| {
        c.update_profile(&token, &req.nickname, &req.profile_pic)
    })
    .await?;
    Ok(Json(ApiResponse::ok("profile updated").with_user(user)))
}

/// Partial update: fields left empty keep their current value.
pub async fn update_info(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
    Json(req): Json<ProfileBody>,
) -> Result<Json<ApiResponse>, ApiError> {
    let user = rpc(&state, move |c| {
        let current = c.get_profile(&token)?;
        let nickname = pick(&req.nickname, &current.nickname);
        let profile_pic = pick(&req.profile_pic, &current.profile_pic);
        c.update_profile(&token, nickname, profile_pic)
    })
    .await?;
    Ok(Json(ApiResponse::ok("profile updated").with_user(user)))
}

pub async fn logout(
    State(state): State<AppState>,
    BearerToken(token): BearerToken,
) -> Result<Json<ApiResponse>, ApiError> {
    rpc(&state, move |c| c.logout(&token)).await?;
    Ok(Json(ApiResponse::ok("logout successful")))
}

fn pick<'a>(requested: &'a str, current: &'a str) -> &'a str {
    if requested.is_empty() { current } else { requested }
}
