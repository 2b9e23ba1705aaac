use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

pub mod channel;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub enum ApiError {
    NotFound(String),
    Internal(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("{} not found", what)).into_response()
            }
            ApiError::Internal(e) => {
                log::error!("api error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Internal(err.into())
    }
}
