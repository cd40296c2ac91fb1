use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use tracing::error;

pub type AppResult<T> = Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    BadRequest(String),

    #[error("Not Found")]
    NotFound,

    #[error("{0}")]
    UnsupportedMediaType(String),

    // upstream fetch blew up, the message embeds the underlying error text
    #[error("{0}")]
    BadGateway(String),

    #[error("Internal Server Error")]
    InternalServerError,

    #[error("{0}")]
    InternalServerErrorWithContext(String),
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::BadRequest(_) => StatusCode::BAD_REQUEST,
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::BadGateway(_) => StatusCode::BAD_GATEWAY,
            Error::InternalServerError | Error::InternalServerErrorWithContext(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for Error {
    // plain text body, and CORS on errors too - the calling page is always a
    // different origin and still has to be able to read the failure
    fn into_response(self) -> Response {
        if matches!(self, Error::InternalServerError) {
            error!("internal error served with no context, check the handler");
        }

        (
            self.status(),
            [
                (
                    header::ACCESS_CONTROL_ALLOW_ORIGIN,
                    HeaderValue::from_static("*"),
                ),
                (header::CONTENT_TYPE, HeaderValue::from_static("text/plain")),
            ],
            self.to_string(),
        )
            .into_response()
    }
}
