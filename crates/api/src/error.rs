//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use outbox::OutboxError;
use saga::{SagaError, StoreError};

/// API-level error type that maps to HTTP responses.
#[derive(Debug)]
pub enum ApiError {
    /// Resource not found.
    NotFound(String),
    /// Bad request from the client.
    BadRequest(String),
    /// Saga execution error.
    Saga(SagaError),
    /// Outbox read error.
    Outbox(OutboxError),
}

impl ApiError {
    fn status_and_message(self) -> (StatusCode, String) {
        match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Saga(err) => saga_error_to_response(err),
            ApiError::Outbox(err) => {
                let status = if err.is_unavailable() {
                    StatusCode::SERVICE_UNAVAILABLE
                } else {
                    StatusCode::INTERNAL_SERVER_ERROR
                };
                (status, err.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = self.status_and_message();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %message, "request failed");
        }

        let body = serde_json::json!({ "success": false, "error": message });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_error_to_response(err: SagaError) -> (StatusCode, String) {
    let status = match &err {
        SagaError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SagaError::UserNotFound(_)
        | SagaError::OrderNotFound(_)
        | SagaError::Store(StoreError::OrderNotFound(_)) => StatusCode::NOT_FOUND,
        SagaError::PaymentReferenceMismatch { .. } => StatusCode::CONFLICT,
        SagaError::Gateway(_) => StatusCode::BAD_GATEWAY,
        SagaError::Store(_) | SagaError::Outbox(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

impl From<SagaError> for ApiError {
    fn from(err: SagaError) -> Self {
        ApiError::Saga(err)
    }
}

impl From<OutboxError> for ApiError {
    fn from(err: OutboxError) -> Self {
        ApiError::Outbox(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{AggregateId, UserId};
    use domain::OrderError;
    use events::PaymentReference;
    use saga::GatewayError;

    fn status(err: impl Into<ApiError>) -> StatusCode {
        err.into().status_and_message().0
    }

    #[test]
    fn test_saga_error_mapping() {
        assert_eq!(
            status(SagaError::InvalidRequest(OrderError::NegativeTotal(-1))),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status(SagaError::UserNotFound(UserId::new())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(SagaError::OrderNotFound(AggregateId::new())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status(SagaError::PaymentReferenceMismatch {
                order_id: AggregateId::new(),
                reference: PaymentReference::BankTransfer,
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(SagaError::Gateway(GatewayError::Declined("card".into()))),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status(SagaError::Store(StoreError::Corrupt("bad row".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_outbox_error_mapping() {
        assert_eq!(
            status(OutboxError::Unavailable("no table".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(ApiError::BadRequest("nope".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
