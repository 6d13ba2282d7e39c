use axum::Json;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::util::FormattedDateTime;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StatusResponse {
    pub service: String,
    pub status: String,
    pub timestamp: FormattedDateTime,
}

/// Unauthenticated handshake used by clients to check the API is up.
pub async fn status() -> Json<StatusResponse> {
    Json(StatusResponse {
        service: env!("CARGO_PKG_NAME").to_string(),
        status: "ok".to_string(),
        timestamp: OffsetDateTime::now_utc().into(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_handshake() {
        let Json(response) = status().await;

        assert_eq!(response.status, "ok");
        assert_eq!(response.service, env!("CARGO_PKG_NAME"));
    }
}
