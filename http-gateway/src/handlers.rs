use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use rabbitmq_client::{PublishOptions, Publisher};
use serde::Deserialize;

#[derive(Clone)]
pub struct AppState {
    pub publisher: Arc<Publisher>,
}

#[derive(Debug, Deserialize, Default)]
pub struct EntryQuery {
    pub pattern: Option<String>,
    pub priority: Option<u8>,
    pub publish_to_queue: Option<String>,
}

/// `GET /up`: 200 iff the publisher is ready, else 503.
pub async fn up(State(state): State<AppState>) -> StatusCode {
    if state.publisher.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// `GET /entry`: a short static usage hint, mirroring the original entry
/// point's read-only branch.
pub async fn entry_hint() -> &'static str {
    "POST a body to /entry?pattern=<routing-key> to publish it."
}

/// `POST /entry`: reads the raw body and publishes it using `pattern`/`priority`/
/// `publish_to_queue` taken from the query string.
pub async fn entry_publish(
    State(state): State<AppState>,
    Query(query): Query<EntryQuery>,
    body: Bytes,
) -> (StatusCode, String) {
    if !state.publisher.is_ready() {
        return (StatusCode::SERVICE_UNAVAILABLE, "Rabbit did not start up!".to_string());
    }

    let options = PublishOptions {
        priority: query.priority.unwrap_or(0),
        pattern: query.pattern.unwrap_or_default(),
        publish_to_queue: query.publish_to_queue,
    };

    match state.publisher.publish(&body, options).await {
        Ok(()) => (StatusCode::OK, "Message published.".to_string()),
        Err(e) => {
            log::error!("http-gateway: publish failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_query_defaults_to_empty_pattern() {
        let query = EntryQuery::default();
        assert_eq!(query.pattern, None);
        assert_eq!(query.priority, None);
    }
}
