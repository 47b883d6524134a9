//! axum glue for emitters
//!
//! Handlers mark a successful business action by returning a
//! [`LoggedAction`] response extension; the [`log_actions`] middleware
//! picks it up after the handler ran and publishes an [`ActionEvent`]
//! attributed to the `X-User-Id` request header.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{http::StatusCode, middleware, routing::post, Extension, Router};
//! use actionlog::http::{log_actions, LoggedAction};
//! use actionlog::BatchPublisher;
//!
//! async fn post_rates() -> (StatusCode, Extension<LoggedAction>) {
//!     (StatusCode::CREATED, Extension(LoggedAction::new("post_rates")))
//! }
//!
//! fn router(publisher: Arc<BatchPublisher>) -> Router {
//!     Router::new()
//!         .route("/cargo/rates", post(post_rates))
//!         .layer(middleware::from_fn_with_state(publisher, log_actions))
//! }
//! ```

use crate::publisher::BatchPublisher;
use crate::types::ActionEvent;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;

/// Request header carrying the acting user's id
pub const USER_ID_HEADER: &str = "x-user-id";

/// Response extension naming the action a handler completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedAction(String);

impl LoggedAction {
    pub fn new(action: impl Into<String>) -> Self {
        Self(action.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Request extension with the acting user, inserted by [`log_actions`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActingUser(pub Option<String>);

/// Read the acting user id from request headers (blank counts as absent)
pub fn user_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Middleware publishing an action event for every 2xx response that
/// carries a [`LoggedAction`]
///
/// Publishing is fire-and-forget: a failure is logged and the response is
/// returned untouched.
pub async fn log_actions(
    State(publisher): State<Arc<BatchPublisher>>,
    mut request: Request,
    next: Next,
) -> Response {
    let user_id = user_id_from_headers(request.headers());
    request
        .extensions_mut()
        .insert(ActingUser(user_id.clone()));

    let response = next.run(request).await;
    if !response.status().is_success() {
        return response;
    }

    let Some(action) = response
        .extensions()
        .get::<LoggedAction>()
        .map(|a| a.as_str().to_string())
    else {
        return response;
    };

    let published = ActionEvent::new(action.as_str()).and_then(|event| {
        let event = match user_id {
            Some(id) => event.with_user_id(id),
            None => event,
        };
        publisher.publish(event)
    });
    if let Err(e) = published {
        tracing::warn!(action = %action, error = %e, "Failed to log action");
    }

    response
}
