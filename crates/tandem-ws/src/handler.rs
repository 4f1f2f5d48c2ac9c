use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{Sink, Stream, StreamExt};
use serde::Deserialize;
use tandem_core::auth;
use tandem_core::{AppState, CloseReason, CoreError, GatewayConfig, Hub, Session};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::session::{run_reader, run_writer};

const REFUSAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub(crate) struct ConnectQuery {
    token: Option<String>,
}

pub(crate) async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = bearer_token(&headers).or(query.token.as_deref()) else {
        return (StatusCode::UNAUTHORIZED, "missing access token").into_response();
    };
    let claims = match auth::validate_access_token(token, &state.config.jwt_secret) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::debug!(error = %err, "gateway upgrade rejected");
            return (StatusCode::UNAUTHORIZED, "invalid access token").into_response();
        }
    };

    let max_frame_bytes = state.config.gateway.max_frame_bytes;
    ws.max_message_size(max_frame_bytes)
        .on_upgrade(move |socket| handle_connection(socket, state, claims.user_id))
        .into_response()
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

async fn handle_connection(socket: WebSocket, state: AppState, user_id: String) {
    let (sink, stream) = socket.split();
    match accept(&state.hub, user_id.as_str(), sink, stream, &state.config.gateway).await {
        Ok(handle) => {
            let session_id = handle.id();
            tracing::info!(user_id = %user_id, %session_id, "gateway session opened");
            handle.closed().await;
            tracing::info!(user_id = %user_id, %session_id, "gateway session closed");
        }
        Err(err) => {
            tracing::info!(user_id = %user_id, error = %err, "gateway session refused");
        }
    }
}

/// A registered session and its reader task. The reader owns cleanup, so
/// dropping the handle does not end the session.
pub struct SessionHandle {
    session: Arc<Session>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub fn id(&self) -> Uuid {
        self.session.id()
    }

    pub fn user_id(&self) -> &str {
        self.session.user_id()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Resolves once the session has been unregistered and its writer has
    /// finished.
    pub async fn closed(self) {
        let _ = self.task.await;
    }
}

/// Turns an authenticated socket into a live session: spawns the writer,
/// registers with the hub, then spawns the reader.
///
/// On refusal the writer still runs long enough to send the close frame,
/// and the error is returned.
pub async fn accept<S, R, E>(
    hub: &Hub,
    user_id: impl Into<String>,
    sink: S,
    stream: R,
    config: &GatewayConfig,
) -> Result<SessionHandle, CoreError>
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: fmt::Display + Send,
    R: Stream<Item = Result<Message, E>> + Unpin + Send + 'static,
    E: fmt::Display + Send + 'static,
{
    let (session, outbound) = Session::new(user_id, config.outbound_queue_capacity);
    let mut writer = tokio::spawn(run_writer(sink, outbound, session.clone()));

    if let Err(err) = hub.register(session.clone()).await {
        // No-op when the hub already closed it with a more specific reason.
        session.close_queue(Some(CloseReason::Shutdown));
        if tokio::time::timeout(REFUSAL_FLUSH_TIMEOUT, &mut writer)
            .await
            .is_err()
        {
            writer.abort();
        }
        return Err(err);
    }

    let task = tokio::spawn(run_reader(
        stream,
        session.clone(),
        hub.clone(),
        config.clone(),
        writer,
    ));
    Ok(SessionHandle { session, task })
}

#[cfg(test)]
mod tests {
    use super::bearer_token;
    use axum::http::{header, HeaderMap, HeaderValue};

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn extracts_bearer_tokens() {
        assert_eq!(bearer_token(&headers("Bearer abc.def")), Some("abc.def"));
        assert_eq!(bearer_token(&headers("bearer   abc")), Some("abc"));
    }

    #[test]
    fn ignores_other_schemes() {
        assert_eq!(bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }
}
