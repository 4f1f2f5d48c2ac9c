mod handler;
mod session;

use axum::{routing::get, Router};
use tandem_core::AppState;

pub use handler::{accept, SessionHandle};

pub fn gateway_router() -> Router<AppState> {
    Router::new().route("/ws", get(handler::ws_upgrade))
}
