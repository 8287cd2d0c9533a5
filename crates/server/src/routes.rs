//! Route registration for the client and admin surfaces.

use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    Router,
    routing::{get, post},
};
use futures::Stream;
use tokio::sync::mpsc;

use crate::AppState;

mod admin;
mod anthropic;
mod openai;

/// The client-facing LLM routes.
pub(crate) fn client_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(openai::chat_completions))
        .route("/v1/messages", post(anthropic::messages))
        .with_state(state)
}

/// The admin surface.
pub(crate) fn admin_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/admin/policy/activate", post(admin::activate))
        .route("/admin/policy/current", get(admin::current))
        .route("/admin/policies/validate", post(admin::validate))
        .with_state(state)
}

/// Adapts a bounded channel receiver into a stream, for SSE bodies fed by
/// a formatter task.
pub(crate) struct ChannelStream<T>(pub(crate) mpsc::Receiver<T>);

impl<T> Stream for ChannelStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_recv(cx)
    }
}
