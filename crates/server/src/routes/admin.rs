//! Admin routes for policy management.

use std::{collections::BTreeMap, sync::Arc};

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use config::PolicyDecl;
use serde::Deserialize;

use crate::{AppState, auth};

/// Body of `/admin/policy/activate` and `/admin/policies/validate`.
///
/// `name` is accepted as an alias for `class`; both carry a class
/// reference of the form `module.path:ClassName`.
#[derive(Debug, Deserialize)]
pub(crate) struct PolicyRequest {
    #[serde(default)]
    class: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    config: Option<serde_json::Value>,
}

impl PolicyRequest {
    fn into_decl(self) -> Result<PolicyDecl, Response> {
        let Some(class) = self.class.or(self.name) else {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                "Request must carry a 'class' (or 'name') field",
            ));
        };

        let config = match self.config {
            None => BTreeMap::new(),
            Some(serde_json::Value::Object(map)) => {
                let mut kwargs = BTreeMap::new();
                for (key, value) in map {
                    match serde_yaml::to_value(&value) {
                        Ok(value) => {
                            kwargs.insert(key, value);
                        }
                        Err(error) => {
                            return Err(error_response(
                                StatusCode::BAD_REQUEST,
                                &format!("Invalid config value for '{key}': {error}"),
                            ));
                        }
                    }
                }
                kwargs
            }
            Some(_) => {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "'config' must be an object",
                ));
            }
        };

        Ok(PolicyDecl { class, config })
    }
}

/// Swap the active policy.
///
/// In-flight transactions finish under the policy they started with; the
/// swap is visible to transactions arriving afterwards.
pub(crate) async fn activate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PolicyRequest>,
) -> Response {
    if let Some(response) = require_admin(&state, &headers) {
        return response;
    }

    let decl = match request.into_decl() {
        Ok(decl) => decl,
        Err(response) => return response,
    };

    match state.manager.activate(&decl) {
        Ok(policy) => {
            log::info!("Admin activated policy '{}' ({})", policy.name(), decl.class);
            Json(serde_json::json!({
                "status": "activated",
                "policy": policy.name(),
                "class": decl.class,
            }))
            .into_response()
        }
        Err(error) => error_response(StatusCode::BAD_REQUEST, &error.to_string()),
    }
}

/// Inspect the active policy.
pub(crate) async fn current(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    if let Some(response) = require_admin(&state, &headers) {
        return response;
    }

    let policy = state.manager.current();

    Json(serde_json::json!({
        "policy": policy.name(),
        "available_classes": state.manager.registry().classes(),
    }))
    .into_response()
}

/// Dry-run load of a policy declaration without activating it.
pub(crate) async fn validate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PolicyRequest>,
) -> Response {
    if let Some(response) = require_admin(&state, &headers) {
        return response;
    }

    let decl = match request.into_decl() {
        Ok(decl) => decl,
        Err(response) => return response,
    };

    match state.manager.load(&decl) {
        Ok(policy) => Json(serde_json::json!({
            "valid": true,
            "policy": policy.name(),
        }))
        .into_response(),
        Err(error) => Json(serde_json::json!({
            "valid": false,
            "error": error.to_string(),
        }))
        .into_response(),
    }
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Option<Response> {
    if auth::admin_authorized(headers, state.config.server.admin_api_key.as_ref()) {
        return None;
    }

    Some(error_response(
        StatusCode::FORBIDDEN,
        "Admin access required. Provide a valid admin API key.",
    ))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": {
                "message": message,
                "type": if status == StatusCode::FORBIDDEN { "permission_error" } else { "invalid_request_error" },
                "code": status.as_u16(),
            }
        })),
    )
        .into_response()
}
