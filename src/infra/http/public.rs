use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{
        HeaderValue, Method, StatusCode, Uri,
        header::{AGE, ALLOW, CACHE_CONTROL, CONTENT_TYPE},
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};

use crate::{
    application::error::{AppError, HttpError},
    cache::{Coordinator, Freshness, QueueSnapshot, RevalidationAck, ServedPage, normalize_route},
    infra::error::InfraError,
};

use super::{
    CACHE_STATUS_HEADER,
    middleware::{log_responses, set_request_context},
};

const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

#[derive(Clone)]
pub struct HttpState {
    pub coordinator: Arc<Coordinator>,
}

pub fn build_router(state: HttpState) -> Router {
    let control_routes = Router::new()
        .route("/_isr/status", get(status))
        .route("/_isr/revalidate", post(revalidate));

    control_routes
        .fallback(serve_page)
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context))
}

#[derive(Debug, Serialize)]
struct StatusBody {
    entries: usize,
    queue: QueueSnapshot,
}

async fn status(State(state): State<HttpState>) -> Result<Json<StatusBody>, AppError> {
    let entries = state
        .coordinator
        .store()
        .count_records()
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    let queue = state.coordinator.queue().snapshot();

    Ok(Json(StatusBody { entries, queue }))
}

#[derive(Debug, Deserialize)]
struct RevalidateRequest {
    route: String,
}

async fn revalidate(
    State(state): State<HttpState>,
    Json(request): Json<RevalidateRequest>,
) -> Result<(StatusCode, Json<RevalidationAck>), HttpError> {
    let route = request.route.trim();
    if route.is_empty() {
        return Err(HttpError::new(
            "infra::http::revalidate",
            StatusCode::BAD_REQUEST,
            "Route is required",
            "revalidation request carried an empty route",
        ));
    }

    let ack = state.coordinator.revalidate(&normalize_route(route)).await;
    Ok((StatusCode::ACCEPTED, Json(ack)))
}

async fn serve_page(State(state): State<HttpState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        let mut response = StatusCode::METHOD_NOT_ALLOWED.into_response();
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
        return response;
    }

    let raw = uri
        .path_and_query()
        .map_or_else(|| uri.path(), |path_and_query| path_and_query.as_str());
    let route = normalize_route(raw);

    match state.coordinator.handle(&route).await {
        Ok(page) => page_response(page),
        Err(err) => HttpError::from(err).into_response(),
    }
}

fn page_response(page: ServedPage) -> Response {
    let freshness = page.freshness;
    let age = page.age_seconds();

    let mut response = (
        StatusCode::OK,
        [(CONTENT_TYPE, HeaderValue::from_static(HTML_CONTENT_TYPE))],
        page.rendering,
    )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(freshness.as_str()),
    );
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    if freshness != Freshness::Miss {
        headers.insert(AGE, HeaderValue::from(age));
    }
    response
}
