use axum::body::Body;
use axum::extract::{Request, State};
use axum::response::Response;

use super::{ApiError, SharedState};

/// Forward the request to the app named by the first path segment.
pub(super) async fn proxy(
    State(state): State<SharedState>,
    req: Request<Body>,
) -> Result<Response, ApiError> {
    let name = req
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();

    let app = state.runner.get_app(&name)?;
    match app.dispatch(req).await {
        Ok(resp) => Ok(resp),
        Err(e) => Err(ApiError::for_app(&app, e).await),
    }
}
