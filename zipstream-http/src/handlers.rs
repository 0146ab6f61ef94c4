use crate::AppState;
use crate::body;
use crate::error::ApiError;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::response::{Html, IntoResponse, Response};
use http::{HeaderValue, StatusCode, header};
use tracing::Instrument;
use zipstream_core::{StreamSession, ZipStreamError};

pub async fn index_page(State(state): State<AppState>) -> Response {
    match tokio::fs::read_to_string(&state.config().index_page).await {
        Ok(html) => Html(html).into_response(),
        Err(e) => {
            tracing::warn!(
                path = %state.config().index_page.display(),
                error = %e,
                "index page unavailable"
            );
            (StatusCode::NOT_FOUND, "Index page not available").into_response()
        }
    }
}

/// `GET /archive/{id}/`: streams a ZIP of the photo directory named `id`.
///
/// Lookup and launch failures are answered with a status code. Once the
/// headers are out, the relay task owns the archiver and the body; failures
/// after that point truncate the download.
pub async fn archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let dir = state.locator().locate(&id).await?;
    let disposition = content_disposition(&id)?;

    let job = state.launcher().launch(&dir).await?;
    let pid = job.pid();

    let (sink, body) = body::channel();
    let response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/zip")
        .header(header::CONTENT_DISPOSITION, disposition)
        .body(Body::from_stream(body))
        .map_err(|e| ZipStreamError::Stream(std::io::Error::other(e)))?;

    let mut session = StreamSession::from_config(id.as_str(), state.config());
    session.headers_sent();
    let cancel = state.shutdown().child_token();
    let span = tracing::info_span!("archive", id = %id, ?pid);
    tokio::spawn(
        async move {
            if let Err(e) = session.run(job, sink, cancel).await {
                tracing::debug!(error = %e, state = ?session.terminal_state(), "session ended early");
            }
        }
        .instrument(span),
    );

    Ok(response)
}

fn content_disposition(id: &str) -> Result<HeaderValue, ApiError> {
    let name = id.replace('\\', "\\\\").replace('"', "\\\"");
    HeaderValue::from_str(&format!("attachment; filename=\"{name}.zip\"")).map_err(|_| {
        ApiError::BadRequest(format!("The archive name {id:?} cannot be used as a file name"))
    })
}
