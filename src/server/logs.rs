//! Open-ended streaming of an app's output.
//!
//! Each viewer gets its own bounded subscriber channel, drained into a
//! [`WheelBuffer`] that the response body reads from. A slow client loses the
//! oldest buffered lines rather than stalling the app's output pump. A
//! dedicated thread per viewer performs the blocking wheel reads. The stream
//! ends when the app stops; a client that disconnects is unsubscribed.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::stream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{ApiError, SharedState};
use crate::app::{LogSubscription, OutputStream};
use crate::wheel::{WheelBuffer, Written};

pub(super) async fn stdout(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    follow(state, name, OutputStream::Stdout).await
}

pub(super) async fn stderr(
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    follow(state, name, OutputStream::Stderr).await
}

/// Releases the subscription and wakes the body reader when the response is
/// dropped.
struct Viewer {
    wheel: Arc<WheelBuffer<String>>,
    subscription: LogSubscription,
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.subscription.unsubscribe();
        self.wheel.close();
    }
}

async fn follow(state: SharedState, name: String, which: OutputStream) -> Result<Response, ApiError> {
    let app = state.runner.get_app(&name)?;
    let (tx, mut rx) = mpsc::channel(state.subscriber_capacity);
    let subscription = match app.stream(which, tx).await {
        Ok(subscription) => subscription,
        Err(e) => return Err(ApiError::for_app(&app, e).await),
    };
    debug!(app = %name, stream = which.as_str(), "log viewer attached");

    let wheel = Arc::new(WheelBuffer::new(state.log_backlog));
    {
        let wheel = Arc::clone(&wheel);
        tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                match wheel.write(line) {
                    Ok(Written::Stored) => {}
                    Ok(Written::Overwrote(_)) => trace!("log viewer behind, dropped oldest line"),
                    Err(_) => break,
                }
            }
            // Topic closed or viewer gone.
            wheel.close();
        });
    }

    let viewer = Viewer {
        wheel: Arc::clone(&wheel),
        subscription,
    };

    // Wheel reads block, so they run on a thread of their own rather than the
    // runtime's blocking pool.
    let (out_tx, out_rx) = mpsc::channel::<Bytes>(1);
    std::thread::Builder::new()
        .name(format!("log-{}", name))
        .spawn(move || {
            while let Ok(mut line) = wheel.read() {
                line.push('\n');
                if out_tx.blocking_send(Bytes::from(line)).is_err() {
                    break;
                }
            }
        })
        .map_err(|e| ApiError::internal(format!("Failed to start log viewer: {}", e)))?;

    let lines = stream::unfold((viewer, out_rx), |(viewer, mut out_rx)| async move {
        let line = out_rx.recv().await?;
        Some((Ok::<_, Infallible>(line), (viewer, out_rx)))
    });

    Ok((
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}
