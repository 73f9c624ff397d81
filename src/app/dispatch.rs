//! HTTP over the app's unix socket.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::body::Body;
use axum::http::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tokio::time::Instant;
use tracing::debug;

use super::process::ProcessHandle;

/// Dials the app's socket once per request.
#[derive(Debug, Clone)]
pub struct UnixTransport {
    socket: PathBuf,
}

impl UnixTransport {
    pub fn new(socket: impl Into<PathBuf>) -> Self {
        Self {
            socket: socket.into(),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Send `req` and return the app's response with its body streamed
    /// through unchanged.
    pub async fn send(&self, req: Request<Body>) -> Result<Response<Body>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .with_context(|| format!("Failed to connect to {}", self.socket.display()))?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("HTTP handshake with app failed")?;

        let socket = self.socket.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(socket = %socket.display(), error = %e, "app connection closed with error");
            }
        });

        let response = sender
            .send_request(req)
            .await
            .context("App did not answer the request")?;
        Ok(response.map(Body::new))
    }
}

/// Strip the leading `/<name>` segment from `uri`, keeping the query.
/// `/<name>` alone maps to `/`.
pub fn rewrite_uri(name: &str, uri: &Uri) -> Result<Uri> {
    let path = uri.path();
    let rest = path
        .strip_prefix('/')
        .and_then(|p| p.strip_prefix(name))
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .with_context(|| format!("Path {} is not under /{}", path, name))?;

    let rest = if rest.is_empty() { "/" } else { rest };
    let target = match uri.query() {
        Some(query) => format!("{}?{}", rest, query),
        None => rest.to_string(),
    };
    target
        .parse()
        .with_context(|| format!("Invalid rewritten path {}", target))
}

/// Dial `socket` until it accepts a connection. Fails if the process exits
/// first or `timeout` passes.
pub(crate) async fn wait_until_ready(
    socket: &Path,
    process: &mut ProcessHandle,
    timeout: Duration,
    poll: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = process.try_exit()? {
            bail!("Process exited before accepting connections ({})", status);
        }
        if UnixStream::connect(socket).await.is_ok() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            bail!(
                "Socket {} not ready after {}ms",
                socket.display(),
                timeout.as_millis()
            );
        }
        tokio::time::sleep(poll).await;
    }
}
