//! Sample app for apprunner: serves `GET /greeting` on a unix socket.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use axum::{Router, extract::Request, routing::get};
use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser)]
#[command(name = "hello-world", about = "Greets over a unix socket")]
struct Args {
    /// Socket path to listen on
    #[arg(long)]
    unix_socket: PathBuf,
}

async fn greeting(req: Request) -> &'static str {
    println!("{} {}", req.method(), req.uri());
    "hello world"
}

async fn shutdown_signal(socket: PathBuf) {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = terminate => {},
    }
    println!("shutting down");
    let _ = std::fs::remove_file(&socket);
}

fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind {}", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let listener = bind(&args.unix_socket)?;
    println!("listening on {}", args.unix_socket.display());

    let app = Router::new().route("/greeting", get(greeting));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(args.unix_socket.clone()))
        .await
        .context("Server error")?;
    Ok(())
}
