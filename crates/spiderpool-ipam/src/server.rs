use crate::allocate::Ipam;
use crate::types::{AllocateRequest, ReleaseRequest};
use serde::{Deserialize, Serialize};
use spiderpool_core::{ErrorCode, IpamError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One JSON object per line in each direction
#[derive(Debug, Deserialize)]
#[serde(tag = "request")]
enum SocketRequest {
    Allocate(AllocateRequest),
    Release(ReleaseRequest),
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: ErrorCode,
    message: String,
}

impl ErrorResponse {
    fn from_err(err: &IpamError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// The local allocation socket served to the node's network plugin
pub struct IpamServer {
    ipam: Arc<Ipam>,
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl IpamServer {
    pub fn new(ipam: Arc<Ipam>, socket_path: impl AsRef<Path>) -> Self {
        Self {
            ipam,
            socket_path: socket_path.as_ref().to_path_buf(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Serve until cancelled. A stale socket file from a previous run is
    /// removed before binding; the file is cleaned up on shutdown.
    pub async fn run(&self, token: CancellationToken) -> std::io::Result<()> {
        let _ = std::fs::remove_file(&self.socket_path);
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(&self.socket_path)?;
        info!("IPAM socket listening on {}", self.socket_path.display());

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("IPAM socket server shutting down");
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let ipam = Arc::clone(&self.ipam);
                            let timeout = self.request_timeout;
                            let conn_token = token.clone();
                            tokio::spawn(async move {
                                if let Err(err) = handle_connection(ipam, stream, timeout, conn_token).await {
                                    warn!("IPAM connection error: {}", err);
                                }
                            });
                        }
                        Err(err) => error!("Failed to accept IPAM connection: {}", err),
                    }
                }
            }
        }
    }
}

async fn handle_connection(
    ipam: Arc<Ipam>,
    stream: UnixStream,
    timeout: Duration,
    token: CancellationToken,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }

        let response = dispatch(&ipam, line.trim(), timeout).await;
        write_half.write_all(response.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
        write_half.flush().await?;
    }
}

async fn dispatch(ipam: &Ipam, line: &str, timeout: Duration) -> String {
    let request: SocketRequest = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return error_json(&IpamError::invalid_argument(format!(
                "malformed request: {}",
                err
            )))
        }
    };

    // the per-request deadline; cancellation triggers the same compensating
    // release path as any failed allocation, via the garbage collector
    match request {
        SocketRequest::Allocate(req) => {
            debug!("Allocate request for pod {}/{}", req.pod_namespace, req.pod_name);
            match tokio::time::timeout(timeout, ipam.allocate(&req)).await {
                Ok(Ok(response)) => {
                    serde_json::to_string(&response).unwrap_or_else(|_| "{}".to_string())
                }
                Ok(Err(err)) => error_json(&err),
                Err(_) => error_json(&IpamError::internal("allocation deadline exceeded")),
            }
        }
        SocketRequest::Release(req) => {
            debug!("Release request for pod {}/{}", req.pod_namespace, req.pod_name);
            match tokio::time::timeout(timeout, ipam.release(&req)).await {
                Ok(Ok(())) => "{}".to_string(),
                Ok(Err(err)) => error_json(&err),
                Err(_) => error_json(&IpamError::internal("release deadline exceeded")),
            }
        }
    }
}

fn error_json(err: &IpamError) -> String {
    serde_json::to_string(&ErrorResponse::from_err(err)).unwrap_or_else(|_| {
        r#"{"code":"ServerError","message":"failed to encode error"}"#.to_string()
    })
}
