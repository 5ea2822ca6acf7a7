//! gRPC binding: serves [`ExtProcessor`] as
//! `envoy.service.ext_proc.v3.ExternalProcessor`.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status, Streaming};

use crate::proto::external_processor_server::{ExternalProcessor, ExternalProcessorServer};
use crate::proto::{ProcessingRequest, ProcessingResponse};
use crate::service::ExtProcessor;
use crate::stream::GrpcStream;

/// Replies buffered per stream before the engine waits on the peer.
const STREAM_BUFFER: usize = 4;

#[tonic::async_trait]
impl ExternalProcessor for ExtProcessor {
    type ProcessStream = ReceiverStream<Result<ProcessingResponse, Status>>;

    async fn process(
        &self,
        request: Request<Streaming<ProcessingRequest>>,
    ) -> Result<Response<Self::ProcessStream>, Status> {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        tokio::spawn(serve_stream(self.clone(), request.into_inner(), tx));
        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Drives one stream. The cancellation token handed to filters fires once
/// the peer stops reading responses.
async fn serve_stream(
    processor: ExtProcessor,
    inbound: Streaming<ProcessingRequest>,
    tx: mpsc::Sender<Result<ProcessingResponse, Status>>,
) {
    let cancel = CancellationToken::new();
    let mut stream = GrpcStream::new(inbound, tx.clone());
    let run = processor.process(&mut stream, &cancel);
    tokio::pin!(run);
    let result = loop {
        tokio::select! {
            res = &mut run => break res,
            _ = tx.closed(), if !cancel.is_cancelled() => cancel.cancel(),
        }
    };
    if let Err(err) = result {
        // the peer may already be gone
        let _ = tx.send(Err(err.to_status())).await;
    }
}

/// Where the gRPC server listens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    /// `unix:/path/to/socket`
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                anyhow::bail!("unix listen address needs a socket path");
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(ListenAddr::Tcp)
            .with_context(|| format!("invalid listen address '{}'", s))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Tcp(addr) => write!(f, "{}", addr),
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// Binds `addr` and serves until `shutdown` is cancelled.
pub async fn serve(processor: ExtProcessor, addr: ListenAddr, shutdown: CancellationToken) -> Result<()> {
    match addr {
        ListenAddr::Tcp(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("failed to bind gRPC listener on {}", addr))?;
            serve_listener(processor, listener, shutdown).await
        }
        ListenAddr::Unix(path) => serve_unix(processor, path, shutdown).await,
    }
}

/// Serves on an already bound TCP listener.
pub async fn serve_listener(
    processor: ExtProcessor,
    listener: TcpListener,
    shutdown: CancellationToken,
) -> Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), filters = ?processor.filter_names(), "gRPC server listening");
    Server::builder()
        .add_service(ExternalProcessorServer::new(processor))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .context("gRPC server failed")
}

#[cfg(unix)]
async fn serve_unix(processor: ExtProcessor, path: PathBuf, shutdown: CancellationToken) -> Result<()> {
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;

    // a socket file left behind by a previous run would make bind fail
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("failed to bind unix socket {}", path.display()))?;
    tracing::info!(path = %path.display(), filters = ?processor.filter_names(), "gRPC server listening");
    Server::builder()
        .add_service(ExternalProcessorServer::new(processor))
        .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
            shutdown.cancelled().await
        })
        .await
        .context("gRPC server failed")
}

#[cfg(not(unix))]
async fn serve_unix(_: ExtProcessor, path: PathBuf, _: CancellationToken) -> Result<()> {
    anyhow::bail!("unix sockets are not supported on this platform: {}", path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_listen_addresses() {
        assert_eq!(
            "127.0.0.1:8081".parse::<ListenAddr>().unwrap(),
            ListenAddr::Tcp("127.0.0.1:8081".parse().unwrap())
        );
        assert_eq!(
            "unix:/tmp/extproc.sock".parse::<ListenAddr>().unwrap(),
            ListenAddr::Unix(PathBuf::from("/tmp/extproc.sock"))
        );
        assert!("unix:".parse::<ListenAddr>().is_err());
        assert!(":8081".parse::<ListenAddr>().is_err());
    }
}
