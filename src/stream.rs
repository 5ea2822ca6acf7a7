//! Transport side of one ext_proc stream.
//!
//! The engine only needs to receive the next request and send a reply;
//! [`ProcessingStream`] is that seam. [`GrpcStream`] backs it with a tonic
//! stream, [`ChannelStream`] with in-process channels.

use tokio::sync::mpsc;
use tonic::{Status, Streaming};

use crate::proto::{ProcessingRequest, ProcessingResponse};

#[async_trait::async_trait]
pub trait ProcessingStream: Send {
    /// Next request, or `None` once the peer has closed its side.
    async fn recv(&mut self) -> Result<Option<ProcessingRequest>, Status>;

    async fn send(&mut self, response: ProcessingResponse) -> Result<(), Status>;
}

/// Server side of a tonic bidirectional stream.
pub struct GrpcStream {
    inbound: Streaming<ProcessingRequest>,
    outbound: mpsc::Sender<Result<ProcessingResponse, Status>>,
}

impl GrpcStream {
    pub fn new(
        inbound: Streaming<ProcessingRequest>,
        outbound: mpsc::Sender<Result<ProcessingResponse, Status>>,
    ) -> Self {
        Self { inbound, outbound }
    }
}

#[async_trait::async_trait]
impl ProcessingStream for GrpcStream {
    async fn recv(&mut self) -> Result<Option<ProcessingRequest>, Status> {
        self.inbound.message().await
    }

    async fn send(&mut self, response: ProcessingResponse) -> Result<(), Status> {
        self.outbound
            .send(Ok(response))
            .await
            .map_err(|_| Status::cancelled("response stream closed by peer"))
    }
}

/// Stream backed by plain channels. The peer half is a [`ChannelPeer`].
pub struct ChannelStream {
    inbound: mpsc::Receiver<ProcessingRequest>,
    outbound: mpsc::Sender<ProcessingResponse>,
}

/// The proxy's end of a [`ChannelStream`].
pub struct ChannelPeer {
    pub requests: mpsc::Sender<ProcessingRequest>,
    pub responses: mpsc::Receiver<ProcessingResponse>,
}

impl ChannelStream {
    pub fn pair(capacity: usize) -> (ChannelStream, ChannelPeer) {
        let (req_tx, req_rx) = mpsc::channel(capacity);
        let (resp_tx, resp_rx) = mpsc::channel(capacity);
        (
            ChannelStream {
                inbound: req_rx,
                outbound: resp_tx,
            },
            ChannelPeer {
                requests: req_tx,
                responses: resp_rx,
            },
        )
    }
}

#[async_trait::async_trait]
impl ProcessingStream for ChannelStream {
    async fn recv(&mut self) -> Result<Option<ProcessingRequest>, Status> {
        Ok(self.inbound.recv().await)
    }

    async fn send(&mut self, response: ProcessingResponse) -> Result<(), Status> {
        self.outbound
            .send(response)
            .await
            .map_err(|_| Status::cancelled("peer dropped the response channel"))
    }
}
