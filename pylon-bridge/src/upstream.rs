//! Upstream socket creation.
//!
//! The bridge keeps at most one upstream socket per datacenter and shares it
//! across every client routed there. How a socket is *opened* is pluggable
//! so tests can hand the bridge in-memory pipes instead of TCP.

use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Opens a byte stream to an upstream endpoint.
pub trait UpstreamConnector: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<Self::Stream>> + Send;
}

/// The production connector: plain TCP.
pub struct TcpConnector;

impl UpstreamConnector for TcpConnector {
    type Stream = TcpStream;

    fn connect(&self, addr: &str) -> impl Future<Output = io::Result<TcpStream>> + Send {
        let addr = addr.to_owned();
        async move { TcpStream::connect(addr).await }
    }
}

/// Handle to a live upstream: frames pushed into `tx` are written to the
/// datacenter socket by its single writer task, in order.
#[derive(Clone)]
pub(crate) struct UpstreamHandle {
    pub(crate) tx: mpsc::Sender<Vec<u8>>,
}

impl UpstreamHandle {
    /// Whether the writer task behind this handle is still alive.
    pub(crate) fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }
}
