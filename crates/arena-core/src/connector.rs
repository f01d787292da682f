//! Opening byte streams to agent targets.
//!
//! The connection manager is transport-agnostic: it asks a [`Connector`]
//! for a bidirectional stream and speaks the line protocol over it.
//! [`TcpConnector`] resolves `host:port` targets; tests plug in in-memory
//! duplex streams.

use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};

/// A bidirectional byte stream to one agent.
pub trait AgentStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AgentStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed agent stream.
pub type BoxedStream = Box<dyn AgentStream>;

/// Opens streams to agent targets.
pub trait Connector: Send + Sync {
    /// Open a stream to `target`. The caller bounds this with its own timeout.
    fn connect<'a>(&'a self, target: &'a str) -> BoxFuture<'a, std::io::Result<BoxedStream>>;
}

/// Connects to `host:port` targets over TCP.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect<'a>(&'a self, target: &'a str) -> BoxFuture<'a, std::io::Result<BoxedStream>> {
        async move {
            let stream = tokio::net::TcpStream::connect(target).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        }
        .boxed()
    }
}
