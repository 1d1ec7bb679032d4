//! Bidirectional byte relay between a client and its upstream.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::is_benign_close_io;

const BUFFER_SIZE: usize = 8192;

/// Bytes moved by a finished relay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RelayOutcome {
    pub to_upstream: u64,
    pub from_upstream: u64,
}

/// Relay until both directions have finished.
///
/// EOF in one direction half-closes the opposite socket's write side and
/// lets the other direction keep flowing.
pub(crate) async fn relay(
    client: &mut TcpStream,
    upstream: &mut TcpStream,
    idle_timeout: Option<Duration>,
) -> RelayOutcome {
    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();

    let (to_upstream, from_upstream) = tokio::join!(
        pipe(&mut client_read, &mut upstream_write, idle_timeout, "to_upstream"),
        pipe(&mut upstream_read, &mut client_write, idle_timeout, "from_upstream"),
    );

    RelayOutcome {
        to_upstream,
        from_upstream,
    }
}

/// Copy one direction, then shut down the writer.
async fn pipe<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle_timeout: Option<Duration>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    let mut buf = vec![0u8; BUFFER_SIZE];

    let result: io::Result<()> = loop {
        let read_result = match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, reader.read(&mut buf)).await {
                Ok(result) => result,
                Err(_) => break Err(io::Error::new(io::ErrorKind::TimedOut, "idle timeout")),
            },
            None => reader.read(&mut buf).await,
        };

        match read_result {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = writer.write_all(&buf[..n]).await {
                    break Err(e);
                }
                total += n as u64;
            }
            Err(e) => break Err(e),
        }
    };

    if let Err(e) = result {
        if is_benign_close_io(&e) {
            debug!(direction, error = %e, "Peer went away");
        } else {
            debug!(direction, error = %e, "Relay direction failed");
        }
    }

    if let Err(e) = writer.shutdown().await {
        if !is_benign_close_io(&e) {
            debug!(direction, error = %e, "Shutdown failed");
        }
    }

    total
}
