//! Intra-data plumbing: TCP dialing with a stream-name preamble, and
//! the accept loop that routes inbound streams to the EC engine.

use ec::manager::{Manager, ReqHandler, RespHandler};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

pub const TR_EC_REQ: &str = "ec-req";
pub const TR_EC_RESP: &str = "ec-resp";

/// Dials a peer's intra-data endpoint and announces which logical
/// stream this connection carries (one length-prefixed name), after
/// which the framed traffic begins.
pub struct TcpDialer {
    trname: &'static str,
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(trname: &'static str, timeout: Duration) -> Arc<TcpDialer> {
        Arc::new(TcpDialer { trname, timeout })
    }
}

#[async_trait::async_trait]
impl transport::Dialer for TcpDialer {
    async fn dial(
        &self,
        node: &cluster::Snode,
    ) -> transport::Result<Box<dyn AsyncWrite + Send + Unpin>> {
        let connect = tokio::net::TcpStream::connect(&node.intra_data_url);
        let mut stream = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| {
                transport::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dialing {} timed out", node.intra_data_url),
                ))
            })??;

        stream.write_u8(self.trname.len() as u8).await?;
        stream.write_all(self.trname.as_bytes()).await?;
        Ok(Box::new(stream))
    }
}

/// Accept loop of the intra-data listener: read the stream-name
/// preamble and hand the connection to the matching receive handler.
pub async fn serve_data(
    listener: TcpListener,
    manager: Arc<Manager>,
    stop: tokio::sync::watch::Receiver<bool>,
) {
    let mut stop_accept = stop.clone();
    loop {
        let (mut conn, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(c) => c,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    continue;
                }
            },
            _ = stop_accept.wait_for(|v| *v) => return,
        };

        let manager = manager.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut len = [0u8; 1];
            if conn.read_exact(&mut len).await.is_err() {
                return;
            }
            let mut name = vec![0u8; len[0] as usize];
            if conn.read_exact(&mut name).await.is_err() {
                return;
            }

            let result = match name.as_slice() {
                b if b == TR_EC_REQ.as_bytes() => {
                    transport::serve(conn, Arc::new(ReqHandler(manager)), stop).await
                }
                b if b == TR_EC_RESP.as_bytes() => {
                    transport::serve(conn, Arc::new(RespHandler(manager)), stop).await
                }
                other => {
                    tracing::warn!(
                        %peer_addr,
                        trname = %String::from_utf8_lossy(other),
                        "unknown stream name"
                    );
                    return;
                }
            };
            if let Err(err) = result {
                tracing::warn!(%peer_addr, %err, "stream receive failed");
            }
        });
    }
}
