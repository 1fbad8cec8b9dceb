use crate::frame::{FrameCodec, Msg};
use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};

/// Completion callback of one send. Runs on the stream's writer task
/// after the frame is handed to the socket (or fails).
pub type SendCallback = Box<dyn FnOnce(std::result::Result<(), &Error>) + Send>;

pub struct SendArg {
    pub msg: Msg,
    pub callback: Option<SendCallback>,
}

impl SendArg {
    pub fn new(msg: Msg) -> SendArg {
        SendArg {
            msg,
            callback: None,
        }
    }

    pub fn with_callback(msg: Msg, cb: SendCallback) -> SendArg {
        SendArg {
            msg,
            callback: Some(cb),
        }
    }
}

/// One outbound stream to a peer. Sends are queued on a bounded
/// channel and framed by a dedicated writer task, giving FIFO delivery
/// per stream and no ordering across streams. Delivery is
/// at-least-once: a callers retries on error and receivers must be
/// idempotent.
pub struct Stream {
    peer: String,
    tx: std::sync::Mutex<Option<mpsc::Sender<SendArg>>>,
}

impl Stream {
    pub fn new<W>(peer: impl Into<String>, w: W, compress: bool, capacity: usize) -> Arc<Stream>
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let peer = peer.into();
        let (tx, rx) = mpsc::channel(capacity);
        tokio::spawn(writer_loop(peer.clone(), w, compress, rx));
        Arc::new(Stream {
            peer,
            tx: std::sync::Mutex::new(Some(tx)),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Queue a message. Blocks when the stream's buffer is full; that
    /// back-pressure is the caller's throttle.
    pub async fn send(&self, arg: SendArg) -> Result<()> {
        let tx = {
            let guard = self.tx.lock().unwrap();
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| Error::StreamClosed(self.peer.clone()))?
        };
        tx.send(arg)
            .await
            .map_err(|_| Error::StreamClosed(self.peer.clone()))
    }

    /// Stop accepting sends; the writer drains what is queued and exits.
    pub fn close(&self) {
        self.tx.lock().unwrap().take();
    }
}

async fn writer_loop<W>(
    peer: String,
    w: W,
    compress: bool,
    mut rx: mpsc::Receiver<SendArg>,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut framed = FramedWrite::new(w, FrameCodec { compress });

    while let Some(SendArg { msg, callback }) = rx.recv().await {
        match framed.send(msg).await {
            Ok(()) => {
                if let Some(cb) = callback {
                    cb(Ok(()));
                }
            }
            Err(err) => {
                tracing::warn!(peer, %err, "stream write failed; closing");
                if let Some(cb) = callback {
                    cb(Err(&err));
                }
                // Fail the rest of the queue: FIFO means nothing after
                // a broken write can be delivered on this stream.
                rx.close();
                while let Some(SendArg { callback, .. }) = rx.recv().await {
                    if let Some(cb) = callback {
                        cb(Err(&err));
                    }
                }
                return;
            }
        }
    }
    let _ = framed.flush().await;
    tracing::debug!(peer, "stream writer drained");
}

/// Receiver half: dispatch every inbound frame to the handler until
/// EOF or abort.
#[async_trait::async_trait]
pub trait RecvHandler: Send + Sync {
    async fn recv(&self, msg: Msg) -> Result<()>;
}

pub async fn serve<R>(
    r: R,
    handler: Arc<dyn RecvHandler>,
    mut abort: watch::Receiver<bool>,
) -> Result<()>
where
    R: AsyncRead + Send + Unpin,
{
    let mut framed = FramedRead::new(r, FrameCodec::default());
    loop {
        if *abort.borrow() {
            return Ok(());
        }
        tokio::select! {
            frame = framed.next() => {
                match frame {
                    None => return Ok(()),
                    Some(Err(err)) => return Err(err),
                    Some(Ok(msg)) => {
                        if let Err(err) = handler.recv(msg).await {
                            tracing::warn!(%err, "receive handler failed");
                        }
                    }
                }
            }
            _ = abort.changed() => {}
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Header, ObjAttrs};
    use bytes::Bytes;
    use cluster::Bck;
    use std::sync::Mutex;

    fn msg(name: &str, body: &[u8]) -> Msg {
        Msg {
            header: Header {
                bck: Bck::ais("b"),
                obj_name: name.to_string(),
                attrs: ObjAttrs::default(),
                opaque: Bytes::new(),
            },
            payload: Some(Bytes::copy_from_slice(body)),
        }
    }

    struct Collect(Mutex<Vec<String>>);

    #[async_trait::async_trait]
    impl RecvHandler for Collect {
        async fn recv(&self, msg: Msg) -> Result<()> {
            self.0.lock().unwrap().push(msg.header.obj_name);
            Ok(())
        }
    }

    #[tokio::test]
    async fn fifo_delivery_and_callbacks() {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let stream = Stream::new("t02", client, false, 8);

        for i in 0..19 {
            stream
                .send(SendArg::new(msg(&format!("obj-{i:02}"), b"x")))
                .await
                .unwrap();
        }
        // The completion callback of the last send gates the assertion.
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        stream
            .send(SendArg::with_callback(
                msg("obj-19", b"x"),
                Box::new(move |res| {
                    assert!(res.is_ok());
                    let _ = done_tx.send(());
                }),
            ))
            .await
            .unwrap();
        done_rx.await.unwrap();

        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        let (_abort_tx, abort_rx) = watch::channel(false);
        let h2 = handler.clone();
        let srv = tokio::spawn(async move { serve(server, h2, abort_rx).await });

        // Drop the sender so the reader sees EOF once drained.
        drop(stream);
        srv.await.unwrap().unwrap();

        let got = handler.0.lock().unwrap().clone();
        let want: Vec<String> = (0..20).map(|i| format!("obj-{i:02}")).collect();
        assert_eq!(got, want);
    }

    #[tokio::test]
    async fn closed_stream_rejects_sends() {
        let (client, server) = tokio::io::duplex(1024);
        let stream = Stream::new("t03", client, false, 2);
        // Killing the read half makes subsequent writes fail and the
        // writer loop shut the queue down.
        drop(server);

        let mut closed = false;
        for i in 0..64 {
            if stream.send(SendArg::new(msg(&i.to_string(), b"y"))).await.is_err() {
                closed = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(closed, "writes kept succeeding on a dead stream");
    }
}
