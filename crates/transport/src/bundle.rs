use crate::stream::{SendArg, Stream};
use crate::{Error, Result};
use cluster::{Smap, Snode};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::AsyncWrite;
use tokio::sync::RwLock;

/// Opens the outbound byte stream to a peer. Production dials the
/// peer's intra-data endpoint; tests hand out in-memory pipes.
#[async_trait::async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, node: &Snode) -> Result<Box<dyn AsyncWrite + Send + Unpin>>;
}

/// A named set of per-target streams that follows cluster membership:
/// `smap_changed` opens streams to new targets and closes streams to
/// departed ones.
pub struct Bundle {
    trname: String,
    self_id: String,
    compress: bool,
    capacity: usize,
    dialer: Arc<dyn Dialer>,
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl Bundle {
    pub fn new(
        trname: impl Into<String>,
        self_id: impl Into<String>,
        dialer: Arc<dyn Dialer>,
        compress: bool,
        capacity: usize,
    ) -> Arc<Bundle> {
        Arc::new(Bundle {
            trname: trname.into(),
            self_id: self_id.into(),
            compress,
            capacity,
            dialer,
            streams: RwLock::new(HashMap::new()),
        })
    }

    pub fn trname(&self) -> &str {
        &self.trname
    }

    /// Reconcile the stream set with a new cluster map.
    pub async fn smap_changed(&self, smap: &Smap) -> Result<()> {
        let mut streams = self.streams.write().await;

        // Close streams to targets that left.
        let gone: Vec<String> = streams
            .keys()
            .filter(|id| !smap.targets.contains_key(*id))
            .cloned()
            .collect();
        for id in gone {
            if let Some(s) = streams.remove(&id) {
                s.close();
                tracing::info!(trname = %self.trname, peer = %id, "closed stream to departed target");
            }
        }

        // Open streams to new targets (never to ourselves). A peer
        // that cannot be dialed now is retried on the next map change.
        let mut last_err = None;
        for (id, node) in &smap.targets {
            if *id == self.self_id || streams.contains_key(id) {
                continue;
            }
            match self.dialer.dial(node).await {
                Ok(w) => {
                    streams.insert(
                        id.clone(),
                        Stream::new(id.clone(), w, self.compress, self.capacity),
                    );
                    tracing::info!(trname = %self.trname, peer = %id, "opened stream");
                }
                Err(err) => {
                    tracing::warn!(trname = %self.trname, peer = %id, %err, "dial failed");
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub async fn send_to(&self, node_id: &str, arg: SendArg) -> Result<()> {
        let stream = {
            let streams = self.streams.read().await;
            streams
                .get(node_id)
                .cloned()
                .ok_or_else(|| Error::NoStream(node_id.to_string()))?
        };
        stream.send(arg).await
    }

    pub async fn num_streams(&self) -> usize {
        self.streams.read().await.len()
    }

    pub async fn close(&self) {
        let mut streams = self.streams.write().await;
        for (_, s) in streams.drain() {
            s.close();
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::frame::{Header, Msg, ObjAttrs};
    use crate::stream::{serve, RecvHandler};
    use bytes::Bytes;
    use cluster::{Bck, NodeKind};
    use std::sync::Mutex;
    use tokio::sync::watch;

    struct PipeDialer {
        // Dialed peers and the collector tasks draining their pipes.
        received: Arc<Mutex<HashMap<String, Vec<String>>>>,
    }

    struct PipeHandler {
        peer: String,
        received: Arc<Mutex<HashMap<String, Vec<String>>>>,
    }

    #[async_trait::async_trait]
    impl RecvHandler for PipeHandler {
        async fn recv(&self, msg: Msg) -> Result<()> {
            self.received
                .lock()
                .unwrap()
                .entry(self.peer.clone())
                .or_default()
                .push(msg.header.obj_name);
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Dialer for PipeDialer {
        async fn dial(&self, node: &Snode) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let handler = Arc::new(PipeHandler {
                peer: node.id.clone(),
                received: self.received.clone(),
            });
            let (_tx, abort) = watch::channel(false);
            tokio::spawn(async move {
                let _tx = _tx; // keep the abort channel open for the test's duration
                let _ = serve(server, handler, abort).await;
            });
            Ok(Box::new(client))
        }
    }

    fn smap_of(ids: &[&str]) -> Smap {
        let mut smap = Smap::new(1);
        for id in ids {
            smap.add_target(Snode::new(*id, NodeKind::Target));
        }
        smap
    }

    fn msg(name: &str) -> Msg {
        Msg {
            header: Header {
                bck: Bck::ais("b"),
                obj_name: name.to_string(),
                attrs: ObjAttrs::default(),
                opaque: Bytes::new(),
            },
            payload: None,
        }
    }

    #[tokio::test]
    async fn membership_diff_opens_and_closes() {
        let received = Arc::new(Mutex::new(HashMap::new()));
        let bundle = Bundle::new(
            "ec-req",
            "t00",
            Arc::new(PipeDialer {
                received: received.clone(),
            }),
            false,
            8,
        );

        bundle.smap_changed(&smap_of(&["t00", "t01", "t02"])).await.unwrap();
        // No stream to ourselves.
        assert_eq!(bundle.num_streams().await, 2);

        bundle.send_to("t01", SendArg::new(msg("a"))).await.unwrap();
        bundle.send_to("t02", SendArg::new(msg("b"))).await.unwrap();

        // t02 departs, t03 joins.
        bundle.smap_changed(&smap_of(&["t00", "t01", "t03"])).await.unwrap();
        assert_eq!(bundle.num_streams().await, 2);
        assert!(bundle.send_to("t02", SendArg::new(msg("c"))).await.is_err());
        bundle.send_to("t03", SendArg::new(msg("d"))).await.unwrap();

        // Let the writer/reader tasks drain.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let got = received.lock().unwrap();
        assert_eq!(got.get("t01").unwrap(), &vec!["a".to_string()]);
        assert_eq!(got.get("t02").unwrap(), &vec!["b".to_string()]);
        assert_eq!(got.get("t03").unwrap(), &vec!["d".to_string()]);
    }
}
