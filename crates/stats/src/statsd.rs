use crate::{Kind, Registry};
use tokio::net::UdpSocket;

/// Fire-and-forget StatsD line push over UDP. Send failures are logged
/// and otherwise ignored; metrics delivery is best-effort.
pub struct StatsdSink {
    socket: UdpSocket,
    prefix: String,
}

impl StatsdSink {
    pub async fn connect(addr: &str, prefix: &str) -> std::io::Result<StatsdSink> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(addr).await?;
        Ok(StatsdSink {
            socket,
            prefix: prefix.to_string(),
        })
    }

    pub async fn push(&self, registry: &Registry) {
        let mut buf = String::with_capacity(512);
        for (name, kind, value, count) in registry.iter_for_push() {
            buf.clear();
            match kind {
                Kind::Counter => {
                    buf.push_str(&format!("{}.{}:{}|c", self.prefix, name, value));
                }
                Kind::Gauge => {
                    buf.push_str(&format!("{}.{}:{}|g", self.prefix, name, value));
                }
                Kind::Latency => {
                    if count == 0 {
                        continue;
                    }
                    // StatsD timers are milliseconds.
                    let mean_ms = value / count / 1_000_000;
                    buf.push_str(&format!("{}.{}:{}|ms", self.prefix, name, mean_ms));
                }
            }
            if let Err(err) = self.socket.send(buf.as_bytes()).await {
                tracing::debug!(%err, "statsd push failed");
                return;
            }
        }
    }
}
