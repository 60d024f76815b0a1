//! Receives the single upstream RTP feed and hands each packet to the
//! multiplexer for fan-out to every connected peer.

use crate::multiplexer::StreamMultiplexer;
use log::{debug, info, warn};
use rtp::Header as RtpHeader;
use shared::buffer_pool::BufferPool;
use shared::error::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// The relay's single upstream receive point. One ingress feeds every
/// registered peer through a `StreamMultiplexer`; there is exactly one of
/// these per relay process.
pub struct UdpIngress {
    socket: UdpSocket,
    pool: BufferPool,
    stopped: Notify,
}

impl UdpIngress {
    pub async fn bind(bind_addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await?;
        info!("udp ingress bound to {bind_addr}");
        Ok(UdpIngress {
            socket,
            pool: BufferPool::new(),
            stopped: Notify::new(),
        })
    }

    /// Run the receive loop until `stop()` is called or the socket errors.
    /// Each datagram is validated as a well-formed RTP header (fail-soft:
    /// logged and dropped, never fatal to the loop) and forwarded verbatim
    /// to `multiplexer.send_video`; per-peer SSRC/sequence rewriting happens
    /// downstream in each peer's own sender task.
    pub async fn run(&self, multiplexer: Arc<StreamMultiplexer>) {
        loop {
            let mut buf = self.pool.rent();
            let recv = tokio::select! {
                _ = self.stopped.notified() => {
                    info!("udp ingress stopping");
                    return;
                }
                r = self.socket.recv_from(buf.as_mut_slice()) => r,
            };
            let (len, from) = match recv {
                Ok(v) => v,
                Err(e) => {
                    warn!("udp ingress: socket error, stopping: {e}");
                    return;
                }
            };
            buf.set_len(len);

            if let Err(e) = RtpHeader::unmarshal(buf.as_slice()) {
                debug!("udp ingress: dropping malformed datagram from {from}: {e}");
                continue;
            }
            multiplexer.send_video(Arc::from(buf.as_slice()));
        }
    }

    /// Signal `run` to return after its current iteration.
    pub fn stop(&self) {
        self.stopped.notify_waiters();
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod ingress_test {
    use super::*;

    #[tokio::test]
    async fn forwards_well_formed_rtp_and_drops_garbage() {
        let ingress = UdpIngress::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = ingress.local_addr().unwrap();
        let mux = Arc::new(StreamMultiplexer::new());

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut rtp = vec![0x80u8, 96, 0, 1, 0, 0, 0, 1, 0, 0, 0, 2];
        rtp.extend_from_slice(b"payload");
        sender.send_to(&rtp, addr).await.unwrap();
        sender.send_to(b"not rtp", addr).await.unwrap();

        let run_mux = mux.clone();
        let handle = tokio::spawn(async move { ingress.run(run_mux).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(mux.packets_forwarded(), 1);
        handle.abort();
    }
}
