use std::net::SocketAddr;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Transport;
use crate::proto_utils::response_rcode;

const UDP_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const MAX_UDP_RESPONSE: usize = 4096;

/// Relays queries that no rule answered locally.
#[derive(Debug, Clone, Default)]
pub struct Forwarder;

impl Forwarder {
    pub fn new() -> Self {
        Self
    }

    /// Exchange `packet` with `upstream`. `timeout_dur` bounds the whole
    /// exchange, retries and fallbacks included.
    pub async fn forward(
        &self,
        packet: &[u8],
        upstream: SocketAddr,
        transport: Transport,
        timeout_dur: Duration,
    ) -> anyhow::Result<Bytes> {
        let start = Instant::now();
        let res = match transport {
            Transport::Udp => self.forward_udp_smart(packet, upstream, timeout_dur).await,
            Transport::Tcp => send_tcp(packet, upstream, timeout_dur).await,
        };
        match &res {
            Ok(bytes) => debug!(
                event = "upstream_response",
                upstream = %upstream,
                rcode = ?response_rcode(bytes),
                upstream_ns = start.elapsed().as_nanos() as u64,
                "upstream call latency"
            ),
            Err(err) => warn!(
                event = "upstream_error",
                upstream = %upstream,
                error = %err,
                elapsed_ns = start.elapsed().as_nanos() as u64,
                "upstream call failed"
            ),
        }
        res
    }

    /// UDP with one hedged retry, then TCP before giving up.
    ///
    /// The first attempt gets half the budget and the retry a quarter; TCP
    /// gets whatever is left, so the total never exceeds `timeout_dur`.
    async fn forward_udp_smart(
        &self,
        packet: &[u8],
        addr: SocketAddr,
        timeout_dur: Duration,
    ) -> anyhow::Result<Bytes> {
        let deadline = Instant::now() + timeout_dur;
        let attempts = [timeout_dur / 2, timeout_dur / 4];

        for (idx, dur) in attempts.iter().enumerate() {
            let dur = (*dur).min(remaining(deadline));
            match send_udp(packet, addr, dur).await {
                // truncated answers are retried over TCP
                Ok(bytes) if is_truncated(&bytes) => {
                    debug!(event = "udp_forward_truncated", upstream = %addr, "retrying over tcp");
                    return send_tcp(packet, addr, remaining(deadline)).await;
                }
                Ok(bytes) => return Ok(bytes),
                Err(err) => {
                    debug!(
                        event = "udp_forward_retry",
                        upstream = %addr,
                        attempt = idx + 1,
                        timeout_ms = dur.as_millis() as u64,
                        error = %err,
                        "udp forward attempt failed",
                    );
                }
            }
        }
        debug!(event = "udp_forward_fallback_tcp", upstream = %addr, "falling back to tcp");
        send_tcp(packet, addr, remaining(deadline)).await
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn is_truncated(packet: &[u8]) -> bool {
    packet.len() > 2 && packet[2] & 0x02 != 0
}

async fn send_udp(packet: &[u8], addr: SocketAddr, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    if packet.len() < 2 {
        anyhow::bail!("dns packet too short");
    }
    let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    if let Err(e) = socket.set_recv_buffer_size(UDP_BUFFER_BYTES) {
        warn!("failed to set udp recv buffer size: {}", e);
    }
    let local: SocketAddr = if addr.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    socket.bind(&local.into()).context("bind")?;
    socket.set_nonblocking(true).context("set nonblocking")?;
    let sock = UdpSocket::from_std(socket.into()).context("from_std")?;

    sock.connect(addr).await?;
    sock.send(packet).await?;

    let mut buf = [0u8; MAX_UDP_RESPONSE];
    let recv_res = timeout(timeout_dur, async {
        loop {
            let size = sock.recv(&mut buf).await?;
            // the socket is connected and fresh; skip anything with a foreign id
            if size >= 2 && buf[..2] == packet[..2] {
                return Ok::<_, anyhow::Error>(Bytes::copy_from_slice(&buf[..size]));
            }
        }
    })
    .await;

    match recv_res {
        Ok(res) => res,
        Err(_) => anyhow::bail!("udp timeout"),
    }
}

async fn send_tcp(packet: &[u8], addr: SocketAddr, timeout_dur: Duration) -> anyhow::Result<Bytes> {
    let len = u16::try_from(packet.len()).context("dns packet too large for tcp")?;
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.context("tcp connect")?;
        let mut out = Vec::with_capacity(2 + packet.len());
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(packet);
        stream.write_all(&out).await?;

        let mut len_buf = [0u8; 2];
        stream.read_exact(&mut len_buf).await?;
        let resp_len = u16::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; resp_len];
        stream.read_exact(&mut buf).await?;
        Ok::<_, anyhow::Error>(Bytes::from(buf))
    };
    match timeout(timeout_dur, exchange).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("tcp timeout"),
    }
}
