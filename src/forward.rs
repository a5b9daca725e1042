use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use hickory_proto::op::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;
use tracing::debug;

use crate::middleware::Handler;

const MAX_UDP_RESPONSE: usize = 4096;

/// Terminal handler: relays the request to a single upstream resolver.
#[derive(Debug, Clone)]
pub struct UpstreamForwarder {
    upstream: SocketAddr,
    timeout: Duration,
}

impl UpstreamForwarder {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Self { upstream, timeout }
    }

    async fn exchange_udp(&self, packet: &[u8], id: u16) -> anyhow::Result<Vec<u8>> {
        let local: SocketAddr = if self.upstream.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await.context("bind upstream socket")?;
        socket
            .connect(self.upstream)
            .await
            .with_context(|| format!("connect upstream {}", self.upstream))?;
        socket.send(packet).await.context("send to upstream")?;

        let mut buf = vec![0u8; MAX_UDP_RESPONSE];
        let recv = async {
            loop {
                let len = socket.recv(&mut buf).await?;
                // Stray datagrams with the wrong id are dropped.
                if len >= 2 && u16::from_be_bytes([buf[0], buf[1]]) == id {
                    return Ok::<usize, std::io::Error>(len);
                }
            }
        };
        let len = timeout(self.timeout, recv)
            .await
            .with_context(|| format!("upstream {} timed out", self.upstream))?
            .context("recv from upstream")?;
        buf.truncate(len);
        Ok(buf)
    }

    async fn exchange_tcp(&self, packet: &[u8]) -> anyhow::Result<Vec<u8>> {
        let exchange = async {
            let mut stream = TcpStream::connect(self.upstream).await?;
            let len = u16::try_from(packet.len())
                .map_err(|_| std::io::Error::other("request too large for tcp framing"))?;
            stream.write_all(&len.to_be_bytes()).await?;
            stream.write_all(packet).await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let mut body = vec![0u8; u16::from_be_bytes(len_buf) as usize];
            stream.read_exact(&mut body).await?;
            Ok::<Vec<u8>, std::io::Error>(body)
        };
        timeout(self.timeout, exchange)
            .await
            .with_context(|| format!("upstream {} timed out (tcp)", self.upstream))?
            .with_context(|| format!("tcp exchange with {}", self.upstream))
    }
}

#[async_trait]
impl Handler for UpstreamForwarder {
    fn name(&self) -> &'static str {
        "forward"
    }

    async fn serve_dns(&self, _remote: &str, request: Message) -> anyhow::Result<Message> {
        let packet = request.to_vec().context("encode request")?;
        let reply = self.exchange_udp(&packet, request.id()).await?;
        let response = Message::from_vec(&reply).context("decode upstream response")?;
        if !response.truncated() {
            return Ok(response);
        }

        debug!(upstream = %self.upstream, id = request.id(), "truncated udp answer, retrying over tcp");
        let reply = self.exchange_tcp(&packet).await?;
        let response = Message::from_vec(&reply).context("decode upstream tcp response")?;
        if response.id() != request.id() {
            anyhow::bail!(
                "upstream {} answered id {} over tcp, expected {}",
                self.upstream,
                response.id(),
                request.id()
            );
        }
        Ok(response)
    }
}
