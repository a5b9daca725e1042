use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use tracing::warn;

use crate::middleware::Handler;

/// Glue between the listeners and the handler chain.
pub struct Engine<H> {
    chain: Arc<H>,
    pub metrics_total_requests: Arc<AtomicU64>,
    pub metrics_chain_failures: Arc<AtomicU64>,
}

impl<H> Clone for Engine<H> {
    fn clone(&self) -> Self {
        Self {
            chain: Arc::clone(&self.chain),
            metrics_total_requests: Arc::clone(&self.metrics_total_requests),
            metrics_chain_failures: Arc::clone(&self.metrics_chain_failures),
        }
    }
}

impl<H: Handler> Engine<H> {
    pub fn new(chain: H) -> Self {
        Self {
            chain: Arc::new(chain),
            metrics_total_requests: Arc::new(AtomicU64::new(0)),
            metrics_chain_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Decode, run the chain, encode. A failing chain yields SERVFAIL for the
    /// original questions; an undecodable packet is an error for the caller to drop.
    pub async fn handle_packet(&self, packet: &[u8], peer: SocketAddr) -> anyhow::Result<Bytes> {
        let request = Message::from_vec(packet).context("decode request")?;
        self.metrics_total_requests.fetch_add(1, Ordering::Relaxed);

        let original = request.clone();
        let response = match self.chain.serve_dns(&peer.to_string(), request).await {
            Ok(resp) => resp,
            Err(err) => {
                self.metrics_chain_failures.fetch_add(1, Ordering::Relaxed);
                let detail = format!("{err:#}");
                warn!(
                    client = %peer,
                    handler = self.chain.name(),
                    error = %detail,
                    "handler chain failed, answering SERVFAIL"
                );
                build_response(&original, ResponseCode::ServFail)
            }
        };

        let out = response.to_vec().context("encode response")?;
        Ok(Bytes::from(out))
    }

    pub fn metrics_snapshot(&self) -> String {
        format!(
            "total={} chain_failures={}",
            self.metrics_total_requests.load(Ordering::Relaxed),
            self.metrics_chain_failures.load(Ordering::Relaxed)
        )
    }
}

fn build_response(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    msg.add_queries(req.queries().iter().cloned());
    msg
}
