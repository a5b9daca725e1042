use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use hickory_proto::op::Message;
use tracing::{debug, trace};

use crate::config::AffinityConfig;
use crate::error::ConfigError;
use crate::resolver::resolve_zone;
use crate::rewriter::{AlbNameMatcher, rewrite_queries};
use crate::table::AffinityTable;

/// One link in the request chain.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &'static str;

    /// `remote` is the client's transport address as text, port included when known.
    async fn serve_dns(&self, remote: &str, request: Message) -> anyhow::Result<Message>;
}

/// Compiled, read-only affinity state. Reconfiguration builds a new one.
#[derive(Debug, Clone)]
pub struct RuntimeAffinity {
    pub table: AffinityTable,
    pub matcher: AlbNameMatcher,
}

impl RuntimeAffinity {
    pub fn new(table: AffinityTable, matcher: AlbNameMatcher) -> Self {
        Self { table, matcher }
    }

    pub fn from_config(cfg: &AffinityConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(cfg.build_table()?, cfg.build_matcher()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AffinityOutcome {
    /// A zone was found; `rewritten` questions carry it (possibly zero).
    Tagged { zone: String, rewritten: usize },
    /// No usable client address or no containing subnet. Nothing changed.
    NoZone,
}

/// Tags internal ALB questions with the client's availability zone, then
/// always hands the request to `next`.
pub struct AzAffinity<N> {
    runtime: Arc<ArcSwap<RuntimeAffinity>>,
    next: N,
}

impl<N: Handler> AzAffinity<N> {
    pub fn new(runtime: Arc<ArcSwap<RuntimeAffinity>>, next: N) -> Self {
        Self { runtime, next }
    }

    /// Resolve the zone for `remote` and rewrite eligible questions in place.
    pub fn annotate(&self, remote: &str, request: &mut Message) -> AffinityOutcome {
        let runtime = self.runtime.load();
        let zone = match resolve_zone(&runtime.table, remote) {
            Ok(zone) => zone,
            Err(err) => {
                trace!(client = %remote, error = %err, "no affinity hint");
                return AffinityOutcome::NoZone;
            }
        };

        let mut queries = request.take_queries();
        let rewritten = rewrite_queries(&runtime.matcher, zone, &mut queries);
        request.add_queries(queries);

        if rewritten > 0 {
            debug!(client = %remote, zone = %zone, rewritten, "zone hint applied");
        }
        AffinityOutcome::Tagged {
            zone: zone.to_string(),
            rewritten,
        }
    }
}

#[async_trait]
impl<N: Handler> Handler for AzAffinity<N> {
    fn name(&self) -> &'static str {
        "azaffinity"
    }

    async fn serve_dns(&self, remote: &str, mut request: Message) -> anyhow::Result<Message> {
        self.annotate(remote, &mut request);
        self.next.serve_dns(remote, request).await
    }
}
