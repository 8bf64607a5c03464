//! Prometheus metrics for the engine.

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ChainLabels {
    pub chain_id: u64,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RpcLabels {
    pub chain_id: u64,
    pub method: String,
}

pub struct Metrics {
    registry: Registry,
    pub events_indexed: Counter,
    pub handler_errors: Counter,
    pub rpc_requests: Family<RpcLabels, Counter>,
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub reorgs: Family<ChainLabels, Counter>,
    /// Highest synced block per chain.
    pub sync_block: Family<ChainLabels, Gauge>,
    /// Timestamp component of the committed indexing checkpoint.
    pub checkpoint_timestamp: Gauge,
    /// Realtime head minus the last released event block, per chain.
    pub sync_lag: Family<ChainLabels, Gauge>,
    /// Events held in the merger buffer, the engine's main memory sink.
    pub buffered_events: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_indexed = Counter::default();
        registry.register(
            "ponder_events_indexed",
            "Events delivered to user handlers",
            events_indexed.clone(),
        );

        let handler_errors = Counter::default();
        registry.register(
            "ponder_handler_errors",
            "User handler invocations that returned an error",
            handler_errors.clone(),
        );

        let rpc_requests = Family::<RpcLabels, Counter>::default();
        registry.register(
            "ponder_rpc_requests",
            "JSON-RPC requests issued, by chain and method",
            rpc_requests.clone(),
        );

        let cache_hits = Counter::default();
        registry.register(
            "ponder_sync_cache_hits",
            "Windows served from the sync cache",
            cache_hits.clone(),
        );

        let cache_misses = Counter::default();
        registry.register(
            "ponder_sync_cache_misses",
            "Windows fetched over RPC",
            cache_misses.clone(),
        );

        let reorgs = Family::<ChainLabels, Counter>::default();
        registry.register(
            "ponder_reorgs",
            "Reorganizations reconciled, by chain",
            reorgs.clone(),
        );

        let sync_block = Family::<ChainLabels, Gauge>::default();
        registry.register(
            "ponder_sync_block",
            "Highest synced block number, by chain",
            sync_block.clone(),
        );

        let checkpoint_timestamp = Gauge::default();
        registry.register(
            "ponder_checkpoint_timestamp",
            "Block timestamp of the committed indexing checkpoint",
            checkpoint_timestamp.clone(),
        );

        let sync_lag = Family::<ChainLabels, Gauge>::default();
        registry.register(
            "ponder_sync_lag",
            "Blocks between the chain head and the last released event",
            sync_lag.clone(),
        );

        let buffered_events = Gauge::default();
        registry.register(
            "ponder_buffered_events",
            "Events buffered in the merger awaiting release",
            buffered_events.clone(),
        );

        Metrics {
            registry,
            events_indexed,
            handler_errors,
            rpc_requests,
            cache_hits,
            cache_misses,
            reorgs,
            sync_block,
            checkpoint_timestamp,
            sync_lag,
            buffered_events,
        }
    }

    /// Prometheus text exposition for the `/metrics` endpoint.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.registry).expect("metrics encoding into a String cannot fail");
        buffer
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_series() {
        let metrics = Metrics::new();
        metrics.events_indexed.inc();
        metrics
            .sync_block
            .get_or_create(&ChainLabels { chain_id: 1 })
            .set(1234);
        let text = metrics.encode();
        assert!(text.contains("ponder_events_indexed_total 1"));
        assert!(text.contains("ponder_sync_block"));
        assert!(text.contains("chain_id=\"1\""));
        assert!(text.ends_with("# EOF\n"));
    }
}
