use crate::analytics::{AnalyticsSink, AnalyticsStore, SinkConfig};
use crate::config::GatewayConfig;
use crate::events::EventBroker;
use crate::limiter::{Limiter, WindowStore};
use crate::metrics::Metrics;
use crate::rules::RuleSet;
use crate::upstream::Upstream;
use anyhow::Result;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Shared gateway state, cheaply cloneable (one clone per connection).
///
/// The rule set is the only hot-mutable piece: a single atomically-swapped
/// pointer, written by the admin surface, loaded once per request. Everything
/// else is built at startup and immutable.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub rules: Arc<ArcSwap<RuleSet>>,
    pub store: Arc<dyn WindowStore>,
    pub global_limiter: Arc<Limiter>,
    pub upstream: Arc<Upstream>,
    pub broker: Arc<EventBroker>,
    pub sink: Arc<AnalyticsSink>,
    pub metrics: Metrics,
}

impl GatewayState {
    /// Assemble the state from an already-constructed window store and
    /// analytics store, so backends stay selectable (redis/memory, postgres/
    /// test doubles) without this aggregate knowing which is which.
    pub fn new(
        config: GatewayConfig,
        store: Arc<dyn WindowStore>,
        analytics: Arc<dyn AnalyticsStore>,
    ) -> Result<Self> {
        let metrics = Metrics::install();

        let global_limiter = Arc::new(Limiter::new(
            store.clone(),
            config.limiter.limit,
            config.limiter.window,
        )?);

        let upstream = Arc::new(Upstream::new(
            &config.upstream,
            config.proxy.request_timeout,
        )?);

        let broker = Arc::new(EventBroker::new(config.broker.subscriber_capacity));

        let sink = Arc::new(AnalyticsSink::spawn(
            analytics,
            SinkConfig {
                buffer: config.analytics.buffer,
                batch_size: config.analytics.batch_size,
                flush_interval: config.analytics.flush_interval,
            },
        ));

        metrics::gauge!("gateway_config_rules_total").set(0.0);

        Ok(Self {
            config: Arc::new(config),
            rules: Arc::new(ArcSwap::new(Arc::new(RuleSet::default()))),
            store,
            global_limiter,
            upstream,
            broker,
            sink,
            metrics,
        })
    }

    /// Atomically replace the active rule set. In-flight requests keep the
    /// snapshot they loaded at entry; new requests see the new set.
    pub fn set_rule_set(&self, set: RuleSet) -> usize {
        let count = set.len();
        self.rules.store(Arc::new(set));

        metrics::gauge!("gateway_config_rules_total").set(count as f64);
        metrics::counter!("gateway_rule_swaps_total").increment(1);
        info!("rules: rule set swapped, count={}", count);
        count
    }

    pub fn rule_count(&self) -> usize {
        self.rules.load().len()
    }
}
