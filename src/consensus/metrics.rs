use prometheus::{Gauge, IntCounter, IntGauge, Registry};

/// Metrics the consensus component exposes.
#[derive(Debug)]
pub struct ConsensusMetrics {
    /// Gauge to track time between proposal and finalization.
    pub finalization_time: Gauge,
    /// Amount of finalized blocks.
    pub finalized_block_count: IntCounter,
    /// The era the supervisor currently operates in.
    pub current_era: IntGauge,
    /// Registry component.
    registry: Registry,
}

impl ConsensusMetrics {
    /// Creates and registers the metrics.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let finalization_time = Gauge::new(
            "finalization_time",
            "the amount of time, in milliseconds, between proposal and finalization of a block",
        )?;
        let finalized_block_count =
            IntCounter::new("amount_of_blocks", "the number of blocks finalized so far")?;
        let current_era = IntGauge::new("current_era", "the era the node is currently in")?;
        registry.register(Box::new(finalization_time.clone()))?;
        registry.register(Box::new(finalized_block_count.clone()))?;
        registry.register(Box::new(current_era.clone()))?;
        Ok(ConsensusMetrics {
            finalization_time,
            finalized_block_count,
            current_era,
            registry: registry.clone(),
        })
    }
}

impl Drop for ConsensusMetrics {
    fn drop(&mut self) {
        self.registry
            .unregister(Box::new(self.finalization_time.clone()))
            .expect("did not expect deregistering finalization_time to fail");
        self.registry
            .unregister(Box::new(self.finalized_block_count.clone()))
            .expect("did not expect deregistering amount_of_blocks to fail");
        self.registry
            .unregister(Box::new(self.current_era.clone()))
            .expect("did not expect deregistering current_era to fail");
    }
}
