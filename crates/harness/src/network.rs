use std::sync::Arc;

use w3sync_core::MappingDocument;
use w3sync_engine::{EngineError, InboundOutcome};

use crate::TestPlatform;
use crate::vault::FakeVault;

/// Several platforms sharing one vault. Webhooks are delivered by hand so a
/// test decides when remote changes arrive.
pub struct TestNetwork {
    vault: Arc<FakeVault>,
    platforms: Vec<TestPlatform>,
}

/// What one platform did with one webhook.
#[derive(Debug)]
pub struct Delivery {
    pub platform: String,
    pub origin: String,
    pub result: Result<InboundOutcome, EngineError>,
}

impl Default for TestNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl TestNetwork {
    pub fn new() -> Self {
        Self {
            vault: FakeVault::new(),
            platforms: Vec::new(),
        }
    }

    pub fn vault(&self) -> &Arc<FakeVault> {
        &self.vault
    }

    pub fn add_platform(
        &mut self,
        name: &str,
        documents: Vec<MappingDocument>,
    ) -> Result<usize, Box<dyn std::error::Error>> {
        let platform = TestPlatform::new(name, &self.vault, documents)?;
        Ok(self.push(platform))
    }

    pub fn push(&mut self, platform: TestPlatform) -> usize {
        let index = self.platforms.len();
        self.platforms.push(platform);
        index
    }

    pub fn platform(&self, index: usize) -> &TestPlatform {
        &self.platforms[index]
    }

    /// Sends every pending webhook to every platform that maps its schema,
    /// the writer included, as a vault subscription would.
    pub async fn deliver(&self) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for event in self.vault.take_webhooks() {
            for platform in &self.platforms {
                if platform
                    .engine
                    .registry()
                    .by_schema(&event.payload.schema_id)
                    .is_none()
                {
                    continue;
                }
                let result = platform.apply(event.payload.clone()).await;
                deliveries.push(Delivery {
                    platform: platform.name.clone(),
                    origin: event.origin.clone(),
                    result,
                });
            }
        }
        deliveries
    }

    /// Flushes every platform and delivers webhooks until nothing moves.
    /// Gives up after `max_rounds`, which a ping-pong between platforms
    /// would hit.
    pub async fn settle(&self, max_rounds: usize) -> Vec<Delivery> {
        let mut all = Vec::new();
        for _ in 0..max_rounds {
            for platform in &self.platforms {
                platform.settle().await;
            }
            let round = self.deliver().await;
            if round.is_empty() {
                break;
            }
            all.extend(round);
        }
        all
    }
}
