//! Downstream delivery of admitted events.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::DeliveryConfig;
use crate::error::Result;
use crate::event::Event;

/// Side effect performed for every admitted event (push, SMS, email, ...).
///
/// Implementations may block the calling partition loop; that is how slow
/// downstreams throttle consumption of their partition. A failed delivery is
/// retried through redelivery, so it must be safe to repeat.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn deliver(&self, event: &Event) -> Result<()>;
}

/// Deliverer that logs the notification after a fixed provider latency.
#[derive(Debug, Clone)]
pub struct LogDeliverer {
    latency: Duration,
}

impl LogDeliverer {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

impl From<&DeliveryConfig> for LogDeliverer {
    fn from(config: &DeliveryConfig) -> Self {
        Self::new(Duration::from_millis(config.simulated_latency_ms))
    }
}

#[async_trait]
impl Deliverer for LogDeliverer {
    async fn deliver(&self, event: &Event) -> Result<()> {
        info!(
            entity_id = %event.entity_id(),
            kind = %event.kind(),
            payload = %event.payload(),
            created_at = %event.created_at(),
            "Delivering notification"
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        info!(entity_id = %event.entity_id(), "Notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn test_log_deliverer_waits_for_latency() {
        let deliverer = LogDeliverer::new(Duration::from_millis(20));
        let event = Event::new("u1", "ORDER", "shipped").unwrap();

        let started = Instant::now();
        tokio_test::assert_ok!(deliverer.deliver(&event).await);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_from_config() {
        let deliverer = LogDeliverer::from(&DeliveryConfig::default());
        assert_eq!(deliverer.latency, Duration::from_millis(50));
    }
}
