pub mod amqp;
pub mod memory;
pub mod publisher;
pub mod subscriber;
pub mod traits;

pub use amqp::{AmqpPublisher, AmqpSource};
pub use memory::MemoryBroker;
pub use publisher::BrokerPublisher;
pub use subscriber::{BrokerSubscriber, SubscriberOptions, SubscriberState};
pub use traits::*;

use crate::config::{BrokerBackend, BrokerConfig};
use std::sync::Arc;

/// Create the publishing and consuming backends selected by configuration
pub fn new(config: &BrokerConfig) -> (Arc<dyn Publisher>, Arc<dyn DeliverySource>) {
    match config.backend {
        BrokerBackend::Amqp => (
            Arc::new(AmqpPublisher::new(config.clone())),
            Arc::new(AmqpSource::new(config.clone())),
        ),
        BrokerBackend::Memory => MemoryBroker::new().backends(),
    }
}
