use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::traits::{
    Acknowledger, Delivery, DeliverySource, DeliveryStream, PublishError, Publisher,
    SubscribeError,
};
use crate::config::BrokerConfig;

fn amqp_uri(config: &BrokerConfig) -> AMQPUri {
    AMQPUri {
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: config.username.clone(),
                password: config.password.clone(),
            },
            host: config.host.clone(),
            port: config.port,
        },
        vhost: config.virtual_host.clone(),
        ..Default::default()
    }
}

async fn open(config: &BrokerConfig) -> Result<(Connection, Channel), lapin::Error> {
    let connection =
        Connection::connect_uri(amqp_uri(config), ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    Ok((connection, channel))
}

struct Link {
    connection: Connection,
    channel: Channel,
}

impl Link {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(self) {
        if let Err(e) = self.channel.close(200, "relay shutting down").await {
            debug!("Closing AMQP channel: {e}");
        }
        if let Err(e) = self.connection.close(200, "relay shutting down").await {
            debug!("Closing AMQP connection: {e}");
        }
    }
}

/// Publishes inbound client payloads to a fanout exchange with an empty
/// routing key.
pub struct AmqpPublisher {
    config: BrokerConfig,
    link: Mutex<Option<Link>>,
}

impl AmqpPublisher {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            link: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Publisher for AmqpPublisher {
    async fn connect(&self) -> Result<(), PublishError> {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(Link::is_open) {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.close().await;
        }

        let unavailable = |e: lapin::Error| PublishError::Unavailable(e.to_string());
        let (connection, channel) = open(&self.config)
            .await
            .map_err(unavailable)?;
        channel
            .exchange_declare(
                &self.config.publish_exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(unavailable)?;

        info!(
            "Connected to AMQP broker {}:{} for publishing to {}",
            self.config.host, self.config.port, self.config.publish_exchange
        );
        *link = Some(Link {
            connection,
            channel,
        });
        Ok(())
    }

    async fn publish(&self, payload: Bytes) -> Result<(), PublishError> {
        let mut link = self.link.lock().await;
        let Some(open_link) = link.as_ref() else {
            return Err(PublishError::Unavailable("not connected".to_string()));
        };

        let result = open_link
            .channel
            .basic_publish(
                &self.config.publish_exchange,
                "",
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default(),
            )
            .await;

        match result {
            Ok(_confirm) => Ok(()),
            Err(e) => {
                // Force a fresh connection on the next connect()
                if let Some(stale) = link.take() {
                    stale.close().await;
                }
                Err(PublishError::Unavailable(e.to_string()))
            }
        }
    }

    async fn close(&self) {
        if let Some(link) = self.link.lock().await.take() {
            link.close().await;
        }
    }
}

/// Consumes a durable queue bound to a direct exchange, one unacknowledged
/// delivery at a time.
pub struct AmqpSource {
    config: BrokerConfig,
}

impl AmqpSource {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DeliverySource for AmqpSource {
    async fn connect(&self) -> Result<Box<dyn DeliveryStream>, SubscribeError> {
        let config = &self.config;
        let (connection, channel) = open(config)
            .await
            .map_err(|e| SubscribeError::Connection(e.to_string()))?;

        let link = Link {
            connection,
            channel,
        };
        match declare_and_consume(config, &link.channel).await {
            Ok(consumer) => {
                info!(
                    "Consuming {} bound to {} with key {}",
                    config.queue, config.subscribe_exchange, config.routing_key
                );
                Ok(Box::new(AmqpDeliveryStream {
                    link: Some(link),
                    consumer,
                }))
            }
            Err(e) => {
                link.close().await;
                Err(e)
            }
        }
    }
}

async fn declare_and_consume(
    config: &BrokerConfig,
    channel: &Channel,
) -> Result<Consumer, SubscribeError> {
    let declare = |e: lapin::Error| SubscribeError::Declare(e.to_string());

    channel
        .exchange_declare(
            &config.subscribe_exchange,
            ExchangeKind::Direct,
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(declare)?;
    channel
        .queue_declare(
            &config.queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(declare)?;
    channel
        .queue_bind(
            &config.queue,
            &config.subscribe_exchange,
            &config.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(declare)?;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .map_err(declare)?;

    let consumer_tag = format!("relayd-{}", Uuid::new_v4().simple());
    channel
        .basic_consume(
            &config.queue,
            &consumer_tag,
            BasicConsumeOptions {
                no_ack: false,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| SubscribeError::Connection(e.to_string()))
}

struct AmqpDeliveryStream {
    link: Option<Link>,
    consumer: Consumer,
}

#[async_trait]
impl DeliveryStream for AmqpDeliveryStream {
    async fn next_delivery(&mut self) -> Option<Result<Delivery, SubscribeError>> {
        let delivery = self.consumer.next().await?;
        Some(
            delivery
                .map(|delivery| {
                    Delivery::new(
                        Bytes::from(delivery.data),
                        Box::new(AmqpAcker {
                            acker: delivery.acker,
                        }),
                    )
                })
                .map_err(|e| SubscribeError::Connection(e.to_string())),
        )
    }

    async fn close(&mut self) {
        if let Some(link) = self.link.take() {
            if !link.is_open() {
                warn!("AMQP subscriber link already closed");
            }
            link.close().await;
        }
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(self: Box<Self>) -> Result<(), SubscribeError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| SubscribeError::Ack(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uri_from_config() {
        let config = BrokerConfig {
            host: "mq.example".to_string(),
            port: 5673,
            username: "relay".to_string(),
            password: "secret".to_string(),
            virtual_host: "/".to_string(),
            ..Default::default()
        };
        let uri = amqp_uri(&config);
        assert_eq!(uri.authority.host, "mq.example");
        assert_eq!(uri.authority.port, 5673);
        assert_eq!(uri.authority.userinfo.username, "relay");
        assert_eq!(uri.vhost, "/");
    }

    #[tokio::test]
    async fn test_publish_without_connection_is_unavailable() {
        let publisher = AmqpPublisher::new(BrokerConfig::default());
        assert!(matches!(
            publisher.publish(Bytes::from_static(b"x")).await,
            Err(PublishError::Unavailable(_))
        ));
    }
}
