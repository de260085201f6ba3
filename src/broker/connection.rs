/// AMQP connection lifecycle.
///
/// `BrokerConnection` owns one connection and one channel. Connecting runs
/// under the retry policy and (re)declares the topology every time, so a
/// broker restart that lost non-durable state is repaired on reconnect.
///
/// Consuming is blocking and strictly one message at a time: the handler
/// runs to completion and its disposition is applied before the next
/// delivery is taken. The shutdown flag is polled between deliveries.

use amiquip::{
    AmqpProperties, AmqpValue, Channel, Connection, ConsumerMessage, ConsumerOptions,
    ExchangeDeclareOptions, ExchangeType, FieldTable, Publish, QueueDeclareOptions,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::{BrokerError, ConsumeEnd, Disposition, Publisher, QueueTopology, Topology};
use crate::config::BrokerSettings;
use crate::retry::{RetryPolicy, Sleeper, ThreadSleeper};

/// How long a consumer waits for a delivery before re-checking shutdown.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Handler applied to each delivery body.
pub type DeliveryHandler<'a> = dyn FnMut(&[u8]) -> Disposition + 'a;

/// The connection operations the consume loop drives.
pub trait ConsumerSession {
    /// Connects (with retries) and declares the topology.
    fn connect(&mut self) -> Result<(), BrokerError>;

    /// Closes whatever is open. Idempotent.
    fn close(&mut self);

    /// Runs one consume session until it ends for any reason.
    fn consume(&mut self, shutdown: &AtomicBool, handler: &mut DeliveryHandler<'_>) -> Result<ConsumeEnd, BrokerError>;
}

/// What to do once a consume session has ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    Stop,
    Reconnect(String),
}

/// Maps the end of a consume session to the next step. Only a lost
/// connection is recoverable; a channel close or a broker-side cancel is
/// returned as an error so the process exits non-zero.
pub fn next_step(end: ConsumeEnd) -> Result<NextStep, BrokerError> {
    match end {
        ConsumeEnd::Shutdown => {
            info!("Stopping consumer: shutdown requested");
            Ok(NextStep::Stop)
        }
        ConsumeEnd::Cancelled => {
            error!("Consumer cancelled by broker");
            Err(BrokerError::ConsumerCancelled)
        }
        ConsumeEnd::ChannelClosed(reason) => {
            error!("Channel error: {}", reason);
            Err(BrokerError::ChannelClosed(reason))
        }
        ConsumeEnd::ConnectionLost(reason) => Ok(NextStep::Reconnect(reason)),
    }
}

/// Consumes until shutdown. A lost connection is closed, followed by one
/// policy delay, then a full reconnect and resubscribe. Exhausting the
/// reconnect policy is fatal.
pub fn consume_until_stopped<S>(
    session: &mut S,
    retry: &RetryPolicy,
    sleeper: &dyn Sleeper,
    shutdown: &AtomicBool,
    handler: &mut DeliveryHandler<'_>,
) -> Result<(), BrokerError>
where
    S: ConsumerSession + ?Sized,
{
    loop {
        match next_step(session.consume(shutdown, handler)?)? {
            NextStep::Stop => return Ok(()),
            NextStep::Reconnect(reason) => {
                warn!("Connection was closed ({}), reconnecting...", reason);
                session.close();
                sleeper.sleep(retry.delay_after(1));
                session.connect()?;
            }
        }
    }
}

struct Session {
    connection: Connection,
    channel: Channel,
}

pub struct BrokerConnection {
    url: String,
    target: String,
    topology: Topology,
    prefetch: u16,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    session: Option<Session>,
}

impl BrokerConnection {
    /// Creates an unconnected handle. Call `connect` before use.
    pub fn new(settings: &BrokerSettings, topology: Topology, retry: RetryPolicy) -> Self {
        Self {
            url: settings.amqp_url(),
            target: settings.display_target(),
            topology,
            prefetch: settings.prefetch,
            retry,
            sleeper: Arc::new(ThreadSleeper),
            session: None,
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Connects and declares the topology, retrying per policy. Exhausting
    /// the policy is fatal for the caller.
    pub fn connect(&mut self) -> Result<(), BrokerError> {
        self.close();
        let session = self.retry.run("RabbitMQ connection", self.sleeper.as_ref(), |_| {
            open_session(&self.url, &self.topology, self.prefetch)
        })?;
        info!(target = %self.target, exchange = %self.topology.exchange, "Connected to RabbitMQ");
        self.session = Some(session);
        Ok(())
    }

    /// Closes the channel and connection if open. Idempotent.
    pub fn close(&mut self) {
        if let Some(session) = self.session.take() {
            // closing the connection also closes the channel
            let _ = session.channel.close();
            match session.connection.close() {
                Ok(()) => info!("RabbitMQ connection closed"),
                Err(e) => warn!("Error closing RabbitMQ connection: {}", e),
            }
        }
    }

    /// Runs one consume session until shutdown, cancellation or failure.
    pub fn consume(&mut self, shutdown: &AtomicBool, handler: &mut DeliveryHandler<'_>) -> Result<ConsumeEnd, BrokerError> {
        let queue = self.topology.queue.as_ref().ok_or(BrokerError::NoQueue)?;
        let session = self.session.as_ref().ok_or(BrokerError::NotConnected)?;

        let consumer = match session.channel.basic_consume(queue.name.as_str(), ConsumerOptions::default()) {
            Ok(consumer) => consumer,
            Err(e) => return Ok(ConsumeEnd::ConnectionLost(e.to_string())),
        };
        info!(queue = %queue.name, "Started consuming");

        let end = loop {
            if shutdown.load(Ordering::SeqCst) {
                break ConsumeEnd::Shutdown;
            }

            let message = match consumer.receiver().recv_timeout(POLL_INTERVAL) {
                Ok(message) => message,
                Err(e) if e.is_timeout() => continue,
                Err(_) => break ConsumeEnd::ConnectionLost("consumer stream disconnected".to_string()),
            };

            match message {
                ConsumerMessage::Delivery(delivery) => {
                    let settled = match handler(&delivery.body) {
                        Disposition::Ack => consumer.ack(delivery),
                        Disposition::Requeue => consumer.nack(delivery, true),
                    };
                    if let Err(e) = settled {
                        break ConsumeEnd::ConnectionLost(e.to_string());
                    }
                }
                ConsumerMessage::ServerClosedChannel(e) => break ConsumeEnd::ChannelClosed(e.to_string()),
                ConsumerMessage::ServerClosedConnection(e) => break ConsumeEnd::ConnectionLost(e.to_string()),
                _ => break ConsumeEnd::Cancelled,
            }
        };

        if end == ConsumeEnd::Shutdown {
            if let Err(e) = consumer.cancel() {
                warn!("Failed to cancel consumer: {}", e);
            }
        }
        Ok(end)
    }

    /// Consumes until shutdown; see `consume_until_stopped`.
    pub fn run_consumer<F>(&mut self, shutdown: &AtomicBool, mut handler: F) -> Result<(), BrokerError>
    where
        F: FnMut(&[u8]) -> Disposition,
    {
        let retry = self.retry;
        let sleeper = Arc::clone(&self.sleeper);
        consume_until_stopped(self, &retry, sleeper.as_ref(), shutdown, &mut handler)
    }
}

impl ConsumerSession for BrokerConnection {
    fn connect(&mut self) -> Result<(), BrokerError> {
        BrokerConnection::connect(self)
    }

    fn close(&mut self) {
        BrokerConnection::close(self)
    }

    fn consume(&mut self, shutdown: &AtomicBool, handler: &mut DeliveryHandler<'_>) -> Result<ConsumeEnd, BrokerError> {
        BrokerConnection::consume(self, shutdown, handler)
    }
}

impl Publisher for BrokerConnection {
    fn publish(&mut self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let session = self.session.as_ref().ok_or(BrokerError::NotConnected)?;
        let properties = AmqpProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into());
        session.channel.basic_publish(
            self.topology.exchange.as_str(),
            Publish::with_properties(payload, routing_key, properties),
        )?;
        Ok(())
    }

    fn reconnect(&mut self) -> Result<(), BrokerError> {
        self.close();
        let session = open_session(&self.url, &self.topology, self.prefetch)?;
        info!(target = %self.target, "Reconnected to RabbitMQ");
        self.session = Some(session);
        Ok(())
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        self.close();
    }
}

// ---------------------------------------------------------------------------
// Topology declaration
// ---------------------------------------------------------------------------

fn open_session(url: &str, topology: &Topology, prefetch: u16) -> Result<Session, BrokerError> {
    let mut connection = Connection::insecure_open(url)?;
    let channel = connection.open_channel(None)?;
    declare_topology(&channel, topology, prefetch)?;
    Ok(Session { connection, channel })
}

fn durable_exchange() -> ExchangeDeclareOptions {
    ExchangeDeclareOptions {
        durable: true,
        ..ExchangeDeclareOptions::default()
    }
}

/// Per-message TTL plus dead-lettering to `<exchange>.dlx` with the
/// `<routing_key>.dead` key.
fn queue_arguments(topology: &Topology, queue: &QueueTopology) -> FieldTable {
    let mut arguments = FieldTable::default();
    arguments.insert(
        "x-message-ttl".into(),
        AmqpValue::LongLongInt(i64::from(queue.message_ttl_ms)),
    );
    arguments.insert(
        "x-dead-letter-exchange".into(),
        AmqpValue::LongString(topology.dead_letter_exchange()),
    );
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AmqpValue::LongString(queue.dead_letter_routing_key()),
    );
    arguments
}

fn declare_topology(channel: &Channel, topology: &Topology, prefetch: u16) -> Result<(), BrokerError> {
    let exchange = channel.exchange_declare(ExchangeType::Topic, topology.exchange.as_str(), durable_exchange())?;

    let Some(queue) = &topology.queue else {
        return Ok(());
    };

    let primary = channel.queue_declare(
        queue.name.as_str(),
        QueueDeclareOptions {
            durable: true,
            arguments: queue_arguments(topology, queue),
            ..QueueDeclareOptions::default()
        },
    )?;

    let dead_exchange = channel.exchange_declare(ExchangeType::Topic, topology.dead_letter_exchange(), durable_exchange())?;
    let dead_queue = channel.queue_declare(
        queue.dead_letter_queue(),
        QueueDeclareOptions {
            durable: true,
            ..QueueDeclareOptions::default()
        },
    )?;

    primary.bind(&exchange, queue.routing_key.as_str(), FieldTable::default())?;
    dead_queue.bind(&dead_exchange, queue.dead_letter_routing_key(), FieldTable::default())?;

    // fair dispatch: one unacknowledged message per consumer
    channel.qos(0, prefetch, false)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RecordingSleeper;
    use std::collections::VecDeque;

    /// Plays back a fixed sequence of session endings, delivering one
    /// message per consume call.
    #[derive(Default)]
    struct ScriptedSession {
        ends: VecDeque<ConsumeEnd>,
        connect_failures: VecDeque<BrokerError>,
        calls: Vec<&'static str>,
    }

    impl ScriptedSession {
        fn ending_with(ends: Vec<ConsumeEnd>) -> Self {
            Self { ends: ends.into(), ..Self::default() }
        }
    }

    impl ConsumerSession for ScriptedSession {
        fn connect(&mut self) -> Result<(), BrokerError> {
            self.calls.push("connect");
            match self.connect_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn close(&mut self) {
            self.calls.push("close");
        }

        fn consume(&mut self, _: &AtomicBool, handler: &mut DeliveryHandler<'_>) -> Result<ConsumeEnd, BrokerError> {
            self.calls.push("consume");
            handler(&b"{}"[..]);
            Ok(self.ends.pop_front().unwrap_or(ConsumeEnd::Shutdown))
        }
    }

    fn run(session: &mut ScriptedSession, sleeper: &RecordingSleeper) -> (Result<(), BrokerError>, usize) {
        let retry = RetryPolicy::fixed(10, Duration::from_secs(5));
        let shutdown = AtomicBool::new(false);
        let mut handled = 0;
        let result = consume_until_stopped(session, &retry, sleeper, &shutdown, &mut |_: &[u8]| {
            handled += 1;
            Disposition::Ack
        });
        (result, handled)
    }

    #[test]
    fn test_next_step_for_each_session_end() {
        assert_eq!(next_step(ConsumeEnd::Shutdown).unwrap(), NextStep::Stop);
        assert_eq!(
            next_step(ConsumeEnd::ConnectionLost("reset".into())).unwrap(),
            NextStep::Reconnect("reset".into())
        );
        assert!(matches!(
            next_step(ConsumeEnd::ChannelClosed("NOT_FOUND".into())),
            Err(BrokerError::ChannelClosed(reason)) if reason == "NOT_FOUND"
        ));
        assert!(matches!(next_step(ConsumeEnd::Cancelled), Err(BrokerError::ConsumerCancelled)));
    }

    #[test]
    fn test_connection_loss_closes_waits_then_resubscribes() {
        let sleeper = RecordingSleeper::default();
        let mut session = ScriptedSession::ending_with(vec![
            ConsumeEnd::ConnectionLost("connection reset".into()),
            ConsumeEnd::Shutdown,
        ]);

        let (result, handled) = run(&mut session, &sleeper);

        assert!(result.is_ok());
        assert_eq!(session.calls, vec!["consume", "close", "connect", "consume"]);
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(5)]);
        // the same handler keeps running after the reconnect
        assert_eq!(handled, 2);
    }

    #[test]
    fn test_channel_close_is_fatal_and_not_retried() {
        let sleeper = RecordingSleeper::default();
        let mut session = ScriptedSession::ending_with(vec![ConsumeEnd::ChannelClosed("PRECONDITION_FAILED".into())]);

        let (result, _) = run(&mut session, &sleeper);

        assert!(matches!(result, Err(BrokerError::ChannelClosed(_))));
        assert_eq!(session.calls, vec!["consume"]);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_broker_cancel_ends_with_error() {
        let sleeper = RecordingSleeper::default();
        let mut session = ScriptedSession::ending_with(vec![ConsumeEnd::Cancelled]);

        let (result, _) = run(&mut session, &sleeper);

        assert!(matches!(result, Err(BrokerError::ConsumerCancelled)));
        assert_eq!(session.calls, vec!["consume"]);
        assert!(sleeper.slept.lock().unwrap().is_empty());
    }

    #[test]
    fn test_failed_reconnect_is_returned() {
        let sleeper = RecordingSleeper::default();
        let mut session = ScriptedSession::ending_with(vec![ConsumeEnd::ConnectionLost("gone".into())]);
        session.connect_failures.push_back(BrokerError::NotConnected);

        let (result, _) = run(&mut session, &sleeper);

        assert!(matches!(result, Err(BrokerError::NotConnected)));
        assert_eq!(session.calls, vec!["consume", "close", "connect"]);
    }

    #[test]
    fn test_queue_arguments_carry_ttl_and_dead_letter_route() {
        let topology = Topology::consumer(&BrokerSettings::default());
        let queue = topology.queue.clone().unwrap();

        let args = queue_arguments(&topology, &queue);

        assert_eq!(args.len(), 3);
        assert_eq!(args.get("x-message-ttl"), Some(&AmqpValue::LongLongInt(86_400_000)));
        assert_eq!(
            args.get("x-dead-letter-exchange"),
            Some(&AmqpValue::LongString("weather_exchange.dlx".to_string()))
        );
        assert_eq!(
            args.get("x-dead-letter-routing-key"),
            Some(&AmqpValue::LongString("weather.data.dead".to_string()))
        );
    }

    #[test]
    fn test_long_message_ttl_does_not_wrap() {
        let settings = BrokerSettings {
            message_ttl_ms: u32::MAX,
            ..BrokerSettings::default()
        };
        let topology = Topology::consumer(&settings);
        let queue = topology.queue.clone().unwrap();

        let args = queue_arguments(&topology, &queue);

        assert_eq!(args.get("x-message-ttl"), Some(&AmqpValue::LongLongInt(4_294_967_295)));
    }

    #[test]
    fn test_consume_requires_connection() {
        let settings = BrokerSettings::default();
        let mut connection = BrokerConnection::new(&settings, Topology::consumer(&settings), RetryPolicy::default());
        let shutdown = AtomicBool::new(false);

        let result = connection.consume(&shutdown, &mut |_: &[u8]| Disposition::Ack);
        assert!(matches!(result, Err(BrokerError::NotConnected)));

        let mut publisher = BrokerConnection::new(&settings, Topology::publisher(&settings), RetryPolicy::default());
        let result = publisher.consume(&shutdown, &mut |_: &[u8]| Disposition::Ack);
        assert!(matches!(result, Err(BrokerError::NoQueue)));
    }

    #[test]
    fn test_unreachable_broker_exhausts_connect_policy() {
        // nothing listens on port 1, so every attempt is refused
        let settings = BrokerSettings {
            host: "127.0.0.1".to_string(),
            port: 1,
            ..BrokerSettings::default()
        };
        let sleeper = Arc::new(RecordingSleeper::default());
        let mut connection = BrokerConnection::new(
            &settings,
            Topology::publisher(&settings),
            RetryPolicy::fixed(3, Duration::from_secs(2)),
        )
        .with_sleeper(sleeper.clone());

        assert!(matches!(connection.connect(), Err(BrokerError::Amqp(_))));
        assert_eq!(*sleeper.slept.lock().unwrap(), vec![Duration::from_secs(2); 2]);
    }
}
