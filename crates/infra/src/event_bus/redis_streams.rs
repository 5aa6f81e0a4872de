//! Redis Streams-backed broker (durable, at-least-once delivery).
//!
//! - **Topic** = stream key. Producing is `XADD <topic> * method .. origin .. payload ..`;
//!   the generated entry id is reported as the offset.
//! - **Consumer group** per service (e.g. `profile-service`), so every service
//!   sees every event once, and replicas of one service share the work.
//! - **Acknowledgment** is explicit (`XACK`) and issued by the consumer loop
//!   after dispatch.
//!
//! Connection refusals are reported as `AllBrokersDown` and a dropped
//! connection as `Closed`; both are fatal for a consumer loop.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tracing::{debug, instrument};

use hrms_events::{
    BrokerError, BrokerMessage, Consumer, ConsumerEvent, DeliveryReport, METHOD_HEADER, ORIGIN_HEADER, Producer,
};

const PAYLOAD_FIELD: &str = "payload";

/// Entries fetched per XREADGROUP call.
const READ_COUNT: usize = 16;

fn map_redis_error(operation: &str, err: redis::RedisError) -> BrokerError {
    let message = format!("{operation} failed: {err}");
    if err.is_connection_refusal() {
        BrokerError::all_brokers_down(message)
    } else if err.is_connection_dropped() {
        BrokerError::closed(message)
    } else {
        BrokerError::command(message)
    }
}

async fn connect(redis_url: &str) -> Result<MultiplexedConnection, BrokerError> {
    let client = redis::Client::open(redis_url).map_err(|e| map_redis_error("open", e))?;
    client
        .get_multiplexed_tokio_connection()
        .await
        .map_err(|e| map_redis_error("connect", e))
}

// ─────────────────────────────────────────────────────────────────────────────
// Producer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct RedisStreamsProducer {
    conn: MultiplexedConnection,
}

impl core::fmt::Debug for RedisStreamsProducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsProducer").finish_non_exhaustive()
    }
}

impl RedisStreamsProducer {
    pub async fn connect(redis_url: &str) -> Result<Self, BrokerError> {
        Ok(Self {
            conn: connect(redis_url).await?,
        })
    }
}

#[async_trait]
impl Producer for RedisStreamsProducer {
    #[instrument(skip(self, message), fields(topic = %message.topic, method = ?message.method()), err)]
    async fn produce(&self, message: BrokerMessage) -> Result<DeliveryReport, BrokerError> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(&message.topic).arg("*");
        for (key, value) in &message.headers {
            cmd.arg(key).arg(value);
        }
        cmd.arg(PAYLOAD_FIELD).arg(&message.payload);

        let mut conn = self.conn.clone();
        let entry_id: String = cmd
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("XADD", e))?;

        Ok(DeliveryReport {
            topic: message.topic,
            partition: 0,
            offset: entry_id,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Consumer
// ─────────────────────────────────────────────────────────────────────────────

/// Consumer-group reader over one or more streams.
pub struct RedisStreamsConsumer {
    conn: Option<MultiplexedConnection>,
    topics: Vec<String>,
    group: String,
    consumer: String,
    buffer: VecDeque<BrokerMessage>,
}

impl core::fmt::Debug for RedisStreamsConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsConsumer")
            .field("topics", &self.topics)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsConsumer {
    /// Connect and make sure the consumer group exists on every topic.
    pub async fn connect(
        redis_url: &str,
        topics: Vec<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, BrokerError> {
        let mut this = Self {
            conn: Some(connect(redis_url).await?),
            topics,
            group: group.into(),
            consumer: consumer.into(),
            buffer: VecDeque::new(),
        };
        this.ensure_consumer_groups().await?;
        Ok(this)
    }

    /// XGROUP CREATE .. MKSTREAM for each topic; an existing group is fine.
    async fn ensure_consumer_groups(&mut self) -> Result<(), BrokerError> {
        let conn = self.conn.as_mut().ok_or_else(|| BrokerError::closed("consumer closed"))?;
        for topic in &self.topics {
            // "0": a new group starts from the beginning of the stream.
            let created: redis::RedisResult<String> = redis::cmd("XGROUP")
                .arg("CREATE")
                .arg(topic)
                .arg(&self.group)
                .arg("0")
                .arg("MKSTREAM")
                .query_async(conn)
                .await;
            match created {
                Ok(_) => debug!(topic = %topic, group = %self.group, "consumer group created"),
                Err(e) if e.code() == Some("BUSYGROUP") => {}
                Err(e) => return Err(map_redis_error("XGROUP CREATE", e)),
            }
        }
        Ok(())
    }

    async fn read_batch(&mut self, block: Duration) -> Result<(), BrokerError> {
        let conn = self.conn.as_mut().ok_or_else(|| BrokerError::closed("consumer closed"))?;

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer)
            .arg("COUNT")
            .arg(READ_COUNT)
            .arg("BLOCK")
            .arg(block.as_millis().max(1) as u64)
            .arg("STREAMS");
        for topic in &self.topics {
            cmd.arg(topic);
        }
        for _ in &self.topics {
            cmd.arg(">");
        }

        let reply: redis::Value = cmd
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XREADGROUP", e))?;
        self.buffer.extend(parse_read_reply(reply)?);
        Ok(())
    }
}

#[async_trait]
impl Consumer for RedisStreamsConsumer {
    async fn poll(&mut self, timeout: Duration) -> Option<ConsumerEvent> {
        if self.conn.is_none() {
            return Some(ConsumerEvent::Error(BrokerError::closed("consumer closed")));
        }
        if self.buffer.is_empty() {
            if let Err(err) = self.read_batch(timeout).await {
                return Some(ConsumerEvent::Error(err));
            }
        }
        self.buffer.pop_front().map(ConsumerEvent::Message)
    }

    async fn ack(&mut self, message: &BrokerMessage) -> Result<(), BrokerError> {
        let Some(id) = message.id.as_deref() else {
            return Ok(());
        };
        let conn = self.conn.as_mut().ok_or_else(|| BrokerError::closed("consumer closed"))?;
        let _: i64 = redis::cmd("XACK")
            .arg(&message.topic)
            .arg(&self.group)
            .arg(id)
            .query_async(conn)
            .await
            .map_err(|e| map_redis_error("XACK", e))?;
        Ok(())
    }

    async fn close(&mut self) {
        self.buffer.clear();
        self.conn = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reply parsing
// ─────────────────────────────────────────────────────────────────────────────

fn malformed(what: &str) -> BrokerError {
    BrokerError::command(format!("malformed XREADGROUP reply: {what}"))
}

fn bytes(value: &redis::Value) -> Option<Vec<u8>> {
    match value {
        redis::Value::Data(data) => Some(data.clone()),
        redis::Value::Status(s) => Some(s.as_bytes().to_vec()),
        _ => None,
    }
}

/// Reply format: `[[stream, [[id, [field, value, ...]], ...]], ...]`, or nil on timeout.
fn parse_read_reply(reply: redis::Value) -> Result<Vec<BrokerMessage>, BrokerError> {
    let streams = match reply {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Bulk(streams) => streams,
        _ => return Err(malformed("expected array of streams")),
    };

    let mut messages = Vec::new();
    for stream in streams {
        let redis::Value::Bulk(parts) = stream else {
            return Err(malformed("expected [stream, entries]"));
        };
        let [name, redis::Value::Bulk(entries)] = parts.as_slice() else {
            return Err(malformed("expected [stream, entries]"));
        };
        let topic = bytes(name)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .ok_or_else(|| malformed("stream name"))?;

        for entry in entries {
            messages.push(parse_entry(&topic, entry)?);
        }
    }
    Ok(messages)
}

fn parse_entry(topic: &str, entry: &redis::Value) -> Result<BrokerMessage, BrokerError> {
    let redis::Value::Bulk(parts) = entry else {
        return Err(malformed("expected [id, fields]"));
    };
    let [id, redis::Value::Bulk(fields)] = parts.as_slice() else {
        return Err(malformed("expected [id, fields]"));
    };
    let id = bytes(id)
        .map(|b| String::from_utf8_lossy(&b).into_owned())
        .ok_or_else(|| malformed("entry id"))?;

    let mut message = BrokerMessage::new(topic, Vec::new());
    message.id = Some(id);
    for pair in fields.chunks(2) {
        let [key, value] = pair else { continue };
        let (Some(key), Some(value)) = (bytes(key), bytes(value)) else {
            continue;
        };
        let key = String::from_utf8_lossy(&key).into_owned();
        if key == PAYLOAD_FIELD {
            message.payload = value;
        } else if key == METHOD_HEADER || key == ORIGIN_HEADER {
            message.headers.insert(key, String::from_utf8_lossy(&value).into_owned());
        }
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use redis::Value;

    fn data(s: &str) -> Value {
        Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn nil_reply_is_empty() {
        assert!(parse_read_reply(Value::Nil).unwrap().is_empty());
    }

    #[test]
    fn parses_entries_with_headers_and_payload() {
        let reply = Value::Bulk(vec![Value::Bulk(vec![
            data("hrms.users"),
            Value::Bulk(vec![Value::Bulk(vec![
                data("1700000000000-0"),
                Value::Bulk(vec![
                    data("method"),
                    data("PUT.USER"),
                    data("origin"),
                    data("profile"),
                    data("payload"),
                    data("{\"id\":1}"),
                ]),
            ])]),
        ])]);

        let messages = parse_read_reply(reply).unwrap();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.topic, "hrms.users");
        assert_eq!(m.id.as_deref(), Some("1700000000000-0"));
        assert_eq!(m.method(), Some("PUT.USER"));
        assert_eq!(m.origin(), Some("profile"));
        assert_eq!(m.payload, b"{\"id\":1}".to_vec());
    }

    #[test]
    fn entry_without_method_has_no_method_header() {
        let entry = Value::Bulk(vec![data("1-0"), Value::Bulk(vec![data("payload"), data("{}")])]);
        let m = parse_entry("t", &entry).unwrap();
        assert_eq!(m.method(), None);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_read_reply(Value::Int(3)).is_err());
    }
}
