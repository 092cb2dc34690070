use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{BasicProperties, Channel};

use crate::error::MessageError;

const RETRY_COUNT_HEADER: &str = "x-retry-count";
const DLE_REASON_HEADER: &str = "x-dle-reason";
const DLE_TIMESTAMP_HEADER: &str = "x-dle-timestamp";

/// A single broker delivery, wrapped with everything needed to finalize it:
/// the main channel (for ack/reject), and the dedicated dead-letter and
/// retry-later publish channels. Ack, Nack, and Requeue are each at-most-once;
/// a second call on an already-finalized message returns `MessageError::AlreadyFinalized`.
pub struct Message {
    delivery: Delivery,
    main_channel: Channel,
    dle_channel: Channel,
    retry_channel: Channel,
    dle_exchange: String,
    retry_later_exchange: String,
    retry_limit: u32,
    finalized: AtomicBool,
}

impl Message {
    pub fn new(
        delivery: Delivery,
        main_channel: Channel,
        dle_channel: Channel,
        retry_channel: Channel,
        dle_exchange: String,
        retry_later_exchange: String,
        retry_limit: u32,
    ) -> Self {
        Self {
            delivery,
            main_channel,
            dle_channel,
            retry_channel,
            dle_exchange,
            retry_later_exchange,
            retry_limit,
            finalized: AtomicBool::new(false),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn routing_key(&self) -> &str {
        self.delivery.routing_key.as_str()
    }

    fn take_finalization(&self) -> Result<(), MessageError> {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return Err(MessageError::AlreadyFinalized);
        }
        Ok(())
    }

    /// Acknowledges the delivery.
    pub async fn ack(&self) -> Result<(), MessageError> {
        self.take_finalization()?;
        self.main_channel
            .basic_ack(self.delivery.delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessageError::AckFailed(e.to_string()))
    }

    /// Acknowledges the delivery, then publishes a copy to the dead-letter
    /// exchange carrying `x-dle-reason`/`x-dle-timestamp` headers. The ack
    /// happens first so the original queue slot is released even if the
    /// dead-letter publish itself fails.
    pub async fn nack(&self, reason: &str) -> Result<(), MessageError> {
        self.take_finalization()?;
        self.main_channel
            .basic_ack(self.delivery.delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessageError::NackFailed(e.to_string()))?;

        let mut headers = FieldTable::default();
        headers.insert(DLE_REASON_HEADER.into(), AMQPValue::LongString(reason.into()));
        headers.insert(
            DLE_TIMESTAMP_HEADER.into(),
            AMQPValue::LongString(Utc::now().to_rfc3339().into()),
        );
        let properties = BasicProperties::default()
            .with_headers(headers)
            .with_timestamp(Utc::now().timestamp() as u64);

        self.dle_channel
            .basic_publish(
                &self.dle_exchange,
                self.delivery.routing_key.as_str(),
                BasicPublishOptions::default(),
                &self.delivery.data,
                properties,
            )
            .await
            .map_err(|e| MessageError::DeadLetterPublishFailed(e.to_string()))?;
        Ok(())
    }

    /// Requeues the delivery for a bounded number of retries, dead-lettering
    /// to the DLE once `retry_limit` is exceeded. If `retry_limit` is zero,
    /// requeues immediately and indefinitely via the broker's own requeue flag.
    pub async fn requeue(&self, reason: &str) -> Result<(), MessageError> {
        if self.retry_limit == 0 {
            self.take_finalization()?;
            return self
                .main_channel
                .basic_reject(
                    self.delivery.delivery_tag,
                    BasicRejectOptions { requeue: true },
                )
                .await
                .map_err(|e| MessageError::NackFailed(e.to_string()));
        }

        let current = retry_count_from_headers(self.delivery.properties.headers())?;
        let next = current + 1;

        if next > self.retry_limit {
            return self
                .nack(&format!(
                    "{} - Reached the max {} number of retries.",
                    reason, self.retry_limit
                ))
                .await;
        }

        self.take_finalization()?;
        self.main_channel
            .basic_ack(self.delivery.delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| MessageError::AckFailed(e.to_string()))?;

        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(next as i64));
        let properties = BasicProperties::default()
            .with_headers(headers)
            .with_timestamp(Utc::now().timestamp() as u64);

        self.retry_channel
            .basic_publish(
                &self.retry_later_exchange,
                self.delivery.routing_key.as_str(),
                BasicPublishOptions::default(),
                &self.delivery.data,
                properties,
            )
            .await
            .map_err(|e| MessageError::RetryPublishFailed(e.to_string()))?;
        Ok(())
    }
}

/// Reads `x-retry-count` from delivery headers. Absent means zero retries so
/// far. A present value of an unexpected AMQP field type fails loudly instead
/// of silently defaulting, so a malformed or foreign header is never misread
/// as "never retried".
fn retry_count_from_headers(headers: &Option<FieldTable>) -> Result<u32, MessageError> {
    let Some(headers) = headers.as_ref() else {
        return Ok(0);
    };
    let Some(value) = headers.inner().get(RETRY_COUNT_HEADER) else {
        return Ok(0);
    };
    match value {
        AMQPValue::LongUInt(n) => Ok(*n),
        AMQPValue::LongInt(n) => u32::try_from(*n)
            .map_err(|_| MessageError::UnexpectedRetryCountType(format!("negative LongInt {}", n))),
        AMQPValue::LongLongInt(n) => u32::try_from(*n)
            .map_err(|_| MessageError::UnexpectedRetryCountType(format!("out of range LongLongInt {}", n))),
        other => Err(MessageError::UnexpectedRetryCountType(format!("{:?}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_header_counts_as_zero() {
        assert_eq!(retry_count_from_headers(&None).unwrap(), 0);
    }

    #[test]
    fn unexpected_type_fails_loudly() {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::Boolean(true));
        let err = retry_count_from_headers(&Some(headers)).unwrap_err();
        assert!(matches!(err, MessageError::UnexpectedRetryCountType(_)));
    }

    #[test]
    fn reads_long_long_int_count() {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::LongLongInt(3));
        assert_eq!(retry_count_from_headers(&Some(headers)).unwrap(), 3);
    }
}
