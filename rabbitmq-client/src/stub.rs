use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use crate::error::MessageError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Finalization {
    Acked,
    Nacked(String),
    Requeued(String),
}

/// In-memory double for `Message`, for testing application handlers without a
/// live broker. Enforces the same at-most-once finalization invariant as the
/// real message: a second Ack/Nack/Requeue call returns `MessageError::AlreadyFinalized`.
pub struct StubMessage {
    body: Vec<u8>,
    routing_key: String,
    finalization: Mutex<Option<Finalization>>,
}

impl StubMessage {
    pub fn new(body: impl Into<Vec<u8>>, routing_key: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            routing_key: routing_key.into(),
            finalization: Mutex::new(None),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    async fn finalize(&self, with: Finalization) -> Result<(), MessageError> {
        let mut slot = self.finalization.lock().await;
        if slot.is_some() {
            return Err(MessageError::AlreadyFinalized);
        }
        *slot = Some(with);
        Ok(())
    }

    pub async fn ack(&self) -> Result<(), MessageError> {
        self.finalize(Finalization::Acked).await
    }

    pub async fn nack(&self, reason: &str) -> Result<(), MessageError> {
        self.finalize(Finalization::Nacked(reason.to_string())).await
    }

    pub async fn requeue(&self, reason: &str) -> Result<(), MessageError> {
        self.finalize(Finalization::Requeued(reason.to_string())).await
    }

    async fn wait_for<F>(&self, predicate: F, wait: Duration) -> bool
    where
        F: Fn(&Finalization) -> bool,
    {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(f) = self.finalization.lock().await.as_ref() {
                if predicate(f) {
                    return true;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn was_acked(&self, wait: Duration) -> bool {
        timeout(wait, self.wait_for(|f| matches!(f, Finalization::Acked), wait))
            .await
            .unwrap_or(false)
    }

    pub async fn was_nacked(&self, wait: Duration) -> Option<String> {
        if !self
            .wait_for(|f| matches!(f, Finalization::Nacked(_)), wait)
            .await
        {
            return None;
        }
        match self.finalization.lock().await.as_ref() {
            Some(Finalization::Nacked(reason)) => Some(reason.clone()),
            _ => None,
        }
    }

    pub async fn was_requeued(&self, wait: Duration) -> Option<String> {
        if !self
            .wait_for(|f| matches!(f, Finalization::Requeued(_)), wait)
            .await
        {
            return None;
        }
        match self.finalization.lock().await.as_ref() {
            Some(Finalization::Requeued(reason)) => Some(reason.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_ack() {
        let stub = StubMessage::new("payload", "rk");
        stub.ack().await.unwrap();
        assert!(stub.was_acked(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn records_nack_reason() {
        let stub = StubMessage::new("payload", "rk");
        stub.nack("boom").await.unwrap();
        assert_eq!(
            stub.was_nacked(Duration::from_millis(50)).await,
            Some("boom".to_string())
        );
    }

    #[tokio::test]
    async fn cannot_finalize_twice() {
        let stub = StubMessage::new("payload", "rk");
        stub.ack().await.unwrap();
        let err = stub.nack("too late").await.unwrap_err();
        assert!(matches!(err, MessageError::AlreadyFinalized));
    }

    #[tokio::test]
    async fn was_acked_times_out_when_never_finalized() {
        let stub = StubMessage::new("payload", "rk");
        assert!(!stub.was_acked(Duration::from_millis(20)).await);
    }
}
