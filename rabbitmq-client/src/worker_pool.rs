use std::sync::Arc;

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use tokio::sync::Semaphore;

use crate::message::Message;

/// Application-provided handler dispatched by the worker pool for each delivered message.
#[async_trait]
pub trait Handler<T>: Send + Sync {
    async fn handle(&self, item: T);
}

/// Anything the worker pool can nack on a handler panic. Implemented by
/// `Message`; test doubles implement it too so the concurrency/panic-isolation
/// properties of the pool can be exercised without a live broker.
#[async_trait]
pub trait Nackable: Send + 'static {
    async fn nack_for_panic(&self, reason: &str);
}

#[async_trait]
impl Nackable for Message {
    async fn nack_for_panic(&self, reason: &str) {
        if let Err(e) = self.nack(reason).await {
            log::error!("rabbitmq-client: failed to nack after handler panic: {}", e);
        }
    }
}

/// Drains `messages` into `handler.handle`, running at most `max_workers`
/// handler invocations concurrently. A handler invocation that panics is
/// isolated: the panic is logged, the message is nacked with the panic text
/// as reason, and the pool keeps running. The permit is released through
/// `Semaphore::acquire_owned`'s RAII guard, so it is freed whether the
/// handler returns normally, errors, or panics.
pub async fn start_workers<S, T, H>(mut messages: S, handler: Arc<H>, max_workers: usize)
where
    S: Stream<Item = T> + Unpin,
    T: Nackable,
    H: Handler<T> + 'static,
{
    let semaphore = Arc::new(Semaphore::new(max_workers));
    let mut in_flight = tokio::task::JoinSet::new();

    while let Some(item) = messages.next().await {
        let permit = semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("worker pool semaphore is never closed");
        let handler = handler.clone();

        in_flight.spawn(async move {
            let _permit = permit;
            run_handler(handler, item).await;
        });

        // Reap tasks that already finished so the set never grows past
        // roughly `max_workers` entries for a long-running stream.
        while in_flight.try_join_next().is_some() {}
    }

    while in_flight.join_next().await.is_some() {}
}

async fn run_handler<T, H>(handler: Arc<H>, item: T)
where
    T: Nackable,
    H: Handler<T> + 'static,
{
    let shared = Arc::new(tokio::sync::Mutex::new(Some(item)));
    let recovery = shared.clone();

    let join_result = tokio::spawn(async move {
        let item = shared
            .lock()
            .await
            .take()
            .expect("item taken exactly once per handler invocation");
        handler.handle(item).await;
    })
    .await;

    if let Err(join_error) = join_result {
        let panic_text = if join_error.is_panic() {
            let panic = join_error.into_panic();
            if let Some(s) = panic.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic.downcast_ref::<String>() {
                s.clone()
            } else {
                "handler panicked with a non-string payload".to_string()
            }
        } else {
            "handler task was cancelled".to_string()
        };

        log::error!("rabbitmq-client: handler panicked: {}", panic_text);
        if let Some(item) = recovery.lock().await.take() {
            item.nack_for_panic(&format!("handler panicked: {}", panic_text)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_stream::wrappers::ReceiverStream;

    struct DummyJob {
        nacked: Arc<std::sync::atomic::AtomicBool>,
        panics: bool,
    }

    #[async_trait]
    impl Nackable for DummyJob {
        async fn nack_for_panic(&self, _reason: &str) {
            self.nacked.store(true, Ordering::SeqCst);
        }
    }

    struct CountingHandler {
        concurrent: Arc<AtomicUsize>,
        max_observed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<DummyJob> for CountingHandler {
        async fn handle(&self, job: DummyJob) {
            let current = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_observed.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            if job.panics {
                panic!("intentional test panic");
            }
        }
    }

    #[tokio::test]
    async fn caps_concurrency_at_max_workers() {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let nacked_flags: Vec<_> = (0..8).map(|_| Arc::new(std::sync::atomic::AtomicBool::new(false))).collect();
        for flag in &nacked_flags {
            tx.send(DummyJob { nacked: flag.clone(), panics: false }).await.unwrap();
        }
        drop(tx);

        let stream = ReceiverStream::new(rx);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_observed = Arc::new(AtomicUsize::new(0));
        let handler = Arc::new(CountingHandler {
            concurrent: concurrent.clone(),
            max_observed: max_observed.clone(),
        });
        start_workers(stream, handler, 3).await;

        assert!(max_observed.load(Ordering::SeqCst) <= 3);
        assert!(max_observed.load(Ordering::SeqCst) >= 1);
        for flag in &nacked_flags {
            assert!(!flag.load(Ordering::SeqCst));
        }
    }

    #[tokio::test]
    async fn panicking_handler_nacks_and_does_not_stop_other_workers() {
        let (tx, rx) = tokio::sync::mpsc::channel(16);
        let panicking_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let ok_flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        tx.send(DummyJob { nacked: panicking_flag.clone(), panics: true }).await.unwrap();
        tx.send(DummyJob { nacked: ok_flag.clone(), panics: false }).await.unwrap();
        drop(tx);

        let stream = ReceiverStream::new(rx);
        let handler = Arc::new(CountingHandler {
            concurrent: Arc::new(AtomicUsize::new(0)),
            max_observed: Arc::new(AtomicUsize::new(0)),
        });
        start_workers(stream, handler, 2).await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(panicking_flag.load(Ordering::SeqCst));
        assert!(!ok_flag.load(Ordering::SeqCst));
    }
}
