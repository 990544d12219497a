//! Actor supervision
//!
//! An actor's public handle holds the outer sender; the supervisor forwards
//! the outer mailbox into a fresh inner mailbox for each incarnation. Normal
//! completion ends supervision; a panic logs, waits the exponential backoff,
//! and reruns the factory with a new inner receiver. Messages in flight at
//! the moment of a crash are lost — reconciliation rebuilds the correct state
//! from whatever is observable.

use crate::controller::backoff;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// An incarnation is considered stable after this long; the restart counter
/// resets so an old crash does not inflate a much later backoff.
const STABLE_AFTER: Duration = Duration::from_secs(60);

pub fn supervise<M, F>(
    name: String,
    base: Duration,
    max: Duration,
    mut outer_rx: mpsc::Receiver<M>,
    factory: F,
) where
    M: Send + 'static,
    F: Fn(mpsc::Receiver<M>) -> BoxFuture<'static, ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            let (inner_tx, inner_rx) = mpsc::channel(64);
            let mut task = AssertUnwindSafe(factory(inner_rx)).catch_unwind().boxed();
            let started = Instant::now();

            let result = loop {
                tokio::select! {
                    result = &mut task => break result,
                    msg = outer_rx.recv() => match msg {
                        Some(msg) => {
                            // A failed forward means the incarnation is going
                            // down; the message is lost, the select loop will
                            // observe the task result next.
                            let _ = inner_tx.send(msg).await;
                        }
                        None => {
                            // Every handle dropped: let the incarnation drain
                            // and finish.
                            drop(inner_tx);
                            break task.await;
                        }
                    }
                }
            };

            match result {
                Ok(()) => {
                    tracing::debug!(actor = %name, "actor completed");
                    break;
                }
                Err(_) => {
                    attempt = if started.elapsed() >= STABLE_AFTER {
                        1
                    } else {
                        attempt + 1
                    };
                    let delay = backoff::exponential(base, max, attempt);
                    tracing::error!(
                        actor = %name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "actor panicked, restarting"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn restarts_after_panic_and_keeps_serving() {
        let (tx, rx) = mpsc::channel::<(u32, tokio::sync::oneshot::Sender<u32>)>(8);
        let incarnations = Arc::new(AtomicU32::new(0));

        let counter = incarnations.clone();
        supervise(
            "test-actor".to_string(),
            Duration::from_millis(5),
            Duration::from_millis(20),
            rx,
            move |mut inner_rx| {
                let incarnation = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    while let Some((value, reply)) = inner_rx.recv().await {
                        if value == 0 {
                            panic!("boom");
                        }
                        let _ = reply.send(value + incarnation * 100);
                    }
                }
                .boxed()
            },
        );

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        tx.send((1, reply_tx)).await.expect("send");
        assert_eq!(reply_rx.await.expect("reply"), 1);

        // Crash it, then verify a new incarnation answers.
        let (reply_tx, _reply_rx) = tokio::sync::oneshot::channel();
        tx.send((0, reply_tx)).await.expect("send crash");

        let mut answered = None;
        for _ in 0..100 {
            let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
            if tx.send((2, reply_tx)).await.is_err() {
                break;
            }
            if let Ok(Ok(v)) =
                tokio::time::timeout(Duration::from_millis(50), reply_rx).await.map_err(|_| ())
            {
                answered = Some(v);
                break;
            }
        }
        assert_eq!(answered, Some(102), "second incarnation served the call");
        assert!(incarnations.load(Ordering::SeqCst) >= 2);
    }
}
