//! Long-lived collaborator streams and periodic sync tickers.
//!
//! A watcher connects to a stream, forwards its items into a pump
//! channel, and reconnects after a fixed delay when the stream ends or
//! fails to open. Tickers poke capacity-1 trigger channels, so a slow
//! pump sees at most one pending trigger per kind.

use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use convoy_cluster::ClientResult;

/// Spawn a reconnecting stream watcher.
///
/// `connect` is called for every (re)connect. The watcher exits on
/// shutdown or when the pump side of `tx` is gone.
pub fn spawn_watcher<T, F, Fut>(
    name: &'static str,
    mut connect: F,
    tx: mpsc::Sender<T>,
    retry_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ClientResult<mpsc::Receiver<T>>> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            if *shutdown.borrow() {
                return;
            }
            let connected = tokio::select! {
                result = connect() => result,
                _ = shutdown.changed() => return,
            };
            match connected {
                Ok(mut stream) => {
                    debug!(stream = name, "stream connected");
                    loop {
                        tokio::select! {
                            item = stream.recv() => match item {
                                Some(item) => {
                                    if tx.send(item).await.is_err() {
                                        return;
                                    }
                                }
                                None => break,
                            },
                            _ = shutdown.changed() => return,
                        }
                    }
                    warn!(stream = name, "stream disconnected, reconnecting");
                }
                Err(e) => {
                    warn!(stream = name, error = %e, "stream connect failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(retry_delay) => {}
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Spawn a ticker that fires `trigger` every `period`, first after one
/// full period.
pub fn spawn_ticker(
    name: &'static str,
    period: Duration,
    trigger: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!(ticker = name, "tick");
                    fire(&trigger);
                }
                _ = shutdown.changed() => return,
            }
        }
    })
}

/// Fire a trigger without blocking; a pending trigger absorbs this one.
pub fn fire(trigger: &mpsc::Sender<()>) {
    let _ = trigger.try_send(());
}

/// Fire a trigger after `delay`.
pub fn fire_after(trigger: mpsc::Sender<()>, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        fire(&trigger);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use convoy_cluster::ClientError;

    #[tokio::test(start_paused = true)]
    async fn watcher_reconnects_after_stream_ends() {
        let connects = Arc::new(AtomicU32::new(0));
        let counter = connects.clone();
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = spawn_watcher(
            "test",
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 1 {
                        return Err(ClientError::Unavailable("down".to_string()));
                    }
                    let (tx, rx) = mpsc::channel(4);
                    tx.send(n).await.unwrap();
                    Ok(rx)
                }
            },
            out_tx,
            Duration::from_millis(100),
            stop_rx,
        );

        assert_eq!(out_rx.recv().await, Some(0));
        // Second connect fails; third succeeds after two retry delays.
        assert_eq!(out_rx.recv().await, Some(2));
        assert_eq!(connects.load(Ordering::SeqCst), 3);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_coalesces_pending_triggers() {
        let (tx, mut rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = spawn_ticker("test", Duration::from_secs(1), tx, stop_rx);

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn fire_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        fire(&tx);
        fire(&tx);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }
}
