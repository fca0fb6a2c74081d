//! Cancellation, adapted from the shutdown listener in mini-redis.

use tokio::sync::broadcast;
use tracing::{error, info};

type Notify = broadcast::Receiver<()>;

/// Listens for the operator's request to stop.
///
/// Only a single value is ever sent on the channel. Once it has been seen, or the sending half has gone away, the
/// holder should clean up and return.
#[derive(Debug)]
pub struct Shutdown {
    /// `true` if the shutdown signal has been received
    shutdown: bool,

    notify: Notify,
}

impl Shutdown {
    pub fn new(notify: Notify) -> Shutdown {
        Shutdown {
            shutdown: false,
            notify,
        }
    }

    /// Returns `true` if the shutdown signal has been received.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Receive the shutdown notice, waiting if necessary.
    pub async fn recv(&mut self) {
        if self.is_shutdown() {
            return;
        }

        // Cannot receive a "lag error" as only one value is ever sent.
        let _ = self.notify.recv().await;

        self.shutdown = true;
    }
}

impl From<Notify> for Shutdown {
    fn from(notify: Notify) -> Self {
        Self::new(notify)
    }
}

/// A [`Shutdown`] which fires on Ctrl-C (SIGINT).
pub fn ctrl_c() -> Shutdown {
    let (notify, listener) = broadcast::channel(1);

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, shutting down");
                let _ = notify.send(());
            }
            Err(error) => {
                error!(%error, "Unable to listen for interrupt");
                // Holding the sender keeps the run going rather than stopping it straight away
                let _notify = notify;
                std::future::pending::<()>().await;
            }
        }
    });

    Shutdown::new(listener)
}

#[tokio::test]
async fn recv_returns_once_notified() {
    let (notify, listener) = broadcast::channel(1);
    let mut shutdown = Shutdown::from(listener);
    assert!(!shutdown.is_shutdown());

    notify.send(()).unwrap();
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());

    // Subsequent calls return immediately
    shutdown.recv().await;
}

#[tokio::test]
async fn dropped_sender_counts_as_shutdown() {
    let (notify, listener) = broadcast::channel::<()>(1);
    let mut shutdown = Shutdown::new(listener);

    drop(notify);
    shutdown.recv().await;
    assert!(shutdown.is_shutdown());
}
