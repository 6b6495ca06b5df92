use tokio::sync::{broadcast, mpsc, Mutex};

// Notifier lets connection handlers know that the server is shutting down.
//
// Notify works by dropping the broadcast sender: every subscribed listener
// sees the channel close. Each listener also holds a clone of the completion
// sender; linger() resolves once the last of those clones is dropped, i.e.
// once every handler has finished.
#[derive(Debug)]
pub(crate) struct Notifier {
    shutdown_tx: Mutex<Option<broadcast::Sender<()>>>,
    complete_tx: Mutex<Option<mpsc::Sender<()>>>,
    complete_rx: Mutex<mpsc::Receiver<()>>,
}

impl Notifier {
    pub(crate) fn new() -> Notifier {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (complete_tx, complete_rx) = mpsc::channel(1);
        Notifier {
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            complete_tx: Mutex::new(Some(complete_tx)),
            complete_rx: Mutex::new(complete_rx),
        }
    }

    pub(crate) async fn notify(&self) {
        drop(self.shutdown_tx.lock().await.take());
        drop(self.complete_tx.lock().await.take());
    }

    // Waits for every task holding a Listener to finish.
    pub(crate) async fn linger(&self) {
        let _ = self.complete_rx.lock().await.recv().await;
    }

    pub(crate) async fn subscribe(&self) -> Listener {
        let shutdown_tx = self.shutdown_tx.lock().await;
        let complete_tx = self.complete_tx.lock().await;
        Listener {
            shutdown: shutdown_tx.is_none(),
            shutdown_rx: shutdown_tx.as_ref().map(|tx| tx.subscribe()),
            _complete_tx: complete_tx.clone(),
        }
    }
}

// Listener is held by each connection handler; dropping it signals that the
// handler finished.
#[derive(Debug)]
pub(crate) struct Listener {
    shutdown: bool,
    shutdown_rx: Option<broadcast::Receiver<()>>,
    _complete_tx: Option<mpsc::Sender<()>>,
}

impl Listener {
    /// Receive the shutdown notice, waiting if necessary.
    pub(crate) async fn listen(&mut self) {
        if self.shutdown {
            return;
        }
        if let Some(rx) = self.shutdown_rx.as_mut() {
            // The only signal is the channel closing.
            let _ = rx.recv().await;
        }
        self.shutdown = true;
    }
}
