//! First-error-wins signalling from background tasks to the run loop.
//!
//! Any number of [`ErrorReporter`] clones may report; only the first report is
//! delivered to the single [`ErrorSignal`]. Reporting never blocks, so a flood
//! of failures from concurrent requests cannot stall the reporters.

use tokio::sync::mpsc;

/// Creates a connected reporter/signal pair.
pub fn error_signal<E>() -> (ErrorReporter<E>, ErrorSignal<E>) {
    // One slot: the first report fills it and later ones find it full.
    let (tx, rx) = mpsc::channel(1);

    (ErrorReporter { tx }, ErrorSignal { rx: Some(rx) })
}

/// Sending half of an error signal.
#[derive(Debug)]
pub struct ErrorReporter<E> {
    tx: mpsc::Sender<E>,
}

impl<E> Clone for ErrorReporter<E> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<E> ErrorReporter<E> {
    /// Reports `err` if nothing has been reported yet.
    ///
    /// Returns `true` if this call delivered the error. Later errors are
    /// dropped.
    pub fn report(&self, err: E) -> bool {
        self.tx.try_send(err).is_ok()
    }

    /// Returns `true` once an error has been reported.
    pub fn is_reported(&self) -> bool {
        self.tx.capacity() == 0 || self.tx.is_closed()
    }
}

/// Receiving half of an error signal.
#[derive(Debug)]
pub struct ErrorSignal<E> {
    rx: Option<mpsc::Receiver<E>>,
}

impl<E> ErrorSignal<E> {
    /// Waits for the first reported error.
    ///
    /// Stays pending forever if every reporter is dropped without reporting,
    /// or if the error was already received. Cancel safe.
    pub async fn recv(&mut self) -> E {
        if let Some(rx) = self.rx.as_mut() {
            let received = rx.recv().await;
            // Closing keeps the slot from refilling with a later error.
            self.rx = None;

            if let Some(err) = received {
                return err;
            }
        }

        std::future::pending().await
    }

    /// Returns the reported error without waiting.
    pub fn try_recv(&mut self) -> Option<E> {
        let rx = self.rx.as_mut()?;

        match rx.try_recv() {
            Ok(err) => {
                self.rx = None;
                Some(err)
            }
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                self.rx = None;
                None
            }
        }
    }
}
