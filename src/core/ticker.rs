//! Periodic background task with prompt shutdown.
//!
//! The thread waits on a stop channel with `recv_timeout(interval)`; a timeout
//! means "tick", a message or disconnect means "stop". Dropping the `Ticker`
//! stops and joins the thread.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{trace, warn};
use std::thread;
use std::time::Duration;

pub struct Ticker {
    name: String,
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Ticker {
    /// Spawn a thread calling `tick` every `interval` until stopped.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => tick(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
        trace!("Ticker '{}' started ({} ms)", name, interval.as_millis());

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Stop and join. Idempotent.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // Stopped from inside its own tick; the loop exits on its own.
                return;
            }
            if handle.join().is_err() {
                warn!("Ticker '{}' panicked", self.name);
            }
            trace!("Ticker '{}' stopped", self.name);
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
