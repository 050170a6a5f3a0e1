//! Background status polling.
//!
//! A [`StatusPoller`] thread wakes up every poll interval, locks the shared
//! client, sends a silent `MSR STATUS` and publishes the resulting
//! [`StatusUpdate`]. Holding the lock for the whole exchange keeps polls from
//! interleaving with user commands on the same connection.
//!
//! The first failed poll is published as [`PollEvent::Failed`] and ends the
//! thread; the caller decides whether to reconnect.
//!
//! ```no_run
//! use std::sync::{Arc, Mutex};
//! use std::time::Duration;
//! use atmd_client::{AtmdClient, PollEvent, StatusPoller};
//!
//! let client = Arc::new(Mutex::new(AtmdClient::connect_host("192.168.1.20")?));
//! let poller = StatusPoller::spawn(client.clone(), Duration::from_secs(2));
//!
//! for event in poller.events().iter() {
//!     match event {
//!         PollEvent::Status(update) => println!("{} {}", update.status, update.countdown),
//!         PollEvent::Failed(reason) => {
//!             eprintln!("polling stopped: {reason}");
//!             break;
//!         }
//!     }
//! }
//! # Ok::<(), atmd_client::AtmdError>(())
//! ```

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{select, tick, unbounded, Receiver, Sender};
use tracing::{debug, warn};

use crate::client::AtmdClient;
use crate::measurement::StatusUpdate;
use crate::session::Transport;

/// Published by the polling thread.
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    Status(StatusUpdate),
    /// Polling stopped because of this error
    Failed(String),
}

/// Handle to a running status polling thread.
pub struct StatusPoller {
    stop_tx: Option<Sender<()>>,
    events: Receiver<PollEvent>,
    handle: Option<JoinHandle<()>>,
}

impl StatusPoller {
    /// Start polling `client` every `interval`. The first poll happens one
    /// interval after the call.
    pub fn spawn<T>(client: Arc<Mutex<AtmdClient<T>>>, interval: Duration) -> Self
    where
        T: Transport + Send + 'static,
    {
        let (stop_tx, stop_rx) = unbounded::<()>();
        let (event_tx, events) = unbounded();

        let handle = thread::spawn(move || {
            Self::poll_loop(client, interval, stop_rx, event_tx);
        });

        Self {
            stop_tx: Some(stop_tx),
            events,
            handle: Some(handle),
        }
    }

    fn poll_loop<T: Transport>(
        client: Arc<Mutex<AtmdClient<T>>>,
        interval: Duration,
        stop_rx: Receiver<()>,
        event_tx: Sender<PollEvent>,
    ) {
        debug!("Status poller started, interval {:?}", interval);
        let ticker = tick(interval);
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => {
                    let result = match client.lock() {
                        Ok(mut client) => client.poll_status().map_err(|e| e.to_string()),
                        Err(_) => Err("client lock poisoned".to_string()),
                    };
                    match result {
                        Ok(update) => {
                            if event_tx.send(PollEvent::Status(update)).is_err() {
                                break;
                            }
                        }
                        Err(reason) => {
                            warn!("Status poll failed: {}", reason);
                            let _ = event_tx.send(PollEvent::Failed(reason));
                            break;
                        }
                    }
                }
            }
        }
        debug!("Status poller stopped");
    }

    /// Events published by the polling thread.
    pub fn events(&self) -> &Receiver<PollEvent> {
        &self.events
    }

    /// False once the thread has exited (stopped or failed).
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop polling and wait for the thread to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the stop channel.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
