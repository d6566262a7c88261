//! Observer events
//!
//! Side-channel notifications that do not complete a command: connection
//! lifecycle, transport errors, and device bytes that leave the head in
//! flight. Delivered to every subscriber in generation order.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

/// Events observable on a driver instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    /// The port opened.
    Open,
    /// The port closed (explicitly or because the device went away).
    Close,
    /// An open attempt failed; the reconnect timer is running.
    Failed(String),
    /// A transport error was observed.
    Error(String),
    /// The device reported it is locked.
    Locked,
    /// The device is waiting for on-device user confirmation.
    WaitUserConfirm,
}

/// Fan-out of events to subscriber channels.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    subscribers: Arc<Mutex<Vec<Sender<DeviceEvent>>>>,
}

impl EventSink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Events emitted after this call are
    /// delivered to the returned receiver.
    pub(crate) fn subscribe(&self) -> Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to all live subscribers, dropping the dead ones.
    pub(crate) fn emit(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}
