//! Command queue
//!
//! Each submitted command becomes a [`CommandEntry`] holding its outbound
//! bytes, its one-shot completion handle, and the decoder state that belongs
//! to it (`esc_pending`, `output_buffer`). Entries wait in a FIFO until the
//! engine serves them; `prepend` inserts ahead of all waiting entries but
//! never displaces the entry currently in flight.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError};
use std::time::Duration;

use crate::error::DriverError;
use crate::response::Response;

/// The caller half of a one-shot completion.
///
/// Returned by `send()` and `lock()`. Exactly one result will ever arrive.
pub struct Completion<T> {
    rx: Receiver<Result<T, DriverError>>,
}

impl<T> Completion<T> {
    /// Block until the completion fires.
    pub fn wait(self) -> Result<T, DriverError> {
        match self.rx.recv() {
            Ok(result) => result,
            // The driver was dropped with this completion still pending.
            Err(_) => Err(DriverError::Cleared),
        }
    }

    /// Block for at most `timeout`. `None` means still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, DriverError>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(DriverError::Cleared)),
        }
    }

    /// Check for a result without blocking. `None` means still pending.
    pub fn try_wait(&self) -> Option<Result<T, DriverError>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(DriverError::Cleared)),
        }
    }
}

/// The firing half of a one-shot completion.
///
/// `resolve` and `reject` consume the handle, so exactly one of them can
/// ever run for a given completion.
pub(crate) struct Resolver<T> {
    tx: SyncSender<Result<T, DriverError>>,
}

impl<T> Resolver<T> {
    pub(crate) fn resolve(self, value: T) {
        let _ = self.tx.send(Ok(value));
    }

    pub(crate) fn reject(self, error: DriverError) {
        let _ = self.tx.send(Err(error));
    }
}

/// Create a connected resolver/completion pair.
pub(crate) fn completion<T>() -> (Resolver<T>, Completion<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Resolver { tx }, Completion { rx })
}

/// Create a completion that has already failed.
pub(crate) fn failed<T>(error: DriverError) -> Completion<T> {
    let (resolver, comp) = completion();
    resolver.reject(error);
    comp
}

/// A queued command and the decoder state that belongs to it.
pub(crate) struct CommandEntry {
    /// Bytes to write to the wire when this entry reaches the head.
    pub(crate) bytes: Vec<u8>,
    /// One-shot completion handle; consumed when the entry finishes.
    resolver: Resolver<Response>,
    /// True iff the previous inbound byte while reading output was the
    /// escape marker.
    pub(crate) esc_pending: bool,
    /// Output bytes collected so far, escapes removed.
    pub(crate) output_buffer: Vec<u8>,
}

impl CommandEntry {
    pub(crate) fn new(bytes: Vec<u8>, resolver: Resolver<Response>) -> Self {
        Self {
            bytes,
            resolver,
            esc_pending: false,
            output_buffer: Vec::new(),
        }
    }

    pub(crate) fn resolve(self, response: Response) {
        self.resolver.resolve(response);
    }

    pub(crate) fn reject(self, error: DriverError) {
        self.resolver.reject(error);
    }

    /// Complete with the accumulated output buffer.
    pub(crate) fn complete_output(self) {
        let Self {
            resolver,
            output_buffer,
            ..
        } = self;
        resolver.resolve(Response::Output(output_buffer));
    }
}

/// FIFO of pending commands with an explicit prepend.
#[derive(Default)]
pub(crate) struct CommandQueue {
    entries: VecDeque<CommandEntry>,
}

impl CommandQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_back(&mut self, entry: CommandEntry) {
        self.entries.push_back(entry);
    }

    pub(crate) fn push_front(&mut self, entry: CommandEntry) {
        self.entries.push_front(entry);
    }

    pub(crate) fn pop_front(&mut self) -> Option<CommandEntry> {
        self.entries.pop_front()
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = CommandEntry> + '_ {
        self.entries.drain(..)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_resolve() {
        let (resolver, comp) = completion();
        resolver.resolve(Response::Ok);
        assert_eq!(comp.wait().unwrap(), Response::Ok);
    }

    #[test]
    fn test_completion_reject() {
        let (resolver, comp) = completion::<Response>();
        resolver.reject(DriverError::Disconnected);
        assert!(matches!(comp.wait(), Err(DriverError::Disconnected)));
    }

    #[test]
    fn test_completion_pending_then_fired() {
        let (resolver, comp) = completion();
        assert!(comp.try_wait().is_none());
        resolver.resolve(Response::SendInput);
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::SendInput);
    }

    #[test]
    fn test_completion_dropped_resolver_reports_cleared() {
        let (resolver, comp) = completion::<Response>();
        drop(resolver);
        assert!(matches!(comp.wait(), Err(DriverError::Cleared)));
    }

    #[test]
    fn test_failed_completion() {
        let comp: Completion<Response> = failed(DriverError::Disconnected);
        assert!(matches!(comp.wait(), Err(DriverError::Disconnected)));
    }

    #[test]
    fn test_entry_output_completion() {
        let (resolver, comp) = completion();
        let mut entry = CommandEntry::new(vec![0x1e], resolver);
        entry.output_buffer.extend_from_slice(&[0xaa, 0xbb]);
        entry.complete_output();
        assert_eq!(comp.wait().unwrap(), Response::Output(vec![0xaa, 0xbb]));
    }

    #[test]
    fn test_queue_fifo_order() {
        let mut queue = CommandQueue::new();
        for opcode in [1u8, 2, 3] {
            let (resolver, _comp) = completion();
            queue.push_back(CommandEntry::new(vec![opcode], resolver));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap().bytes, vec![1]);
        assert_eq!(queue.pop_front().unwrap().bytes, vec![2]);
        assert_eq!(queue.pop_front().unwrap().bytes, vec![3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_queue_prepend() {
        let mut queue = CommandQueue::new();
        let (r1, _c1) = completion();
        let (r2, _c2) = completion();
        let (r3, _c3) = completion();
        queue.push_back(CommandEntry::new(vec![1], r1));
        queue.push_back(CommandEntry::new(vec![2], r2));
        queue.push_front(CommandEntry::new(vec![100], r3));
        assert_eq!(queue.pop_front().unwrap().bytes, vec![100]);
        assert_eq!(queue.pop_front().unwrap().bytes, vec![1]);
        assert_eq!(queue.pop_front().unwrap().bytes, vec![2]);
    }
}
