//! Protocol engine
//!
//! The state machine at the heart of the driver. Owns the channel, the
//! command queue and the watchdog deadline, and decodes inbound response
//! bytes against the command currently in flight.
//!
//! The protocol is strictly alternating at command granularity: the entry at
//! the head is the target of every inbound byte until it completes, then the
//! next queued entry is written to the wire. Devices may pipeline several
//! short responses into one read, so a single `on_data` call keeps decoding
//! until the buffer is exhausted.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::channel::Channel;
use crate::error::{DeviceError, DriverError};
use crate::events::{DeviceEvent, EventSink};
use crate::queue::{CommandEntry, CommandQueue};
use crate::response::{
    Response, RESPONSE_ESC_SEQUENCE, RESPONSE_LOCKED, RESPONSE_OK, RESPONSE_OUTPUT,
    RESPONSE_OUTPUT_END, RESPONSE_REJECTED, RESPONSE_SEND_INPUT, RESPONSE_WAIT_USER_CONFIRM,
};
use crate::WATCHDOG_TIMEOUT;

/// Engine state. The watchdog is armed exactly while the state is not
/// `Idle`, and a command is in flight exactly while the state is not `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EngineState {
    /// Nothing in flight; inbound bytes are unexpected.
    Idle,
    /// A command was written; awaiting its first response byte.
    Sending,
    /// Inside an output record; collecting payload bytes.
    Reading,
}

/// How the channel was lost, for the supervisor to report.
#[derive(Debug)]
pub(crate) enum ChannelLoss {
    /// Orderly end of stream (peer closed).
    Eof,
    /// A transport error.
    Error(String),
}

pub(crate) struct Engine {
    state: EngineState,
    queue: CommandQueue,
    /// The entry currently in flight. Kept out of the queue so a prepend can
    /// never displace it or corrupt its decoder state.
    current: Option<CommandEntry>,
    channel: Option<Box<dyn Channel>>,
    /// Watchdog deadline; `Some` iff state is not `Idle`.
    watchdog: Option<Instant>,
    watchdog_timeout: Duration,
    reject_on_locked: bool,
    debug: bool,
    loss: Option<ChannelLoss>,
    events: EventSink,
}

impl Engine {
    pub(crate) fn new(reject_on_locked: bool, debug: bool, events: EventSink) -> Self {
        Self {
            state: EngineState::Idle,
            queue: CommandQueue::new(),
            current: None,
            channel: None,
            watchdog: None,
            watchdog_timeout: WATCHDOG_TIMEOUT,
            reject_on_locked,
            debug,
            loss: None,
            events,
        }
    }

    #[cfg(test)]
    pub(crate) fn set_watchdog_timeout(&mut self, timeout: Duration) {
        self.watchdog_timeout = timeout;
    }

    #[cfg(test)]
    pub(crate) fn state(&self) -> EngineState {
        self.state
    }

    pub(crate) fn is_open(&self) -> bool {
        self.channel.is_some()
    }

    #[cfg(test)]
    pub(crate) fn watchdog_armed(&self) -> bool {
        self.watchdog.is_some()
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Take the reason the channel was lost, if it was lost since the last
    /// call. The supervisor reports it and arms reconnection.
    pub(crate) fn take_loss(&mut self) -> Option<ChannelLoss> {
        self.loss.take()
    }

    /// Bind a freshly opened channel and start serving the queue.
    pub(crate) fn attach(&mut self, mut channel: Box<dyn Channel>, now: Instant) {
        if let Err(e) = channel.clear_input() {
            warn!("failed to clear input buffer on open: {}", e);
        }
        self.channel = Some(channel);
        self.advance(now);
    }

    /// Drop the channel handle without touching queued work.
    pub(crate) fn detach(&mut self) -> Option<Box<dyn Channel>> {
        self.channel.take()
    }

    /// Queue a command. When the engine is idle it is written immediately.
    pub(crate) fn submit(&mut self, entry: CommandEntry, prepend: bool, now: Instant) {
        if self.channel.is_none() {
            entry.reject(DriverError::Disconnected);
            return;
        }
        if prepend {
            self.queue.push_front(entry);
        } else {
            self.queue.push_back(entry);
        }
        if self.state == EngineState::Idle {
            self.advance(now);
        }
    }

    /// Pop and serve the next queued entry while idle. Dequeue attempts with
    /// no channel fail each head with `Disconnected`.
    fn advance(&mut self, now: Instant) {
        while self.state == EngineState::Idle {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };

            let Some(channel) = self.channel.as_mut() else {
                entry.reject(DriverError::Disconnected);
                continue;
            };

            let result = channel.write_all(&entry.bytes).and_then(|_| channel.flush());

            match result {
                Ok(()) => {
                    if self.debug {
                        debug!("tx {} bytes: {:02x?}", entry.bytes.len(), entry.bytes);
                    }
                    self.current = Some(entry);
                    self.state = EngineState::Sending;
                    self.arm_watchdog(now);
                }
                Err(e) => {
                    warn!("write failed, dropping channel: {}", e);
                    entry.reject(DriverError::Disconnected);
                    self.channel = None;
                    self.loss = Some(ChannelLoss::Error(e.to_string()));
                    // Remaining entries drain through the no-channel branch.
                }
            }
        }
    }

    /// Read whatever the channel has pending and decode it.
    pub(crate) fn poll_io(&mut self, now: Instant) {
        let Some(channel) = self.channel.as_mut() else {
            return;
        };

        let available = match channel.bytes_to_read() {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                self.lose_channel(ChannelLoss::Eof, now);
                return;
            }
            Err(e) => {
                self.lose_channel(ChannelLoss::Error(e.to_string()), now);
                return;
            }
        };
        if available == 0 {
            return;
        }

        let mut buf = vec![0u8; (available as usize).min(4096)];
        match channel.read(&mut buf) {
            Ok(0) => self.lose_channel(ChannelLoss::Eof, now),
            Ok(n) => {
                buf.truncate(n);
                self.on_data(&buf, now);
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => self.lose_channel(ChannelLoss::Error(e.to_string()), now),
        }
    }

    /// Decode one inbound buffer completely, possibly completing several
    /// entries.
    pub(crate) fn on_data(&mut self, data: &[u8], now: Instant) {
        if self.debug {
            debug!("rx {} bytes: {:02x?}", data.len(), data);
        }

        for (i, &byte) in data.iter().enumerate() {
            match self.state {
                EngineState::Idle => {
                    warn!(
                        "discarding {} byte(s) received with no command in flight",
                        data.len() - i
                    );
                    return;
                }
                EngineState::Sending => {
                    self.arm_watchdog(now);
                    self.on_sending_byte(byte, now);
                }
                EngineState::Reading => {
                    self.arm_watchdog(now);
                    self.on_reading_byte(byte, now);
                }
            }
        }
    }

    fn on_sending_byte(&mut self, byte: u8, now: Instant) {
        match byte {
            RESPONSE_OK => self.finish_current(Response::Ok, now),
            RESPONSE_SEND_INPUT => self.finish_current(Response::SendInput, now),
            RESPONSE_REJECTED => self.finish_current(Response::Rejected, now),
            RESPONSE_OUTPUT => {
                self.state = EngineState::Reading;
            }
            RESPONSE_WAIT_USER_CONFIRM => {
                debug!("device waiting for user confirmation");
                self.events.emit(DeviceEvent::WaitUserConfirm);
            }
            RESPONSE_LOCKED => {
                warn!(
                    "device reported locked ({} command(s) pending)",
                    self.queue.len() + 1
                );
                self.events.emit(DeviceEvent::Locked);
                if self.reject_on_locked {
                    if let Some(entry) = self.current.take() {
                        entry.reject(DriverError::Locked);
                    }
                    for entry in self.queue.drain() {
                        entry.reject(DriverError::Locked);
                    }
                    self.state = EngineState::Idle;
                    self.watchdog = None;
                }
            }
            byte => {
                let error = match DeviceError::from_byte(byte) {
                    Some(device_error) => DriverError::Device(device_error),
                    None => DriverError::UnknownResponse(byte),
                };
                self.fail_current(error, now);
            }
        }
    }

    fn on_reading_byte(&mut self, byte: u8, now: Instant) {
        let Some(entry) = self.current.as_mut() else {
            warn!("reading output with no command in flight");
            self.state = EngineState::Idle;
            self.watchdog = None;
            return;
        };

        if entry.esc_pending {
            entry.esc_pending = false;
            entry.output_buffer.push(byte);
        } else if byte == RESPONSE_ESC_SEQUENCE {
            entry.esc_pending = true;
        } else if byte == RESPONSE_OUTPUT_END {
            if let Some(entry) = self.current.take() {
                entry.complete_output();
            }
            self.state = EngineState::Idle;
            self.watchdog = None;
            self.advance(now);
        } else {
            entry.output_buffer.push(byte);
        }
    }

    fn finish_current(&mut self, response: Response, now: Instant) {
        if let Some(entry) = self.current.take() {
            entry.resolve(response);
        }
        self.state = EngineState::Idle;
        self.watchdog = None;
        self.advance(now);
    }

    fn fail_current(&mut self, error: DriverError, now: Instant) {
        if let Some(entry) = self.current.take() {
            entry.reject(error);
        }
        self.state = EngineState::Idle;
        self.watchdog = None;
        self.advance(now);
    }

    /// Fail the head with `WatchdogTimeout` if the deadline has passed.
    pub(crate) fn check_watchdog(&mut self, now: Instant) {
        if let Some(deadline) = self.watchdog {
            if now >= deadline {
                warn!("watchdog expired with no response from device");
                self.fail_current(DriverError::WatchdogTimeout, now);
            }
        }
    }

    /// Fail everything pending with `Cleared` and return to idle. The caller
    /// releases the lock layer.
    pub(crate) fn clear(&mut self) {
        self.watchdog = None;
        if !self.queue.is_empty() || self.current.is_some() {
            debug!(
                "clearing {} pending command(s)",
                self.queue.len() + usize::from(self.current.is_some())
            );
        }
        if let Some(entry) = self.current.take() {
            entry.reject(DriverError::Cleared);
        }
        for entry in self.queue.drain() {
            entry.reject(DriverError::Cleared);
        }
        self.state = EngineState::Idle;
    }

    fn lose_channel(&mut self, loss: ChannelLoss, now: Instant) {
        self.channel = None;
        self.loss = Some(loss);
        if let Some(entry) = self.current.take() {
            entry.reject(DriverError::Disconnected);
        }
        self.state = EngineState::Idle;
        self.watchdog = None;
        // Drain queued entries through the no-channel dequeue path.
        self.advance(now);
    }

    fn arm_watchdog(&mut self, now: Instant) {
        self.watchdog = Some(now + self.watchdog_timeout);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{completion, Completion};
    use crate::response::is_control_byte;
    use std::collections::VecDeque;
    use std::sync::mpsc::Receiver;
    use std::sync::{Arc, Mutex};

    /// Scriptable channel: engine writes are recorded, inbound bytes are
    /// handed out as they become "available".
    struct MockChannel {
        inbound: Arc<Mutex<VecDeque<u8>>>,
        written: Arc<Mutex<Vec<u8>>>,
        fail_reads: bool,
    }

    impl io::Read for MockChannel {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.fail_reads {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            let mut inbound = self.inbound.lock().unwrap();
            let n = buf.len().min(inbound.len());
            for slot in buf.iter_mut().take(n) {
                *slot = inbound.pop_front().unwrap();
            }
            if n == 0 {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"))
            } else {
                Ok(n)
            }
        }
    }

    impl io::Write for MockChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Channel for MockChannel {
        fn bytes_to_read(&mut self) -> io::Result<u32> {
            if self.fail_reads {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
            }
            Ok(self.inbound.lock().unwrap().len() as u32)
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.inbound.lock().unwrap().clear();
            Ok(())
        }
    }

    struct Rig {
        engine: Engine,
        events: Receiver<DeviceEvent>,
        written: Arc<Mutex<Vec<u8>>>,
        inbound: Arc<Mutex<VecDeque<u8>>>,
        now: Instant,
    }

    fn rig(reject_on_locked: bool) -> Rig {
        let sink = EventSink::new();
        let events = sink.subscribe();
        let mut engine = Engine::new(reject_on_locked, false, sink);
        let written = Arc::new(Mutex::new(Vec::new()));
        let inbound = Arc::new(Mutex::new(VecDeque::new()));
        let now = Instant::now();
        engine.attach(
            Box::new(MockChannel {
                inbound: inbound.clone(),
                written: written.clone(),
                fail_reads: false,
            }),
            now,
        );
        Rig {
            engine,
            events,
            written,
            inbound,
            now,
        }
    }

    impl Rig {
        fn submit(&mut self, bytes: &[u8]) -> Completion<Response> {
            let (resolver, comp) = completion();
            self.engine
                .submit(CommandEntry::new(bytes.to_vec(), resolver), false, self.now);
            comp
        }

        fn submit_prepend(&mut self, bytes: &[u8]) -> Completion<Response> {
            let (resolver, comp) = completion();
            self.engine
                .submit(CommandEntry::new(bytes.to_vec(), resolver), true, self.now);
            comp
        }

        fn feed(&mut self, data: &[u8]) {
            self.engine.on_data(data, self.now);
        }

        fn written(&self) -> Vec<u8> {
            self.written.lock().unwrap().clone()
        }
    }

    // -- single-byte responses ---------------------------------------------

    #[test]
    fn test_ok_resolves_head() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x02]);
        assert_eq!(rig.engine.state(), EngineState::Sending);
        assert_eq!(rig.written(), vec![0x02]);

        rig.feed(&[RESPONSE_OK]);
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Ok);
        assert_eq!(rig.engine.state(), EngineState::Idle);
        assert!(!rig.engine.watchdog_armed());
    }

    #[test]
    fn test_send_input_and_rejected_resolve_head() {
        let mut rig = rig(false);
        let a = rig.submit(&[0x0a]);
        rig.feed(&[RESPONSE_SEND_INPUT]);
        assert_eq!(a.try_wait().unwrap().unwrap(), Response::SendInput);

        let b = rig.submit(&[0x0a]);
        rig.feed(&[RESPONSE_REJECTED]);
        assert_eq!(b.try_wait().unwrap().unwrap(), Response::Rejected);
    }

    #[test]
    fn test_device_error_byte_rejects_head() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x02]);
        rig.feed(&[254]);
        match comp.try_wait().unwrap() {
            Err(DriverError::Device(DeviceError::NotInitialized)) => {}
            other => panic!("expected NotInitialized, got {other:?}"),
        }
        assert_eq!(rig.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_unknown_byte_rejects_head() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x02]);
        rig.feed(&[0x7f]);
        match comp.try_wait().unwrap() {
            Err(DriverError::UnknownResponse(0x7f)) => {}
            other => panic!("expected UnknownResponse, got {other:?}"),
        }
    }

    // -- output records ----------------------------------------------------

    #[test]
    fn test_output_roundtrip_with_escape() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x1e]);
        // 0x06 escapes the following 0x05; the final 0x05 terminates.
        rig.feed(&[
            RESPONSE_OUTPUT,
            0xaa,
            RESPONSE_ESC_SEQUENCE,
            0x05,
            0xbb,
            RESPONSE_OUTPUT_END,
        ]);
        assert_eq!(
            comp.try_wait().unwrap().unwrap(),
            Response::Output(vec![0xaa, 0x05, 0xbb])
        );
        assert_eq!(rig.engine.state(), EngineState::Idle);
    }

    #[test]
    fn test_escaped_escape_byte_is_literal() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x1e]);
        rig.feed(&[
            RESPONSE_OUTPUT,
            RESPONSE_ESC_SEQUENCE,
            RESPONSE_ESC_SEQUENCE,
            RESPONSE_OUTPUT_END,
        ]);
        assert_eq!(
            comp.try_wait().unwrap().unwrap(),
            Response::Output(vec![RESPONSE_ESC_SEQUENCE])
        );
    }

    #[test]
    fn test_non_control_bytes_append_unescaped() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x1e]);
        rig.feed(&[RESPONSE_OUTPUT, 0x00, 0x07, 0xf0, RESPONSE_OUTPUT_END]);
        assert_eq!(
            comp.try_wait().unwrap().unwrap(),
            Response::Output(vec![0x00, 0x07, 0xf0])
        );
    }

    fn encode_output(payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![RESPONSE_OUTPUT];
        for &byte in payload {
            if is_control_byte(byte) {
                frame.push(RESPONSE_ESC_SEQUENCE);
            }
            frame.push(byte);
        }
        frame.push(RESPONSE_OUTPUT_END);
        frame
    }

    #[test]
    fn test_escape_encoding_roundtrip() {
        let payloads: Vec<Vec<u8>> = vec![
            vec![],
            vec![0x05],
            vec![0x06, 0x06, 0x05],
            (0..=255u8).collect(),
            vec![0xff, 0x01, 0x04, 0x0a, 0x0b, 0xf6, 0x42],
        ];
        for payload in payloads {
            let mut rig = rig(false);
            let comp = rig.submit(&[0x1e]);
            rig.feed(&encode_output(&payload));
            assert_eq!(
                comp.try_wait().unwrap().unwrap(),
                Response::Output(payload.clone()),
                "payload {payload:02x?} did not survive the roundtrip"
            );
        }
    }

    #[test]
    fn test_chunk_splitting_does_not_alter_outcome() {
        // One OK response and one escaped output response, for two commands.
        let stream: Vec<u8> = {
            let mut s = vec![RESPONSE_OK];
            s.extend_from_slice(&encode_output(&[0xaa, 0x05, 0x06]));
            s
        };

        // Feed the stream whole, bytewise, and split at every boundary.
        let mut splits: Vec<Vec<Vec<u8>>> = vec![
            vec![stream.clone()],
            stream.iter().map(|&b| vec![b]).collect(),
        ];
        for cut in 1..stream.len() {
            splits.push(vec![stream[..cut].to_vec(), stream[cut..].to_vec()]);
        }

        for chunks in splits {
            let mut rig = rig(false);
            let a = rig.submit(&[0x02]);
            let b = rig.submit(&[0x1e]);
            for chunk in &chunks {
                rig.feed(chunk);
            }
            assert_eq!(a.try_wait().unwrap().unwrap(), Response::Ok);
            assert_eq!(
                b.try_wait().unwrap().unwrap(),
                Response::Output(vec![0xaa, 0x05, 0x06])
            );
            assert_eq!(rig.engine.state(), EngineState::Idle);
        }
    }

    // -- queue discipline --------------------------------------------------

    #[test]
    fn test_fifo_order_on_the_wire() {
        let mut rig = rig(false);
        let a = rig.submit(&[0x01]);
        let b = rig.submit(&[0x02]);
        let c = rig.submit(&[0x03]);

        // Only the head is written until it completes.
        assert_eq!(rig.written(), vec![0x01]);
        rig.feed(&[RESPONSE_OK]);
        assert_eq!(rig.written(), vec![0x01, 0x02]);
        rig.feed(&[RESPONSE_OK]);
        assert_eq!(rig.written(), vec![0x01, 0x02, 0x03]);
        rig.feed(&[RESPONSE_OK]);

        for comp in [a, b, c] {
            assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Ok);
        }
    }

    #[test]
    fn test_prepend_jumps_queue_but_not_head() {
        let mut rig = rig(false);
        let _a = rig.submit(&[0x01]);
        let _b = rig.submit(&[0x02]);
        let _cancel = rig.submit_prepend(&[100]);

        // A is in flight; the prepend must not displace it.
        assert_eq!(rig.written(), vec![0x01]);
        rig.feed(&[RESPONSE_OK]);
        // The prepended cancel goes out before B.
        assert_eq!(rig.written(), vec![0x01, 100]);
        rig.feed(&[RESPONSE_OK]);
        assert_eq!(rig.written(), vec![0x01, 100, 0x02]);
    }

    #[test]
    fn test_pipelined_responses_in_one_buffer() {
        let mut rig = rig(false);
        let a = rig.submit(&[0x02]);
        let b = rig.submit(&[0x02]);

        rig.feed(&[RESPONSE_OK, RESPONSE_SEND_INPUT]);
        assert_eq!(a.try_wait().unwrap().unwrap(), Response::Ok);
        assert_eq!(b.try_wait().unwrap().unwrap(), Response::SendInput);
        assert_eq!(rig.engine.state(), EngineState::Idle);
        assert_eq!(rig.engine.queue_len(), 0);
    }

    #[test]
    fn test_idle_bytes_are_discarded() {
        let mut rig = rig(false);
        rig.feed(&[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(rig.engine.state(), EngineState::Idle);

        // The engine still works afterwards.
        let comp = rig.submit(&[0x02]);
        rig.feed(&[RESPONSE_OK]);
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Ok);
    }

    // -- observer bytes ----------------------------------------------------

    #[test]
    fn test_wait_user_confirm_keeps_head_in_flight() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x28]);
        rig.feed(&[RESPONSE_WAIT_USER_CONFIRM]);

        assert_eq!(rig.events.try_recv().unwrap(), DeviceEvent::WaitUserConfirm);
        assert!(comp.try_wait().is_none());
        assert_eq!(rig.engine.state(), EngineState::Sending);

        rig.feed(&[RESPONSE_OUTPUT, 0xde, 0xad, RESPONSE_OUTPUT_END]);
        assert_eq!(
            comp.try_wait().unwrap().unwrap(),
            Response::Output(vec![0xde, 0xad])
        );
    }

    #[test]
    fn test_locked_permissive_continues() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x02]);
        rig.feed(&[RESPONSE_LOCKED, RESPONSE_OK]);

        assert_eq!(rig.events.try_recv().unwrap(), DeviceEvent::Locked);
        assert!(rig.events.try_recv().is_err());
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Ok);
    }

    #[test]
    fn test_locked_strict_fails_everything() {
        let mut rig = rig(true);
        let a = rig.submit(&[0x02]);
        let b = rig.submit(&[0x02]);
        let c = rig.submit(&[0x02]);

        rig.feed(&[RESPONSE_LOCKED]);
        for comp in [a, b, c] {
            assert!(matches!(comp.try_wait().unwrap(), Err(DriverError::Locked)));
        }
        assert_eq!(rig.engine.state(), EngineState::Idle);
        assert!(!rig.engine.watchdog_armed());

        // Exactly one locked event per LOCKED byte observed.
        assert_eq!(rig.events.try_recv().unwrap(), DeviceEvent::Locked);
        assert!(rig.events.try_recv().is_err());
    }

    #[test]
    fn test_locked_event_per_byte() {
        let mut rig = rig(false);
        let _comp = rig.submit(&[0x02]);
        rig.feed(&[RESPONSE_LOCKED, RESPONSE_LOCKED]);
        assert_eq!(rig.events.try_recv().unwrap(), DeviceEvent::Locked);
        assert_eq!(rig.events.try_recv().unwrap(), DeviceEvent::Locked);
        assert!(rig.events.try_recv().is_err());
    }

    // -- watchdog ----------------------------------------------------------

    #[test]
    fn test_watchdog_armed_only_while_busy() {
        let mut rig = rig(false);
        assert!(!rig.engine.watchdog_armed());

        let comp = rig.submit(&[0x02]);
        assert!(rig.engine.watchdog_armed());

        rig.feed(&[RESPONSE_OUTPUT]);
        assert!(rig.engine.watchdog_armed());
        assert_eq!(rig.engine.state(), EngineState::Reading);

        rig.feed(&[0xaa, RESPONSE_OUTPUT_END]);
        assert!(!rig.engine.watchdog_armed());
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Output(vec![0xaa]));
    }

    #[test]
    fn test_watchdog_expiry_fails_head_and_recovers() {
        let mut rig = rig(false);
        rig.engine.set_watchdog_timeout(Duration::from_millis(10));
        let comp = rig.submit(&[0x02]);

        rig.engine.check_watchdog(rig.now + Duration::from_millis(5));
        assert!(comp.try_wait().is_none());

        rig.engine.check_watchdog(rig.now + Duration::from_millis(20));
        assert!(matches!(
            comp.try_wait().unwrap(),
            Err(DriverError::WatchdogTimeout)
        ));
        assert_eq!(rig.engine.state(), EngineState::Idle);

        // The next submission proceeds normally.
        let next = rig.submit(&[0x02]);
        rig.feed(&[RESPONSE_OK]);
        assert_eq!(next.try_wait().unwrap().unwrap(), Response::Ok);
    }

    #[test]
    fn test_inbound_bytes_push_watchdog_forward() {
        let mut rig = rig(false);
        rig.engine.set_watchdog_timeout(Duration::from_millis(10));
        let comp = rig.submit(&[0x28]);

        // Progress bytes arrive just before each deadline.
        let t1 = rig.now + Duration::from_millis(8);
        rig.engine.on_data(&[RESPONSE_WAIT_USER_CONFIRM], t1);
        rig.engine.check_watchdog(rig.now + Duration::from_millis(12));
        assert!(comp.try_wait().is_none(), "confirm byte should reset the deadline");

        let t2 = t1 + Duration::from_millis(8);
        rig.engine.on_data(&[RESPONSE_OUTPUT], t2);
        rig.engine.check_watchdog(t1 + Duration::from_millis(12));
        assert!(comp.try_wait().is_none());

        rig.engine.on_data(&[0x42, RESPONSE_OUTPUT_END], t2);
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Output(vec![0x42]));
    }

    #[test]
    fn test_watchdog_expiry_advances_queue() {
        let mut rig = rig(false);
        rig.engine.set_watchdog_timeout(Duration::from_millis(10));
        let a = rig.submit(&[0x01]);
        let b = rig.submit(&[0x02]);

        rig.engine.check_watchdog(rig.now + Duration::from_millis(20));
        assert!(matches!(a.try_wait().unwrap(), Err(DriverError::WatchdogTimeout)));

        // B was written after A timed out and can still complete.
        assert_eq!(rig.written(), vec![0x01, 0x02]);
        rig.feed(&[RESPONSE_OK]);
        assert_eq!(b.try_wait().unwrap().unwrap(), Response::Ok);
    }

    // -- clear and channel loss --------------------------------------------

    #[test]
    fn test_clear_fails_everything_with_cleared() {
        let mut rig = rig(false);
        let a = rig.submit(&[0x01]);
        let b = rig.submit(&[0x02]);

        rig.engine.clear();
        assert!(matches!(a.try_wait().unwrap(), Err(DriverError::Cleared)));
        assert!(matches!(b.try_wait().unwrap(), Err(DriverError::Cleared)));
        assert_eq!(rig.engine.state(), EngineState::Idle);
        assert_eq!(rig.engine.queue_len(), 0);
        assert!(!rig.engine.watchdog_armed());
    }

    #[test]
    fn test_submit_without_channel_fails_disconnected() {
        let sink = EventSink::new();
        let mut engine = Engine::new(false, false, sink);
        let (resolver, comp) = completion();
        engine.submit(
            CommandEntry::new(vec![0x02], resolver),
            false,
            Instant::now(),
        );
        assert!(matches!(
            comp.try_wait().unwrap(),
            Err(DriverError::Disconnected)
        ));
    }

    #[test]
    fn test_read_failure_fails_in_flight_and_queued() {
        let mut rig = rig(false);
        // Replace the channel with one that fails reads.
        rig.engine.detach();
        rig.engine.attach(
            Box::new(MockChannel {
                inbound: rig.inbound.clone(),
                written: rig.written.clone(),
                fail_reads: true,
            }),
            rig.now,
        );

        let a = rig.submit(&[0x01]);
        let b = rig.submit(&[0x02]);
        rig.engine.poll_io(rig.now);

        assert!(matches!(a.try_wait().unwrap(), Err(DriverError::Disconnected)));
        assert!(matches!(b.try_wait().unwrap(), Err(DriverError::Disconnected)));
        assert!(!rig.engine.is_open());
        assert!(matches!(
            rig.engine.take_loss(),
            Some(ChannelLoss::Error(_))
        ));
    }

    #[test]
    fn test_poll_io_decodes_pending_bytes() {
        let mut rig = rig(false);
        let comp = rig.submit(&[0x02]);
        rig.inbound.lock().unwrap().extend([RESPONSE_OK]);
        rig.engine.poll_io(rig.now);
        assert_eq!(comp.try_wait().unwrap().unwrap(), Response::Ok);
    }
}
