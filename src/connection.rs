//! One bus connection, driven by a host loop.
//!
//! zbus does the socket work: address resolution, authentication,
//! framing and serials. A reader thread moves every received message
//! into a queue and pokes a wake socket; the host loop watches that
//! socket and hands queued messages out through [`Connection::dispatch`],
//! one per call. Replies go to the notifier registered on their
//! [`PendingCall`], everything else goes to the message filter.
//!
//! The [`ConnectionHooks`] trait is how the connection asks its driver
//! for watches and timeouts (see [`crate::closure::MainLoopClosure`]).
//! Synchronous callers can block on a single reply with
//! [`PendingCall::block`]; other messages stay queued for later dispatch.

use crate::error::{DbusError, Result};
use crate::message::{Message, MessageExt};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};
use zbus::blocking::MessageIterator;

/// Invoked once with the reply of a pending call. Remote errors arrive as
/// `Ok` error messages; `Err` means no reply will come (timeout,
/// disconnect).
pub type ReplyHandler = Box<dyn FnOnce(Result<Message>) + Send>;

/// Receives every dispatched message that is not a tracked reply.
pub type MessageFilter = Arc<dyn Fn(&Message) + Send + Sync>;

/// Runs from [`Connection::dispatch`] once the peer is gone.
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

const WAKE_DRAIN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchStatus {
    DataRemains,
    Complete,
}

/// A descriptor the connection wants the host loop to monitor.
#[derive(Debug)]
pub struct Watch {
    id: u64,
    fd: RawFd,
    readable: bool,
    writable: bool,
    enabled: AtomicBool,
}

impl Watch {
    fn new(id: u64, fd: RawFd, readable: bool, writable: bool) -> Self {
        Self {
            id,
            fd,
            readable,
            writable,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// A reply deadline the connection wants the host loop to time.
#[derive(Debug)]
pub struct Timeout {
    id: u64,
    interval: Duration,
    enabled: AtomicBool,
}

impl Timeout {
    fn new(id: u64, interval: Duration) -> Self {
        Self {
            id,
            interval,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn interval_ms(&self) -> u32 {
        self.interval.as_millis().min(u32::MAX as u128) as u32
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

/// Requests a connection makes of whoever drives it.
///
/// Hooks are never invoked while connection locks are held.
pub trait ConnectionHooks: Send + Sync {
    fn add_watch(&self, watch: &Arc<Watch>) -> bool;
    fn remove_watch(&self, watch: &Arc<Watch>);
    fn toggle_watch(&self, watch: &Arc<Watch>);
    fn add_timeout(&self, timeout: &Arc<Timeout>) -> bool;
    fn remove_timeout(&self, timeout: &Arc<Timeout>);
    fn toggle_timeout(&self, timeout: &Arc<Timeout>);
    fn dispatch_status_changed(&self, status: DispatchStatus);
    fn wakeup_main(&self);
}

struct PendingEntry {
    deadline: Instant,
    timeout: Arc<Timeout>,
    notify: Option<ReplyHandler>,
    outcome: Option<Result<Message>>,
}

enum Incoming {
    Message(Message),
    /// A pending call that will never get its reply.
    Failed(u32, DbusError),
    Disconnected,
}

impl Incoming {
    fn answers(&self, serial: u32) -> bool {
        match self {
            Incoming::Message(message) => message.is_reply() && message.reply_to() == Some(serial),
            Incoming::Failed(failed, _) => *failed == serial,
            Incoming::Disconnected => false,
        }
    }

    fn into_outcome(self) -> Result<Message> {
        match self {
            Incoming::Message(message) => Ok(message),
            Incoming::Failed(_, err) => Err(err),
            Incoming::Disconnected => Err(DbusError::ConnectionUnavailable("connection closed".to_string())),
        }
    }
}

struct ConnectionState {
    incoming: VecDeque<Incoming>,
    pending: HashMap<u32, PendingEntry>,
    connected: bool,
}

impl ConnectionState {
    fn take_outcome(&mut self, serial: u32) -> Option<Result<Message>> {
        let index = self.incoming.iter().position(|item| item.answers(serial))?;
        self.incoming.remove(index).map(Incoming::into_outcome)
    }
}

enum Delivery {
    Notify(ReplyHandler, Arc<Timeout>, Result<Message>),
    Filter(Message),
    Disconnected,
    Stored,
}

pub struct Connection {
    bus: zbus::blocking::Connection,
    state: Mutex<ConnectionState>,
    arrived: Condvar,
    hooks: Mutex<Option<Arc<dyn ConnectionHooks>>>,
    filter: Mutex<Option<MessageFilter>>,
    on_disconnect: Mutex<Option<DisconnectHandler>>,
    wake: UnixStream,
    read_watch: Arc<Watch>,
    next_handle_id: AtomicU64,
}

impl Connection {
    /// Take over an established zbus connection and start reading from it.
    pub fn new(bus: zbus::blocking::Connection) -> Result<Arc<Connection>> {
        let (wake, waker) = UnixStream::pair()?;
        wake.set_nonblocking(true)?;
        waker.set_nonblocking(true)?;
        // Subscribe before anything is sent so no reply can slip past.
        let messages = MessageIterator::from(&bus);

        let connection = Arc::new(Connection {
            read_watch: Arc::new(Watch::new(1, wake.as_raw_fd(), true, false)),
            bus,
            state: Mutex::new(ConnectionState {
                incoming: VecDeque::new(),
                pending: HashMap::new(),
                connected: true,
            }),
            arrived: Condvar::new(),
            hooks: Mutex::new(None),
            filter: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            wake,
            next_handle_id: AtomicU64::new(2),
        });

        let weak = Arc::downgrade(&connection);
        thread::Builder::new()
            .name("gadget-dbus-reader".to_string())
            .spawn(move || read_messages(weak, messages, waker))?;
        debug!(unique_name = ?connection.unique_name(), "Bus connection ready");
        Ok(connection)
    }

    pub fn unique_name(&self) -> Option<String> {
        self.bus.unique_name().map(|name| name.to_string())
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    fn hooks(&self) -> Option<Arc<dyn ConnectionHooks>> {
        self.hooks.lock().clone()
    }

    fn next_id(&self) -> u64 {
        self.next_handle_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Install (or with `None`, detach) the driver of this connection.
    pub fn set_hooks(&self, hooks: Option<Arc<dyn ConnectionHooks>>) {
        let previous = std::mem::replace(&mut *self.hooks.lock(), hooks.clone());
        let timeouts: Vec<Arc<Timeout>> = self
            .state
            .lock()
            .pending
            .values()
            .map(|entry| entry.timeout.clone())
            .collect();

        if let Some(previous) = previous {
            previous.remove_watch(&self.read_watch);
            for timeout in &timeouts {
                previous.remove_timeout(timeout);
            }
        }

        if let Some(hooks) = hooks {
            if !hooks.add_watch(&self.read_watch) {
                warn!(fd = self.read_watch.fd(), "Host loop refused the bus read watch");
            }
            for timeout in timeouts.iter().filter(|t| t.is_enabled()) {
                hooks.add_timeout(timeout);
            }
            if self.dispatch_status() == DispatchStatus::DataRemains {
                hooks.dispatch_status_changed(DispatchStatus::DataRemains);
            }
        }
    }

    pub fn set_filter(&self, filter: Option<MessageFilter>) {
        *self.filter.lock() = filter;
    }

    pub fn set_disconnect_handler(&self, handler: Option<DisconnectHandler>) {
        *self.on_disconnect.lock() = handler;
    }

    fn write_message(&self, message: &Message) -> Result<()> {
        trace!(
            serial = message.serial_number(),
            kind = ?message.message_type(),
            member = ?message.member_name(),
            "Sending message"
        );
        self.bus
            .send(message)
            .map_err(|err| DbusError::ConnectionUnavailable(err.to_string()))?;
        if let Some(hooks) = self.hooks() {
            hooks.wakeup_main();
        }
        Ok(())
    }

    /// Send a message that expects no reply. Returns its serial.
    pub fn send(&self, message: &Message) -> Result<u32> {
        if !self.is_connected() {
            return Err(DbusError::ConnectionUnavailable("connection closed".to_string()));
        }
        self.write_message(message)?;
        Ok(message.serial_number())
    }

    /// Send a message and track its reply for at most `timeout`.
    pub fn send_with_reply(self: &Arc<Self>, message: &Message, timeout: Duration) -> Result<PendingCall> {
        let serial = message.serial_number();
        let deadline = Arc::new(Timeout::new(self.next_id(), timeout));
        {
            let mut state = self.state.lock();
            if !state.connected {
                return Err(DbusError::ConnectionUnavailable("connection closed".to_string()));
            }
            state.pending.insert(
                serial,
                PendingEntry {
                    deadline: Instant::now() + timeout,
                    timeout: deadline.clone(),
                    notify: None,
                    outcome: None,
                },
            );
        }
        if let Err(err) = self.write_message(message) {
            self.state.lock().pending.remove(&serial);
            return Err(err);
        }
        if let Some(hooks) = self.hooks() {
            hooks.add_timeout(&deadline);
        }
        Ok(PendingCall {
            serial,
            connection: Arc::downgrade(self),
        })
    }

    fn forget(&self, entry: Option<PendingEntry>) {
        if let (Some(entry), Some(hooks)) = (entry, self.hooks()) {
            hooks.remove_timeout(&entry.timeout);
        }
    }

    fn notify_if_queued(&self) {
        if self.dispatch_status() == DispatchStatus::DataRemains {
            if let Some(hooks) = self.hooks() {
                hooks.dispatch_status_changed(DispatchStatus::DataRemains);
            }
        }
    }

    fn set_notify(&self, serial: u32, notify: ReplyHandler) -> std::result::Result<(), ReplyHandler> {
        let stored = {
            let mut state = self.state.lock();
            let Some(entry) = state.pending.get_mut(&serial) else {
                return Err(notify);
            };
            match entry.outcome.take() {
                Some(outcome) => state.pending.remove(&serial).map(|entry| (entry, outcome)),
                None => {
                    entry.notify = Some(notify);
                    return Ok(());
                }
            }
        };
        // The reply was dispatched before anyone listened: requeue it so
        // the notifier still runs from dispatch.
        if let Some((entry, outcome)) = stored {
            let requeued = match outcome {
                Ok(message) => Incoming::Message(message),
                Err(err) => Incoming::Failed(serial, err),
            };
            let mut state = self.state.lock();
            state.pending.insert(
                serial,
                PendingEntry {
                    notify: Some(notify),
                    outcome: None,
                    ..entry
                },
            );
            state.incoming.push_front(requeued);
        }
        self.notify_if_queued();
        Ok(())
    }

    fn cancel(&self, serial: u32) -> bool {
        let entry = self.state.lock().pending.remove(&serial);
        let found = entry.is_some();
        self.forget(entry);
        found
    }

    fn is_pending(&self, serial: u32) -> bool {
        self.state.lock().pending.contains_key(&serial)
    }

    fn block_for_reply(&self, serial: u32) -> Result<Message> {
        let mut state = self.state.lock();
        loop {
            let stored = state.pending.get_mut(&serial).and_then(|entry| entry.outcome.take());
            if let Some(outcome) = stored.or_else(|| state.take_outcome(serial)) {
                let entry = state.pending.remove(&serial);
                drop(state);
                self.forget(entry);
                self.notify_if_queued();
                return outcome;
            }
            let deadline = match state.pending.get(&serial) {
                None => return Err(DbusError::CallCancelled),
                Some(entry) => entry.deadline,
            };
            if Instant::now() >= deadline {
                let entry = state.pending.remove(&serial);
                drop(state);
                self.forget(entry);
                self.notify_if_queued();
                return Err(DbusError::Timeout(format!("no reply to serial {}", serial)));
            }
            self.arrived.wait_until(&mut state, deadline);
        }
    }

    fn enqueue(&self, item: Incoming) {
        self.state.lock().incoming.push_back(item);
        self.arrived.notify_all();
    }

    /// The peer is gone: fail every pending call and report the loss.
    fn lost(&self) {
        {
            let mut state = self.state.lock();
            if !state.connected {
                return;
            }
            state.connected = false;
            let serials: Vec<u32> = state.pending.keys().copied().collect();
            for serial in serials {
                state.incoming.push_back(Incoming::Failed(
                    serial,
                    DbusError::ConnectionUnavailable(
                        "Connection was disconnected before a reply was received".to_string(),
                    ),
                ));
            }
            state.incoming.push_back(Incoming::Disconnected);
        }
        debug!("Bus connection lost");
        self.arrived.notify_all();
    }

    /// Service a readiness report for one of this connection's watches.
    pub fn handle_watch(&self, watch: &Watch, readable: bool) {
        if !(watch.is_readable() && readable) {
            return;
        }
        let mut buf = [0u8; WAKE_DRAIN];
        let closed = loop {
            match (&self.wake).read(&mut buf) {
                Ok(0) => break true,
                Ok(_) => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break false,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "Wake socket failed");
                    break true;
                }
            }
        };
        if closed && self.read_watch.is_enabled() {
            self.read_watch.set_enabled(false);
            if let Some(hooks) = self.hooks() {
                hooks.toggle_watch(&self.read_watch);
            }
        }
        self.notify_if_queued();
    }

    /// Service an expired reply deadline.
    pub fn handle_timeout(&self, timeout: &Arc<Timeout>) {
        let expired = {
            let mut state = self.state.lock();
            let serial = state
                .pending
                .iter()
                .find(|(_, entry)| entry.timeout.id == timeout.id)
                .map(|(serial, _)| *serial);
            if let Some(serial) = serial {
                debug!(serial, "Reply timed out");
                state.incoming.push_back(Incoming::Failed(
                    serial,
                    DbusError::Timeout("Did not receive a reply before the timeout expired".to_string()),
                ));
            }
            serial.is_some()
        };
        timeout.set_enabled(false);
        if let Some(hooks) = self.hooks() {
            if expired {
                hooks.toggle_timeout(timeout);
                hooks.dispatch_status_changed(DispatchStatus::DataRemains);
            } else {
                hooks.remove_timeout(timeout);
            }
        }
    }

    pub fn dispatch_status(&self) -> DispatchStatus {
        if self.state.lock().incoming.is_empty() {
            DispatchStatus::Complete
        } else {
            DispatchStatus::DataRemains
        }
    }

    /// Deliver one queued message.
    pub fn dispatch(&self) -> DispatchStatus {
        let delivery = {
            let mut state = self.state.lock();
            let Some(item) = state.incoming.pop_front() else {
                return DispatchStatus::Complete;
            };
            let serial = match &item {
                Incoming::Message(message) if message.is_reply() => message.reply_to(),
                Incoming::Failed(serial, _) => Some(*serial),
                _ => None,
            };
            let tracked = serial.and_then(|serial| {
                state
                    .pending
                    .get(&serial)
                    .map(|entry| (serial, entry.notify.is_some()))
            });
            match (tracked, item) {
                (Some((serial, true)), item) => match state.pending.remove(&serial) {
                    Some(PendingEntry {
                        notify: Some(notify),
                        timeout,
                        ..
                    }) => Delivery::Notify(notify, timeout, item.into_outcome()),
                    _ => Delivery::Stored,
                },
                (Some((serial, false)), item) => {
                    if let Some(entry) = state.pending.get_mut(&serial) {
                        entry.outcome = Some(item.into_outcome());
                    }
                    Delivery::Stored
                }
                (None, Incoming::Message(message)) => Delivery::Filter(message),
                (None, Incoming::Disconnected) => Delivery::Disconnected,
                (None, Incoming::Failed(serial, _)) => {
                    trace!(serial, "Failure for a call nobody waits for");
                    Delivery::Stored
                }
            }
        };

        match delivery {
            Delivery::Notify(notify, timeout, outcome) => {
                if let Some(hooks) = self.hooks() {
                    hooks.remove_timeout(&timeout);
                }
                notify(outcome);
            }
            Delivery::Filter(message) => {
                let filter = self.filter.lock().clone();
                match filter {
                    Some(filter) => filter(&message),
                    None => trace!(kind = ?message.message_type(), "No filter for message"),
                }
            }
            Delivery::Disconnected => {
                let handler = self.on_disconnect.lock().clone();
                if let Some(handler) = handler {
                    handler();
                }
            }
            Delivery::Stored => {}
        }
        self.dispatch_status()
    }

    /// Shut the connection down and forget every pending call without
    /// invoking its notifier.
    pub fn close(&self) {
        let entries: Vec<PendingEntry> = {
            let mut state = self.state.lock();
            state.connected = false;
            state.incoming.clear();
            state.pending.drain().map(|(_, entry)| entry).collect()
        };
        self.arrived.notify_all();
        let hooks = self.hooks();
        if let Some(hooks) = &hooks {
            for entry in &entries {
                hooks.remove_timeout(&entry.timeout);
            }
        }
        drop(entries);
        if self.read_watch.is_enabled() {
            self.read_watch.set_enabled(false);
            if let Some(hooks) = &hooks {
                hooks.toggle_watch(&self.read_watch);
            }
        }
        if let Err(err) = self.bus.clone().close() {
            trace!(error = %err, "Closing bus connection");
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let _ = self.bus.clone().close();
    }
}

/// Reader thread: queue everything zbus receives until the stream ends or
/// the connection is dropped.
fn read_messages(connection: Weak<Connection>, messages: MessageIterator, mut waker: UnixStream) {
    for received in messages {
        let Some(connection) = connection.upgrade() else {
            return;
        };
        match received {
            Ok(message) => {
                trace!(
                    serial = message.serial_number(),
                    kind = ?message.message_type(),
                    member = ?message.member_name(),
                    "Received message"
                );
                connection.enqueue(Incoming::Message(message));
            }
            Err(err) => {
                warn!(error = %err, "Bus read failed");
                break;
            }
        }
        // A full wake socket already reads as ready.
        let _ = waker.write(&[1]);
    }
    if let Some(connection) = connection.upgrade() {
        connection.lost();
    }
    let _ = waker.write(&[1]);
}

/// Handle on a reply the connection is still waiting for.
#[derive(Debug)]
pub struct PendingCall {
    serial: u32,
    connection: Weak<Connection>,
}

impl PendingCall {
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Register the reply handler. It runs from [`Connection::dispatch`],
    /// never from this call. The handler is handed back if the call is no
    /// longer pending.
    pub fn set_notify(&self, notify: ReplyHandler) -> std::result::Result<(), ReplyHandler> {
        match self.connection.upgrade() {
            Some(connection) => connection.set_notify(self.serial, notify),
            None => Err(notify),
        }
    }

    /// Wait for the reply, bounded by the call's timeout.
    pub fn block(&self) -> Result<Message> {
        let connection = self
            .connection
            .upgrade()
            .ok_or_else(|| DbusError::ConnectionUnavailable("connection dropped".to_string()))?;
        connection.block_for_reply(self.serial)
    }

    /// Stop waiting. The notifier, if any, is dropped without running.
    pub fn cancel(&self) -> bool {
        self.connection
            .upgrade()
            .map(|connection| connection.cancel(self.serial))
            .unwrap_or(false)
    }

    pub fn is_pending(&self) -> bool {
        self.connection
            .upgrade()
            .map(|connection| connection.is_pending(self.serial))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// A connected in-process peer pair, for tests.
#[cfg(test)]
pub(crate) fn peer_pair() -> (zbus::blocking::Connection, zbus::blocking::Connection) {
    let (client, server) = UnixStream::pair().expect("socket pair");
    let guid = zbus::Guid::generate();
    let server = thread::spawn(move || {
        zbus::blocking::connection::Builder::unix_stream(server)
            .server(guid)
            .expect("server guid")
            .p2p()
            .build()
            .expect("server handshake")
    });
    let client = zbus::blocking::connection::Builder::unix_stream(client)
        .p2p()
        .build()
        .expect("client handshake");
    let server = server.join().expect("server thread");
    (client, server)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{method_call, MessageType};

    fn pair() -> (Arc<Connection>, zbus::blocking::Connection, MessageIterator) {
        let (client, server) = peer_pair();
        let received = MessageIterator::from(&server);
        (Connection::new(client).unwrap(), server, received)
    }

    fn call(member: &str) -> Message {
        method_call("org.example.S", "/", "org.example.I", member)
            .unwrap()
            .build(&())
            .unwrap()
    }

    fn wait_queued(connection: &Connection) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while connection.dispatch_status() == DispatchStatus::Complete && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_block_for_reply_queues_other_messages() {
        let (connection, server, mut received) = pair();
        let pending = connection.send_with_reply(&call("Ping"), Duration::from_secs(5)).unwrap();

        let ping = received.next().unwrap().unwrap();
        assert_eq!(ping.member_name().as_deref(), Some("Ping"));

        let signal = Message::signal("/", "org.example.I", "Tick").unwrap().build(&()).unwrap();
        server.send(&signal).unwrap();
        let reply = Message::method_reply(&ping).unwrap().build(&("pong",)).unwrap();
        server.send(&reply).unwrap();

        let reply = pending.block().unwrap();
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
        wait_queued(&connection);
        assert_eq!(connection.dispatch_status(), DispatchStatus::DataRemains);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        connection.set_filter(Some(Arc::new(move |message: &Message| {
            sink.lock().push(message.member_name());
        })));
        assert_eq!(connection.dispatch(), DispatchStatus::Complete);
        assert_eq!(seen.lock().as_slice(), &[Some("Tick".to_string())]);
    }

    #[test]
    fn test_block_times_out() {
        let (connection, _server, _received) = pair();
        let pending = connection.send_with_reply(&call("Slow"), Duration::from_millis(30)).unwrap();
        assert!(matches!(pending.block(), Err(DbusError::Timeout(_))));
        assert!(!pending.is_pending());
    }

    #[test]
    fn test_notify_runs_from_dispatch() {
        let (connection, server, mut received) = pair();
        let pending = connection.send_with_reply(&call("Ping"), Duration::from_secs(5)).unwrap();

        let got = Arc::new(Mutex::new(None));
        let sink = got.clone();
        pending
            .set_notify(Box::new(move |reply: Result<Message>| {
                *sink.lock() = reply.ok().map(|reply| reply.message_type())
            }))
            .map_err(|_| "not pending")
            .unwrap();

        let ping = received.next().unwrap().unwrap();
        server
            .send(&Message::method_reply(&ping).unwrap().build(&()).unwrap())
            .unwrap();

        wait_queued(&connection);
        assert!(got.lock().is_none());
        connection.dispatch();
        assert_eq!(*got.lock(), Some(MessageType::MethodReturn));
    }

    #[test]
    fn test_cancel_drops_notify() {
        let (connection, _server, _received) = pair();
        let pending = connection.send_with_reply(&call("Ping"), Duration::from_secs(5)).unwrap();
        assert!(pending.is_pending());
        assert!(pending.cancel());
        assert!(!pending.is_pending());
        assert!(pending.set_notify(Box::new(|_| {})).is_err());
        assert!(matches!(pending.block(), Err(DbusError::CallCancelled)));
    }

    #[test]
    fn test_peer_close_fails_pending_and_signals_disconnect() {
        let (connection, server, _received) = pair();
        let pending = connection.send_with_reply(&call("Ping"), Duration::from_secs(5)).unwrap();
        server.close().unwrap();

        assert!(matches!(pending.block(), Err(DbusError::ConnectionUnavailable(_))));
        assert!(!connection.is_connected());

        let seen = Arc::new(AtomicBool::new(false));
        let sink = seen.clone();
        connection.set_disconnect_handler(Some(Arc::new(move || sink.store(true, Ordering::SeqCst))));
        wait_queued(&connection);
        while connection.dispatch() == DispatchStatus::DataRemains {}
        assert!(seen.load(Ordering::SeqCst));
        assert!(connection.send(&call("Late")).is_err());
    }
}
