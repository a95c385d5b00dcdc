//! Shared state behind every proxy handle of one identity.

use super::manager::BusManager;
use super::{ProxyIdentity, ResetCallback, ResultCallback, SignalCallback, SignalConnection, SubscriptionKind};
use crate::connection::{Connection, PendingCall, ReplyHandler};
use crate::demarshal::Demarshaller;
use crate::error::{DbusError, Result};
use crate::introspect::{ArgPrototype, Introspection, MethodPrototype, PropertyPrototype, SignalPrototype};
use crate::marshal::{Argument, Marshaller};
use crate::signature;
use crate::value::Value;
use crate::message::{
    self, Message, MessageExt, MessageType, ERROR_DISCONNECTED, ERROR_NO_REPLY, INTROSPECTABLE_INTERFACE,
    PROPERTIES_INTERFACE,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Positive id of a method call, unique among a proxy's pending calls.
/// Zero means the call was not made.
pub type CallId = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrospectionState {
    Uninitialized,
    IntrospectingSync,
    IntrospectingAsync,
    Ready,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Listing {
    Methods,
    Signals,
    Properties,
    Interfaces,
    Children,
}

struct StateInner {
    introspection: Introspection,
    introspection_state: IntrospectionState,
    introspect_call: Option<PendingCall>,
    pending: HashMap<CallId, PendingCall>,
    next_call_id: CallId,
    signal_callbacks: Vec<(u64, SignalCallback)>,
    reset_callbacks: Vec<(u64, ResetCallback)>,
    next_subscription: u64,
}

impl StateInner {
    fn allocate_call_id(&mut self) -> CallId {
        loop {
            let id = self.next_call_id;
            self.next_call_id = self.next_call_id.wrapping_add(1);
            if self.next_call_id <= 0 {
                self.next_call_id = 1;
            }
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }
}

/// Map an error reply to the error it stands for.
fn reply_error(reply: &Message) -> DbusError {
    let name = reply.error_name_str().unwrap_or_default();
    let text = reply.error_text().unwrap_or_default();
    match name.as_str() {
        ERROR_NO_REPLY => DbusError::Timeout(text),
        ERROR_DISCONNECTED => DbusError::ConnectionUnavailable(text),
        _ => DbusError::remote(name, text),
    }
}

/// Hand a call result to its callback.
fn deliver(callback: Option<ResultCallback>, result: Result<Vec<Value>>) {
    let Some(mut callback) = callback else {
        return;
    };
    match result {
        Ok(values) if values.is_empty() => {
            callback(0, &Value::Void);
        }
        Ok(values) => {
            for (index, value) in values.iter().enumerate() {
                if !callback(index as i32, value) {
                    break;
                }
            }
        }
        Err(_) => {
            callback(-1, &Value::Void);
        }
    }
}

pub struct ProxyState {
    identity: ProxyIdentity,
    manager: Weak<BusManager>,
    refs: AtomicUsize,
    inner: Mutex<StateInner>,
}

impl ProxyState {
    pub(crate) fn new(identity: ProxyIdentity, manager: Weak<BusManager>) -> Arc<Self> {
        Arc::new(Self {
            identity,
            manager,
            refs: AtomicUsize::new(1),
            inner: Mutex::new(StateInner {
                introspection: Introspection::default(),
                introspection_state: IntrospectionState::Uninitialized,
                introspect_call: None,
                pending: HashMap::new(),
                next_call_id: 1,
                signal_callbacks: Vec::new(),
                reset_callbacks: Vec::new(),
                next_subscription: 1,
            }),
        })
    }

    pub fn identity(&self) -> &ProxyIdentity {
        &self.identity
    }

    pub fn ref_count(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference and return how many remain.
    pub(crate) fn release(&self) -> usize {
        let previous = self
            .refs
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        previous.saturating_sub(1)
    }

    pub fn introspection_state(&self) -> IntrospectionState {
        self.inner.lock().introspection_state
    }

    pub fn pending_call_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn manager(&self) -> Result<Arc<BusManager>> {
        self.manager
            .upgrade()
            .ok_or_else(|| DbusError::ConnectionUnavailable(format!("{} is detached from its bus", self.identity)))
    }

    fn connection(&self) -> Result<(Arc<BusManager>, Arc<Connection>)> {
        let manager = self.manager()?;
        let connection = manager
            .connection()
            .ok_or_else(|| DbusError::ConnectionUnavailable(format!("no {} bus", manager.bus_type())))?;
        Ok((manager, connection))
    }

    fn build_message(&self, interface: &str, member: &str, args: &[Argument]) -> Result<Message> {
        if !signature::validate_member(member) {
            return Err(DbusError::InvalidIdentity(format!("member name {:?}", member)));
        }
        let mut marshaller = Marshaller::new();
        marshaller.append_arguments(args)?;
        marshaller.finish(message::method_call(
            &self.identity.name,
            &self.identity.path,
            interface,
            member,
        )?)
    }

    /// Check arguments against a prototype and adopt its signatures.
    /// Without a prototype the arguments pass unchanged.
    fn check_arguments(
        &self,
        expected: Option<&[ArgPrototype]>,
        args: &[Argument],
        what: &str,
        name: &str,
    ) -> Result<Vec<Argument>> {
        let Some(expected) = expected else {
            return Ok(args.to_vec());
        };
        if expected.len() != args.len() {
            return Err(DbusError::type_mismatch(format!(
                "{} {} of {} takes {} arguments, got {}",
                what,
                name,
                self.identity,
                expected.len(),
                args.len()
            )));
        }
        expected
            .iter()
            .zip(args)
            .map(|(proto, arg)| {
                if let Some(kind) = signature::expected_kind(&proto.signature) {
                    if kind != arg.value.kind() {
                        return Err(DbusError::type_mismatch(format!(
                            "argument {:?} of {} {} expects {}, got {}",
                            proto.name,
                            what,
                            name,
                            kind,
                            arg.value.kind()
                        )));
                    }
                }
                Ok(Argument {
                    signature: proto.signature.clone(),
                    value: arg.value.clone(),
                })
            })
            .collect()
    }

    fn reply_values(&self, reply: &Message, expected: Option<&[ArgPrototype]>, method: &str) -> Result<Vec<Value>> {
        if reply.message_type() == MessageType::Error {
            return Err(reply_error(reply));
        }
        let args = Demarshaller::new(reply).get_arguments()?;
        let args = self.check_arguments(expected, &args, "method", method)?;
        Ok(args.into_iter().map(|arg| arg.value).collect())
    }

    fn call_blocking(&self, connection: &Arc<Connection>, message: Message, timeout: Duration) -> Result<Message> {
        connection.send_with_reply(&message, timeout)?.block()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Introspection
    // ─────────────────────────────────────────────────────────────────────

    fn set_introspection(&self, result: Result<Introspection>) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.introspect_call = None;
        match result {
            Ok(parsed) => {
                inner.introspection = parsed;
                inner.introspection_state = IntrospectionState::Ready;
                Ok(())
            }
            Err(err) => {
                inner.introspection = Introspection::default();
                inner.introspection_state = IntrospectionState::Failed;
                Err(err)
            }
        }
    }

    fn parse_introspection(&self, values: Vec<Value>) -> Result<Introspection> {
        let xml = values
            .into_iter()
            .next()
            .and_then(|value| value.as_str().map(str::to_string))
            .ok_or_else(|| DbusError::IntrospectionFailed(format!("{}: reply carries no document", self.identity)))?;
        Introspection::parse(&xml, &self.identity.path, &self.identity.interface)
    }

    /// Introspect and wait for the document.
    pub(crate) fn introspect_sync(&self) -> Result<()> {
        self.inner.lock().introspection_state = IntrospectionState::IntrospectingSync;
        let result = self.connection().and_then(|(manager, connection)| {
            let message = self.build_message(INTROSPECTABLE_INTERFACE, "Introspect", &[])?;
            let reply = self.call_blocking(&connection, message, manager.settings().introspect_timeout())?;
            let values = self.reply_values(&reply, None, "Introspect")?;
            self.parse_introspection(values)
        });
        let result = self.set_introspection(result);
        match &result {
            Ok(()) => debug!(identity = %self.identity, "Introspected"),
            Err(err) => debug!(identity = %self.identity, error = %err, "Synchronous introspection failed"),
        }
        result
    }

    /// Start an introspection whose result arrives from the host loop.
    /// Returns whether it was dispatched.
    pub(crate) fn introspect_async(self: &Arc<Self>) -> bool {
        let dispatched = self.connection().and_then(|(manager, connection)| {
            if !manager.is_async_supported() {
                return Err(DbusError::ConnectionUnavailable("no host loop".to_string()));
            }
            let message = self.build_message(INTROSPECTABLE_INTERFACE, "Introspect", &[])?;
            self.inner.lock().introspection_state = IntrospectionState::IntrospectingAsync;
            let pending = connection.send_with_reply(&message, manager.settings().call_timeout(0))?;
            let weak = Arc::downgrade(self);
            let handler: ReplyHandler = Box::new(move |reply: Result<Message>| {
                if let Some(state) = weak.upgrade() {
                    state.finish_async_introspection(reply);
                }
            });
            // The handler runs from dispatch and starts by taking this
            // lock, so it cannot miss `introspect_call`.
            let mut inner = self.inner.lock();
            pending
                .set_notify(handler)
                .map_err(|_| DbusError::ConnectionUnavailable("introspection call dropped".to_string()))?;
            inner.introspect_call = Some(pending);
            Ok(())
        });
        match dispatched {
            Ok(()) => true,
            Err(err) => {
                debug!(identity = %self.identity, error = %err, "Asynchronous introspection failed");
                let _ = self.set_introspection(Err(err));
                self.fire_reset();
                false
            }
        }
    }

    fn finish_async_introspection(&self, reply: Result<Message>) {
        {
            let inner = self.inner.lock();
            if inner.introspect_call.is_none() {
                // cancelled while the reply was queued
                return;
            }
        }
        let result = reply
            .and_then(|reply| self.reply_values(&reply, None, "Introspect"))
            .and_then(|values| self.parse_introspection(values));
        match self.set_introspection(result) {
            Ok(()) => debug!(identity = %self.identity, "Introspected asynchronously"),
            Err(err) => debug!(identity = %self.identity, error = %err, "Introspection reply rejected"),
        }
        self.fire_reset();
    }

    /// Sync first, then async. `false` means neither worked.
    pub(crate) fn initial_introspect(self: &Arc<Self>) -> bool {
        self.introspect_sync().is_ok() || self.introspect_async()
    }

    /// The bus name moved to another connection: the old object is gone.
    pub(crate) fn on_name_owner_changed(self: &Arc<Self>) {
        debug!(identity = %self.identity, "Name owner changed, refreshing");
        self.cancel_all_pending();
        {
            let mut inner = self.inner.lock();
            inner.introspection = Introspection::default();
            inner.introspection_state = IntrospectionState::Uninitialized;
        }
        let async_supported = self.manager.upgrade().map_or(false, |m| m.is_async_supported());
        if async_supported {
            self.introspect_async();
        } else {
            let _ = self.introspect_sync();
            self.fire_reset();
        }
    }

    fn fire_reset(&self) {
        let callbacks: Vec<ResetCallback> = self
            .inner
            .lock()
            .reset_callbacks
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Method calls
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn call_method(
        self: &Arc<Self>,
        method: &str,
        sync: bool,
        timeout_ms: u32,
        callback: Option<ResultCallback>,
        args: &[Argument],
    ) -> CallId {
        let prototype = self.inner.lock().introspection.methods.get(method).cloned();
        let prepared = self
            .check_arguments(prototype.as_ref().map(|p| p.in_args.as_slice()), args, "method", method)
            .and_then(|args| {
                let (manager, connection) = self.connection()?;
                let message = self.build_message(&self.identity.interface, method, &args)?;
                Ok((manager, connection, message))
            });
        let (manager, connection, message) = match prepared {
            Ok(prepared) => prepared,
            Err(err) => {
                debug!(identity = %self.identity, method, error = %err, "Method call rejected");
                deliver(callback, Err(err));
                return 0;
            }
        };
        let timeout = manager.settings().call_timeout(timeout_ms);

        if sync || !manager.is_async_supported() {
            let id = self.inner.lock().allocate_call_id();
            // outputs are only checked when someone looks at them
            let expected = prototype
                .as_ref()
                .filter(|_| callback.is_some())
                .map(|p| p.out_args.as_slice());
            let result = self
                .call_blocking(&connection, message, timeout)
                .and_then(|reply| self.reply_values(&reply, expected, method));
            let succeeded = result.is_ok();
            if let Err(err) = &result {
                debug!(identity = %self.identity, method, error = %err, "Synchronous call failed");
            }
            deliver(callback, result);
            return if succeeded { id } else { 0 };
        }

        self.call_async(&connection, message, method, timeout, callback)
    }

    fn call_async(
        self: &Arc<Self>,
        connection: &Arc<Connection>,
        message: Message,
        method: &str,
        timeout: Duration,
        callback: Option<ResultCallback>,
    ) -> CallId {
        let pending = match connection.send_with_reply(&message, timeout) {
            Ok(pending) => pending,
            Err(err) => {
                debug!(identity = %self.identity, method, error = %err, "Asynchronous call failed");
                deliver(callback, Err(err));
                return 0;
            }
        };

        let mut inner = self.inner.lock();
        let id = inner.allocate_call_id();
        let weak = Arc::downgrade(self);
        let method_name = method.to_string();
        let handler: ReplyHandler = Box::new(move |reply: Result<Message>| {
            let Some(state) = weak.upgrade() else {
                return;
            };
            let expected = {
                let mut inner = state.inner.lock();
                if inner.pending.remove(&id).is_none() {
                    return;
                }
                inner
                    .introspection
                    .methods
                    .get(&method_name)
                    .map(|p| p.out_args.clone())
            };
            trace!(identity = %state.identity, call = id, "Call completed");
            let result = reply.and_then(|reply| state.reply_values(&reply, expected.as_deref(), &method_name));
            deliver(callback, result);
        });

        match pending.set_notify(handler) {
            Ok(()) => {
                inner.pending.insert(id, pending);
                id
            }
            Err(handler) => {
                drop(inner);
                handler(Err(DbusError::ConnectionUnavailable(
                    "call was dropped before it could be tracked".to_string(),
                )));
                0
            }
        }
    }

    pub(crate) fn call_method_sync(&self, method: &str, timeout_ms: u32, args: &[Argument]) -> Result<Vec<Value>> {
        let prototype = self.inner.lock().introspection.methods.get(method).cloned();
        let args = self.check_arguments(prototype.as_ref().map(|p| p.in_args.as_slice()), args, "method", method)?;
        let (manager, connection) = self.connection()?;
        let message = self.build_message(&self.identity.interface, method, &args)?;
        let reply = self.call_blocking(&connection, message, manager.settings().call_timeout(timeout_ms))?;
        self.reply_values(&reply, prototype.as_ref().map(|p| p.out_args.as_slice()), method)
    }

    pub(crate) fn cancel_method_call(&self, id: CallId) -> bool {
        let pending = self.inner.lock().pending.remove(&id);
        match pending {
            Some(pending) => {
                pending.cancel();
                trace!(identity = %self.identity, call = id, "Call cancelled");
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_method_call_pending(&self, id: CallId) -> bool {
        self.inner.lock().pending.contains_key(&id)
    }

    /// Cancel every outstanding call, including a running introspection.
    pub(crate) fn cancel_all_pending(&self) {
        let (pending, introspect) = {
            let mut inner = self.inner.lock();
            let pending: Vec<PendingCall> = inner.pending.drain().map(|(_, p)| p).collect();
            (pending, inner.introspect_call.take())
        };
        if !pending.is_empty() {
            debug!(identity = %self.identity, count = pending.len(), "Cancelling pending calls");
        }
        for call in pending.iter().chain(introspect.as_ref()) {
            call.cancel();
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Properties
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn get_property(&self, name: &str) -> Result<Value> {
        let prototype = self.inner.lock().introspection.properties.get(name).cloned();
        if let Some(prototype) = &prototype {
            if !prototype.access.is_readable() {
                return Err(DbusError::type_mismatch(format!(
                    "property {} of {} is write-only",
                    name, self.identity
                )));
            }
        }
        let (manager, connection) = self.connection()?;
        let args = [
            Argument::typed("s", self.identity.interface.as_str()),
            Argument::typed("s", name),
        ];
        let message = self.build_message(PROPERTIES_INTERFACE, "Get", &args)?;
        let reply = self.call_blocking(&connection, message, manager.settings().call_timeout(0))?;
        let value = self
            .reply_values(&reply, None, "Get")?
            .into_iter()
            .next()
            .ok_or_else(|| DbusError::type_mismatch(format!("empty reply for property {}", name)))?
            .into_unwrapped();
        if let Some(kind) = prototype.as_ref().and_then(|p| signature::expected_kind(&p.signature)) {
            if kind != value.kind() {
                return Err(DbusError::type_mismatch(format!(
                    "property {} of {} should be {}, got {}",
                    name,
                    self.identity,
                    kind,
                    value.kind()
                )));
            }
        }
        Ok(value)
    }

    pub(crate) fn set_property(&self, name: &str, value: Value) -> bool {
        let prototype = self.inner.lock().introspection.properties.get(name).cloned();
        let inner_arg = match prototype {
            Some(prototype) => {
                if !prototype.access.is_writable() {
                    debug!(identity = %self.identity, property = name, "Property is read-only");
                    return false;
                }
                if let Some(kind) = signature::expected_kind(&prototype.signature) {
                    if kind != value.kind() {
                        debug!(identity = %self.identity, property = name, %kind, "Property type mismatch");
                        return false;
                    }
                }
                Argument::typed(prototype.signature, value)
            }
            None => {
                debug!(identity = %self.identity, property = name, "Unknown property, setting anyway");
                Argument::new(value)
            }
        };

        let result = self.connection().and_then(|(_, connection)| {
            let mut marshaller = Marshaller::new();
            marshaller.append_argument(&Argument::typed("s", self.identity.interface.as_str()))?;
            marshaller.append_argument(&Argument::typed("s", name))?;
            marshaller.append_variant(&inner_arg)?;
            let message = marshaller.finish(message::method_call_no_reply(
                &self.identity.name,
                &self.identity.path,
                PROPERTIES_INTERFACE,
                "Set",
            )?)?;
            connection.send(&message)
        });
        match result {
            Ok(_) => true,
            Err(err) => {
                debug!(identity = %self.identity, property = name, error = %err, "Failed to set property");
                false
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Signals
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn connect_on_signal_emit(self: &Arc<Self>, callback: SignalCallback) -> SignalConnection {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.signal_callbacks.push((id, callback));
        SignalConnection::new(Arc::downgrade(self), SubscriptionKind::Signal, id)
    }

    pub(crate) fn connect_on_reset(self: &Arc<Self>, callback: ResetCallback) -> SignalConnection {
        let mut inner = self.inner.lock();
        let id = inner.next_subscription;
        inner.next_subscription += 1;
        inner.reset_callbacks.push((id, callback));
        SignalConnection::new(Arc::downgrade(self), SubscriptionKind::Reset, id)
    }

    pub(crate) fn is_subscribed(&self, kind: SubscriptionKind, id: u64) -> bool {
        let inner = self.inner.lock();
        match kind {
            SubscriptionKind::Signal => inner.signal_callbacks.iter().any(|(sub, _)| *sub == id),
            SubscriptionKind::Reset => inner.reset_callbacks.iter().any(|(sub, _)| *sub == id),
        }
    }

    pub(crate) fn unsubscribe(&self, kind: SubscriptionKind, id: u64) {
        let mut inner = self.inner.lock();
        match kind {
            SubscriptionKind::Signal => inner.signal_callbacks.retain(|(sub, _)| *sub != id),
            SubscriptionKind::Reset => inner.reset_callbacks.retain(|(sub, _)| *sub != id),
        }
    }

    /// Deliver a signal routed to this identity.
    pub(crate) fn emit_signal(&self, message: &Message) {
        let Some(member) = message.member_name() else {
            return;
        };
        let member = member.as_str();
        let args = match Demarshaller::new(message).get_arguments() {
            Ok(args) => args,
            Err(err) => {
                debug!(identity = %self.identity, signal = member, error = %err, "Undecodable signal");
                return;
            }
        };
        let (prototype, callbacks) = {
            let inner = self.inner.lock();
            let callbacks: Vec<SignalCallback> = inner.signal_callbacks.iter().map(|(_, cb)| cb.clone()).collect();
            (inner.introspection.signals.get(member).cloned(), callbacks)
        };
        match prototype {
            Some(prototype) => {
                if let Err(err) = self.check_arguments(Some(prototype.out_args.as_slice()), &args, "signal", member) {
                    warn!(identity = %self.identity, error = %err, "Dropping mismatched signal");
                    return;
                }
            }
            None => debug!(identity = %self.identity, signal = member, "Unknown signal, emitting anyway"),
        }
        let values: Vec<Value> = args.into_iter().map(|arg| arg.value).collect();
        for callback in callbacks {
            callback(member, &values);
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Prototype queries
    // ─────────────────────────────────────────────────────────────────────

    pub(crate) fn get_method_info(&self, method: &str) -> Option<MethodPrototype> {
        self.inner.lock().introspection.methods.get(method).cloned()
    }

    pub(crate) fn get_signal_info(&self, signal: &str) -> Option<SignalPrototype> {
        self.inner.lock().introspection.signals.get(signal).cloned()
    }

    pub(crate) fn get_property_info(&self, property: &str) -> Option<PropertyPrototype> {
        self.inner.lock().introspection.properties.get(property).cloned()
    }

    pub(crate) fn enumerate(&self, listing: Listing, mut visitor: impl FnMut(&str) -> bool) -> bool {
        let names: Vec<String> = {
            let inner = self.inner.lock();
            let data = &inner.introspection;
            match listing {
                Listing::Methods => data.methods.keys().cloned().collect(),
                Listing::Signals => data.signals.keys().cloned().collect(),
                Listing::Properties => data.properties.keys().cloned().collect(),
                Listing::Interfaces => data.interfaces.clone(),
                Listing::Children => data.children.clone(),
            }
        };
        names.iter().all(|name| visitor(name.as_str()))
    }
}

impl std::fmt::Debug for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyState")
            .field("identity", &self.identity.to_string())
            .field("refs", &self.ref_count())
            .field("introspection", &self.introspection_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{peer_pair, ConnectionHooks, DispatchStatus, Timeout, Watch};
    use crate::connector::Connector;
    use crate::main_loop::DefaultMainLoop;
    use crate::proxy::BusType;
    use crate::config::ProxySettings;
    use parking_lot::Mutex as TestMutex;
    use std::sync::atomic::AtomicBool;

    fn detached() -> Arc<ProxyState> {
        ProxyState::new(
            ProxyIdentity::new("org.example.S", "/org/example", "org.example.I"),
            Weak::new(),
        )
    }

    fn load(state: &ProxyState, xml: &str) {
        let parsed = Introspection::parse(xml, "/org/example", "org.example.I").unwrap();
        state.set_introspection(Ok(parsed)).unwrap();
    }

    const XML: &str = r#"<node>
      <interface name="org.example.I">
        <method name="Add"><arg type="i"/><arg type="i"/><arg direction="out" type="i"/></method>
        <signal name="Moved"><arg type="i"/><arg type="s"/></signal>
        <property name="Size" type="u" access="read"/>
      </interface>
    </node>"#;

    #[test]
    fn test_call_ids_skip_occupied_and_wrap() {
        let state = detached();
        let mut inner = state.inner.lock();
        inner.next_call_id = i32::MAX;
        assert_eq!(inner.allocate_call_id(), i32::MAX);
        assert_eq!(inner.allocate_call_id(), 1);
        assert_eq!(inner.allocate_call_id(), 2);
    }

    #[test]
    fn test_rejected_call_reports_failure() {
        let state = detached();
        load(&state, XML);
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: ResultCallback = Box::new(move |index: i32, value: &Value| {
            sink.lock().push((index, value.clone()));
            true
        });
        let id = state.call_method("Add", false, 0, Some(callback), &[Argument::new("one"), Argument::new(2)]);
        assert_eq!(id, 0);
        assert_eq!(seen.lock().as_slice(), &[(-1, Value::Void)]);
    }

    #[test]
    fn test_check_arguments_adopts_prototype() {
        let state = detached();
        load(&state, XML);
        let proto = state.get_method_info("Add").unwrap();
        let args = state
            .check_arguments(Some(proto.in_args.as_slice()), &[Argument::new(1), Argument::new(2)], "method", "Add")
            .unwrap();
        assert!(args.iter().all(|arg| arg.signature == "i"));
        assert!(state
            .check_arguments(Some(proto.in_args.as_slice()), &[Argument::new(1)], "method", "Add")
            .is_err());
    }

    #[test]
    fn test_emit_signal_validates_known_signals() {
        let state = detached();
        load(&state, XML);
        let seen = Arc::new(TestMutex::new(Vec::new()));
        let sink = seen.clone();
        let _connection = state.connect_on_signal_emit(Arc::new(move |name: &str, args: &[Value]| {
            sink.lock().push((name.to_string(), args.len()));
        }));

        let good = Message::signal("/org/example", "org.example.I", "Moved")
            .unwrap()
            .build(&(3i32, "north"))
            .unwrap();
        state.emit_signal(&good);

        let bad = Message::signal("/org/example", "org.example.I", "Moved")
            .unwrap()
            .build(&("north",))
            .unwrap();
        state.emit_signal(&bad);

        let unknown = Message::signal("/org/example", "org.example.I", "Other")
            .unwrap()
            .build(&())
            .unwrap();
        state.emit_signal(&unknown);

        assert_eq!(
            seen.lock().as_slice(),
            &[("Moved".to_string(), 2), ("Other".to_string(), 0)]
        );
    }

    #[test]
    fn test_signal_connection_drop_unsubscribes() {
        let state = detached();
        let connection = state.connect_on_signal_emit(Arc::new(|_: &str, _: &[Value]| {}));
        assert!(connection.is_connected());
        assert_eq!(state.inner.lock().signal_callbacks.len(), 1);
        drop(connection);
        assert!(state.inner.lock().signal_callbacks.is_empty());
    }

    #[test]
    fn test_enumerate_stops_early() {
        let state = detached();
        load(&state, XML);
        let mut visited = Vec::new();
        let complete = state.enumerate(Listing::Interfaces, |name| {
            visited.push(name.to_string());
            false
        });
        assert!(!complete);
        assert_eq!(visited, vec!["org.example.I"]);
        assert!(state.enumerate(Listing::Signals, |_| true));
        assert!(state.get_property_info("Size").is_some());
        assert_eq!(state.introspection_state(), IntrospectionState::Ready);
    }

    #[test]
    fn test_reply_error_mapping() {
        let call = message::method_call("org.example.S", "/org/example", "org.example.I", "Add")
            .unwrap()
            .build(&())
            .unwrap();
        let error = |name: &str, text: &str| Message::method_error(&call, name).unwrap().build(&(text,)).unwrap();

        assert!(matches!(reply_error(&error(ERROR_NO_REPLY, "late")), DbusError::Timeout(_)));
        assert!(matches!(
            reply_error(&error(ERROR_DISCONNECTED, "gone")),
            DbusError::ConnectionUnavailable(_)
        ));
        let remote = error("org.example.Error.Boom", "boom");
        match reply_error(&remote) {
            DbusError::RemoteError { name, message } => {
                assert_eq!(name, "org.example.Error.Boom");
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Hands out one end of an in-process peer pair per connect.
    struct PeerConnector {
        peers: TestMutex<Vec<zbus::blocking::Connection>>,
    }

    impl Connector for PeerConnector {
        fn connect(&self, _bus: BusType) -> Result<zbus::blocking::Connection> {
            let (client, server) = peer_pair();
            self.peers.lock().push(server);
            Ok(client)
        }
    }

    /// Connection hooks that note whether the proxy state lock is held
    /// whenever a message goes out.
    struct LockWitness {
        state: Weak<ProxyState>,
        sends: AtomicUsize,
        sent_under_lock: AtomicBool,
    }

    impl ConnectionHooks for LockWitness {
        fn add_watch(&self, _watch: &Arc<Watch>) -> bool {
            true
        }
        fn remove_watch(&self, _watch: &Arc<Watch>) {}
        fn toggle_watch(&self, _watch: &Arc<Watch>) {}
        fn add_timeout(&self, _timeout: &Arc<Timeout>) -> bool {
            true
        }
        fn remove_timeout(&self, _timeout: &Arc<Timeout>) {}
        fn toggle_timeout(&self, _timeout: &Arc<Timeout>) {}
        fn dispatch_status_changed(&self, _status: DispatchStatus) {}
        fn wakeup_main(&self) {
            self.sends.fetch_add(1, Ordering::SeqCst);
            if self.state.upgrade().is_some_and(|state| state.inner.is_locked()) {
                self.sent_under_lock.store(true, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_async_sends_do_not_hold_state_lock() {
        let main_loop: Arc<dyn crate::main_loop::MainLoop> = Arc::new(DefaultMainLoop::new().unwrap());
        let manager = BusManager::new(
            BusType::Session,
            Arc::new(PeerConnector {
                peers: TestMutex::new(Vec::new()),
            }),
            Some(main_loop),
            ProxySettings::default(),
        );
        let state = ProxyState::new(
            ProxyIdentity::new("org.example.S", "/org/example", "org.example.I"),
            Arc::downgrade(&manager),
        );
        let connection = manager.connection().unwrap();
        assert!(manager.is_async_supported());

        let witness = Arc::new(LockWitness {
            state: Arc::downgrade(&state),
            sends: AtomicUsize::new(0),
            sent_under_lock: AtomicBool::new(false),
        });
        connection.set_hooks(Some(witness.clone() as Arc<dyn ConnectionHooks>));

        let id = state.call_method("Ping", false, 0, None, &[]);
        assert!(id > 0);
        assert!(state.is_method_call_pending(id));
        assert!(state.introspect_async());
        assert_eq!(state.introspection_state(), IntrospectionState::IntrospectingAsync);

        assert_eq!(witness.sends.load(Ordering::SeqCst), 2);
        assert!(!witness.sent_under_lock.load(Ordering::SeqCst));
        state.cancel_all_pending();
        assert_eq!(state.pending_call_count(), 0);
    }
}
