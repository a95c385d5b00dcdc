//! Proxies for remote bus objects.
//!
//! A [`Proxy`] is a cheap handle. Every handle for the same
//! `(bus name, object path, interface)` on one bus shares a single
//! [`ProxyState`], which holds the introspected prototypes, pending
//! calls and signal subscribers. The state is unregistered, and its
//! match rule and name subscription dropped, when the last handle goes.

mod context;
mod manager;
mod state;

pub use context::BusContext;
pub use state::{CallId, IntrospectionState, ProxyState};

use crate::error::{DbusError, Result};
use crate::introspect::{MethodPrototype, PropertyPrototype, SignalPrototype};
use crate::marshal::Argument;
use crate::signature;
use crate::value::Value;
use manager::BusManager;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};

/// Which bus a proxy lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusType {
    /// System bus (/var/run/dbus/system_bus_socket)
    System,
    /// Session bus ($DBUS_SESSION_BUS_ADDRESS)
    #[default]
    Session,
}

impl std::fmt::Display for BusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusType::System => write!(f, "system"),
            BusType::Session => write!(f, "session"),
        }
    }
}

/// Invoked with `(index, value)` for each returned item, `(0, Void)` for
/// a reply without items, or `(-1, Void)` on failure. Returning `false`
/// stops delivery of the remaining items.
pub type ResultCallback = Box<dyn FnMut(i32, &Value) -> bool + Send>;

/// Invoked with the signal name and its arguments.
pub type SignalCallback = Arc<dyn Fn(&str, &[Value]) + Send + Sync>;

/// Invoked after the prototypes of a proxy were refreshed.
pub type ResetCallback = Arc<dyn Fn() + Send + Sync>;

/// The sharing key of proxy states.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProxyIdentity {
    pub name: String,
    pub path: String,
    pub interface: String,
}

impl ProxyIdentity {
    pub fn new(name: impl Into<String>, path: impl Into<String>, interface: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            interface: interface.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !signature::validate_bus_name(&self.name) {
            return Err(DbusError::InvalidIdentity(format!("bus name {:?}", self.name)));
        }
        if !signature::validate_object_path(&self.path) {
            return Err(DbusError::InvalidIdentity(format!("object path {:?}", self.path)));
        }
        if !signature::validate_interface(&self.interface) {
            return Err(DbusError::InvalidIdentity(format!("interface {:?}", self.interface)));
        }
        Ok(())
    }

    /// Bus match rule selecting the signals this identity receives.
    pub fn match_rule(&self) -> String {
        format!(
            "type='signal',sender='{}',path='{}',interface='{}'",
            self.name, self.path, self.interface
        )
    }

    /// Whether the name is a unique connection name (`:1.42`).
    pub fn is_unique_name(&self) -> bool {
        self.name.starts_with(':')
    }
}

impl std::fmt::Display for ProxyIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}|{}|{}", self.name, self.path, self.interface)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscriptionKind {
    Signal,
    Reset,
}

/// Keeps a signal or reset callback connected until dropped.
#[must_use = "the callback is disconnected when this guard is dropped"]
#[derive(Debug)]
pub struct SignalConnection {
    state: Weak<ProxyState>,
    kind: SubscriptionKind,
    id: u64,
}

impl SignalConnection {
    pub(crate) fn new(state: Weak<ProxyState>, kind: SubscriptionKind, id: u64) -> Self {
        Self { state, kind, id }
    }

    pub fn is_connected(&self) -> bool {
        self.state
            .upgrade()
            .map(|state| state.is_subscribed(self.kind, self.id))
            .unwrap_or(false)
    }

    pub fn disconnect(self) {}
}

impl Drop for SignalConnection {
    fn drop(&mut self) {
        if let Some(state) = self.state.upgrade() {
            state.unsubscribe(self.kind, self.id);
        }
    }
}

/// Handle on a remote object's interface.
pub struct Proxy {
    state: Arc<ProxyState>,
    manager: Arc<BusManager>,
}

impl Proxy {
    pub(crate) fn from_state(manager: Arc<BusManager>, state: Arc<ProxyState>) -> Self {
        Self { state, manager }
    }

    pub fn bus_type(&self) -> BusType {
        self.manager.bus_type()
    }

    pub fn identity(&self) -> &ProxyIdentity {
        self.state.identity()
    }

    pub fn name(&self) -> &str {
        &self.state.identity().name
    }

    pub fn path(&self) -> &str {
        &self.state.identity().path
    }

    pub fn interface(&self) -> &str {
        &self.state.identity().interface
    }

    /// Number of handles sharing this proxy's state.
    pub fn ref_count(&self) -> usize {
        self.state.ref_count()
    }

    pub fn introspection_state(&self) -> IntrospectionState {
        self.state.introspection_state()
    }

    /// Whether two handles share one state.
    pub fn shares_state_with(&self, other: &Proxy) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }

    /// Call a method. Returns the call id, or 0 when the call could not
    /// be made; the callback then receives `(-1, Void)`.
    ///
    /// Asynchronous results are delivered from the host loop, never from
    /// this call. Without a host loop every call is synchronous.
    pub fn call_method(
        &self,
        method: &str,
        sync: bool,
        timeout_ms: u32,
        callback: Option<ResultCallback>,
        args: &[Argument],
    ) -> CallId {
        self.state.call_method(method, sync, timeout_ms, callback, args)
    }

    /// Build a method call argument by argument.
    pub fn method(&self, name: &str) -> CallBuilder<'_> {
        CallBuilder {
            proxy: self,
            method: name.to_string(),
            args: Vec::new(),
            timeout_ms: 0,
            sync: false,
        }
    }

    /// Call a method and wait for its results.
    pub fn call_method_sync(&self, method: &str, timeout_ms: u32, args: &[Argument]) -> Result<Vec<Value>> {
        self.state.call_method_sync(method, timeout_ms, args)
    }

    pub fn cancel_method_call(&self, id: CallId) -> bool {
        self.state.cancel_method_call(id)
    }

    pub fn is_method_call_pending(&self, id: CallId) -> bool {
        self.state.is_method_call_pending(id)
    }

    pub fn get_property(&self, name: &str) -> Result<Value> {
        self.state.get_property(name)
    }

    pub fn set_property(&self, name: &str, value: impl Into<Value>) -> bool {
        self.state.set_property(name, value.into())
    }

    pub fn connect_on_signal_emit<F>(&self, callback: F) -> SignalConnection
    where
        F: Fn(&str, &[Value]) + Send + Sync + 'static,
    {
        self.state.connect_on_signal_emit(Arc::new(callback))
    }

    /// Called whenever the proxy re-read its interface description, for
    /// example after the bus name changed owner.
    pub fn connect_on_reset<F>(&self, callback: F) -> SignalConnection
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.state.connect_on_reset(Arc::new(callback))
    }

    pub fn get_method_info(&self, method: &str) -> Option<MethodPrototype> {
        self.state.get_method_info(method)
    }

    pub fn get_signal_info(&self, signal: &str) -> Option<SignalPrototype> {
        self.state.get_signal_info(signal)
    }

    pub fn get_property_info(&self, property: &str) -> Option<PropertyPrototype> {
        self.state.get_property_info(property)
    }

    /// Visitors return `false` to stop early; the result tells whether
    /// every item was visited.
    pub fn enumerate_methods(&self, visitor: impl FnMut(&str) -> bool) -> bool {
        self.state.enumerate(state::Listing::Methods, visitor)
    }

    pub fn enumerate_signals(&self, visitor: impl FnMut(&str) -> bool) -> bool {
        self.state.enumerate(state::Listing::Signals, visitor)
    }

    pub fn enumerate_properties(&self, visitor: impl FnMut(&str) -> bool) -> bool {
        self.state.enumerate(state::Listing::Properties, visitor)
    }

    pub fn enumerate_interfaces(&self, visitor: impl FnMut(&str) -> bool) -> bool {
        self.state.enumerate(state::Listing::Interfaces, visitor)
    }

    pub fn enumerate_children(&self, visitor: impl FnMut(&str) -> bool) -> bool {
        self.state.enumerate(state::Listing::Children, visitor)
    }

    /// Proxy for `child` (a relative path) below this object.
    pub fn new_child_proxy(&self, child: &str, interface: &str) -> Option<Proxy> {
        if child.is_empty() || child.starts_with('/') || interface.is_empty() {
            tracing::debug!(identity = %self.identity(), child, "Invalid child proxy request");
            return None;
        }
        let path = if self.path() == "/" {
            format!("/{}", child)
        } else {
            format!("{}/{}", self.path(), child)
        };
        self.manager
            .new_proxy(ProxyIdentity::new(self.name(), path, interface))
    }

    /// Proxy for another interface of the same object.
    pub fn new_interface_proxy(&self, interface: &str) -> Option<Proxy> {
        if interface.is_empty() {
            return None;
        }
        self.manager
            .new_proxy(ProxyIdentity::new(self.name(), self.path(), interface))
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        self.state.add_ref();
        Self {
            state: self.state.clone(),
            manager: self.manager.clone(),
        }
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        self.manager.release(&self.state);
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("bus", &self.bus_type())
            .field("identity", &self.identity().to_string())
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Typed argument list for one method call.
#[must_use]
pub struct CallBuilder<'p> {
    proxy: &'p Proxy,
    method: String,
    args: Vec<Argument>,
    timeout_ms: u32,
    sync: bool,
}

impl<'p> CallBuilder<'p> {
    /// Append an argument whose signature is inferred (or taken from the
    /// method's prototype when known).
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(Argument::new(value));
        self
    }

    pub fn typed_arg(mut self, signature: &str, value: impl Into<Value>) -> Self {
        self.args.push(Argument::typed(signature, value));
        self
    }

    /// Zero selects the configured default.
    pub fn timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    pub fn invoke<F>(self, callback: F) -> CallId
    where
        F: FnMut(i32, &Value) -> bool + Send + 'static,
    {
        self.proxy
            .call_method(&self.method, self.sync, self.timeout_ms, Some(Box::new(callback)), &self.args)
    }

    /// Send without caring about the result.
    pub fn send(self) -> CallId {
        self.proxy
            .call_method(&self.method, self.sync, self.timeout_ms, None, &self.args)
    }

    pub fn call_sync(self) -> Result<Vec<Value>> {
        self.proxy
            .call_method_sync(&self.method, self.timeout_ms, &self.args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_validation() {
        let ok = ProxyIdentity::new("org.example.Service", "/org/example", "org.example.Iface");
        assert!(ok.validate().is_ok());
        assert_eq!(ok.to_string(), "org.example.Service|/org/example|org.example.Iface");

        let bad_path = ProxyIdentity::new("org.example.Service", "org/example", "org.example.Iface");
        assert!(matches!(bad_path.validate(), Err(DbusError::InvalidIdentity(_))));
        let bad_iface = ProxyIdentity::new("org.example.Service", "/", "noDots");
        assert!(bad_iface.validate().is_err());
        let unique = ProxyIdentity::new(":1.42", "/", "org.example.Iface");
        assert!(unique.validate().is_ok());
        assert!(unique.is_unique_name());
    }

    #[test]
    fn test_match_rule() {
        let id = ProxyIdentity::new("org.example.Service", "/org/example", "org.example.Iface");
        assert_eq!(
            id.match_rule(),
            "type='signal',sender='org.example.Service',path='/org/example',interface='org.example.Iface'"
        );
    }

    #[test]
    fn test_bus_type_display() {
        assert_eq!(BusType::System.to_string(), "system");
        assert_eq!(BusType::default(), BusType::Session);
        assert_eq!(serde_json::to_string(&BusType::System).unwrap(), "\"system\"");
    }
}
