//! One bus connection and the registry of proxy states that share it.

use super::state::ProxyState;
use super::{BusType, Proxy, ProxyIdentity, ResultCallback};
use crate::closure::MainLoopClosure;
use crate::config::ProxySettings;
use crate::connection::Connection;
use crate::demarshal::Demarshaller;
use crate::error::Result;
use crate::main_loop::MainLoop;
use crate::marshal::{Argument, Marshaller};
use crate::name_owner::{NameOwnerCache, SubscriptionId};
use crate::connector::Connector;
use crate::message::{self, Message, MessageExt, MessageType, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE};
use crate::value::Value;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tracing::{debug, info, trace, warn};

const NAME_OWNER_CHANGED_RULE: &str = "type='signal',sender='org.freedesktop.DBus',\
path='/org/freedesktop/DBus',interface='org.freedesktop.DBus',member='NameOwnerChanged'";

/// Fire-and-forget request to the bus daemon carrying one string.
fn send_bus_request(connection: &Connection, member: &str, arg: &str) -> Result<u32> {
    let mut marshaller = Marshaller::new();
    marshaller.append_argument(&Argument::typed("s", arg))?;
    let request = marshaller.finish(message::method_call_no_reply(
        DBUS_SERVICE,
        DBUS_PATH,
        DBUS_INTERFACE,
        member,
    )?)?;
    connection.send(&request)
}

fn add_match(connection: &Connection, rule: &str) {
    if let Err(err) = send_bus_request(connection, "AddMatch", rule) {
        warn!(rule, error = %err, "Failed to add match rule");
    }
}

fn remove_match(connection: &Connection, rule: &str) {
    if let Err(err) = send_bus_request(connection, "RemoveMatch", rule) {
        debug!(rule, error = %err, "Failed to remove match rule");
    }
}

struct ManagerInner {
    connection: Option<Arc<Connection>>,
    closure: Option<MainLoopClosure>,
    proxies: HashMap<ProxyIdentity, Arc<ProxyState>>,
    /// Name owner subscription of each registered identity
    subscriptions: HashMap<ProxyIdentity, SubscriptionId>,
    names: NameOwnerCache,
    /// Internal proxy of the bus daemon, used for `GetNameOwner`
    bus_proxy: Option<Arc<ProxyState>>,
    destroying: bool,
}

impl ManagerInner {
    /// Take a state out of the registry together with its name
    /// subscription.
    fn unregister(&mut self, identity: &ProxyIdentity) -> Option<Arc<ProxyState>> {
        let state = self.proxies.remove(identity)?;
        if let Some(id) = self.subscriptions.remove(identity) {
            self.names.unmonitor_name(&identity.name, id);
        }
        Some(state)
    }
}

/// Owns the connection of one bus type.
///
/// The connection is opened on the first proxy request and closed when
/// the last proxy state goes away.
pub(crate) struct BusManager {
    bus: BusType,
    me: Weak<BusManager>,
    connector: Arc<dyn Connector>,
    main_loop: Option<Arc<dyn MainLoop>>,
    settings: ProxySettings,
    inner: Mutex<ManagerInner>,
}

impl BusManager {
    pub(crate) fn new(
        bus: BusType,
        connector: Arc<dyn Connector>,
        main_loop: Option<Arc<dyn MainLoop>>,
        settings: ProxySettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            bus,
            me: me.clone(),
            connector,
            main_loop,
            settings,
            inner: Mutex::new(ManagerInner {
                connection: None,
                closure: None,
                proxies: HashMap::new(),
                subscriptions: HashMap::new(),
                names: NameOwnerCache::new(),
                bus_proxy: None,
                destroying: false,
            }),
        })
    }

    pub(crate) fn bus_type(&self) -> BusType {
        self.bus
    }

    pub(crate) fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Async calls need a host loop to deliver their replies.
    pub(crate) fn is_async_supported(&self) -> bool {
        self.inner.lock().closure.is_some()
    }

    pub(crate) fn proxy_count(&self) -> usize {
        self.inner.lock().proxies.len()
    }

    /// The live connection, reconnecting when needed.
    pub(crate) fn connection(&self) -> Option<Arc<Connection>> {
        let stale = {
            let inner = self.inner.lock();
            match &inner.connection {
                Some(connection) if connection.is_connected() => return Some(connection.clone()),
                Some(_) => true,
                None => false,
            }
        };
        if stale {
            debug!(bus = %self.bus, "Dropping stale connection");
            self.destroy();
        }
        match self.connect() {
            Ok(connection) => Some(connection),
            Err(err) => {
                warn!(bus = %self.bus, error = %err, "Unable to connect to bus");
                None
            }
        }
    }

    fn connect(&self) -> Result<Arc<Connection>> {
        let (connection, identities) = {
            let mut inner = self.inner.lock();
            if let Some(connection) = &inner.connection {
                if connection.is_connected() {
                    return Ok(connection.clone());
                }
            }
            let connection = Connection::new(self.connector.connect(self.bus)?)?;

            let weak = self.me.clone();
            connection.set_filter(Some(Arc::new(move |message: &Message| {
                if let Some(manager) = weak.upgrade() {
                    manager.handle_message(message);
                }
            })));
            let weak = self.me.clone();
            connection.set_disconnect_handler(Some(Arc::new(move || {
                if let Some(manager) = weak.upgrade() {
                    info!(bus = %manager.bus, "Bus disconnected");
                    manager.destroy();
                }
            })));
            add_match(&connection, NAME_OWNER_CHANGED_RULE);

            inner.closure = self
                .main_loop
                .clone()
                .map(|main_loop| MainLoopClosure::new(&connection, main_loop));
            inner.connection = Some(connection.clone());
            let identities: Vec<ProxyIdentity> = inner.proxies.keys().cloned().collect();
            (connection, identities)
        };
        info!(
            bus = %self.bus,
            unique_name = ?connection.unique_name(),
            async_calls = self.main_loop.is_some(),
            "Connected to bus"
        );

        // states that outlived the previous connection
        for identity in &identities {
            add_match(&connection, &identity.match_rule());
            self.monitor(identity);
        }
        Ok(connection)
    }

    fn lookup(&self, identity: &ProxyIdentity) -> Option<Arc<ProxyState>> {
        self.inner.lock().proxies.get(identity).cloned()
    }

    /// Find the shared state of `identity` or build, introspect and
    /// register a new one.
    pub(crate) fn get_or_create(&self, identity: ProxyIdentity) -> Option<Arc<ProxyState>> {
        if let Err(err) = identity.validate() {
            warn!(identity = %identity, error = %err, "Refusing proxy");
            return None;
        }
        {
            let inner = self.inner.lock();
            if let Some(state) = inner.proxies.get(&identity) {
                state.add_ref();
                return Some(state.clone());
            }
        }

        let connection = self.connection()?;
        let candidate = ProxyState::new(identity.clone(), self.me.clone());
        if !candidate.initial_introspect() {
            warn!(identity = %identity, "Introspection failed, proxy not created");
            return None;
        }

        let state = {
            let mut inner = self.inner.lock();
            match inner.proxies.get(&identity) {
                Some(existing) => {
                    existing.add_ref();
                    Some(existing.clone())
                }
                None => {
                    inner.proxies.insert(identity.clone(), candidate.clone());
                    None
                }
            }
        };
        if let Some(existing) = state {
            // another thread registered the same identity meanwhile
            candidate.cancel_all_pending();
            return Some(existing);
        }

        add_match(&connection, &identity.match_rule());
        self.monitor(&identity);
        debug!(identity = %identity, state = ?candidate.introspection_state(), "Created proxy state");
        Some(candidate)
    }

    pub(crate) fn new_proxy(&self, identity: ProxyIdentity) -> Option<Proxy> {
        let manager = self.me.upgrade()?;
        let state = self.get_or_create(identity)?;
        Some(Proxy::from_state(manager, state))
    }

    /// Drop one reference of `state`, unregistering it at zero.
    pub(crate) fn release(&self, state: &Arc<ProxyState>) {
        let removed = {
            let mut inner = self.inner.lock();
            if state.release() > 0 {
                return;
            }
            let registered = inner
                .proxies
                .get(state.identity())
                .map_or(false, |current| Arc::ptr_eq(current, state));
            if registered {
                inner.unregister(state.identity())
            } else {
                None
            }
        };
        match removed {
            Some(state) => self.finish_removal(&state),
            None => state.cancel_all_pending(),
        }
    }

    /// Unregister `identity` regardless of its reference count.
    pub(crate) fn remove_proxy_state(&self, identity: &ProxyIdentity) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            if inner.destroying {
                warn!(identity = %identity, "Proxy removal during bus teardown ignored");
                return false;
            }
            inner.unregister(identity)
        };
        match removed {
            Some(state) => {
                self.finish_removal(&state);
                true
            }
            None => false,
        }
    }

    fn finish_removal(&self, state: &Arc<ProxyState>) {
        state.cancel_all_pending();
        let (connection, empty) = {
            let inner = self.inner.lock();
            (inner.connection.clone(), inner.proxies.is_empty())
        };
        if let Some(connection) = connection.filter(|c| c.is_connected()) {
            remove_match(&connection, &state.identity().match_rule());
        }
        debug!(identity = %state.identity(), "Removed proxy state");
        if empty {
            self.destroy();
        }
    }

    fn bus_proxy(&self) -> Arc<ProxyState> {
        if let Some(bus_proxy) = self.inner.lock().bus_proxy.clone() {
            return bus_proxy;
        }
        let state = ProxyState::new(
            ProxyIdentity::new(DBUS_SERVICE, DBUS_PATH, DBUS_INTERFACE),
            self.me.clone(),
        );
        if let Err(err) = state.introspect_sync() {
            // GetNameOwner still works without prototypes
            debug!(error = %err, "Bus daemon introspection failed");
        }
        self.inner.lock().bus_proxy.get_or_insert(state).clone()
    }

    /// Follow the owner of the identity's bus name.
    fn monitor(&self, identity: &ProxyIdentity) {
        if identity.is_unique_name() || !self.settings.monitor_name_owners {
            return;
        }
        let first = {
            let mut inner = self.inner.lock();
            if inner.subscriptions.contains_key(identity) {
                return;
            }
            let weak = self.me.clone();
            let key = identity.clone();
            let (id, first) = inner.names.monitor_name(
                &identity.name,
                Arc::new(move |name: &str, owner: &str| {
                    let Some(manager) = weak.upgrade() else {
                        return;
                    };
                    debug!(name, owner, "Bus name changed owner");
                    if let Some(state) = manager.lookup(&key) {
                        state.on_name_owner_changed();
                    }
                }),
            );
            inner.subscriptions.insert(identity.clone(), id);
            first
        };
        if first {
            self.query_name_owner(&identity.name);
        }
    }

    fn query_name_owner(&self, name: &str) {
        let weak = self.me.clone();
        let queried = name.to_string();
        let callback: ResultCallback = Box::new(move |index: i32, value: &Value| {
            if index != 0 {
                return false;
            }
            if let (Some(manager), Some(owner)) = (weak.upgrade(), value.as_str()) {
                trace!(name = %queried, owner, "Resolved bus name owner");
                manager.inner.lock().names.set_name_owner(&queried, owner, false);
            }
            false
        });
        self.bus_proxy()
            .call_method("GetNameOwner", false, 0, Some(callback), &[Argument::typed("s", name)]);
    }

    /// Close the connection. Registered states stay and reconnect on
    /// their next use.
    pub(crate) fn destroy(&self) {
        let (connection, closure, bus_proxy, states) = {
            let mut inner = self.inner.lock();
            if inner.destroying {
                return;
            }
            inner.destroying = true;
            inner.names.clear();
            inner.subscriptions.clear();
            let states: Vec<Arc<ProxyState>> = inner.proxies.values().cloned().collect();
            (
                inner.connection.take(),
                inner.closure.take(),
                inner.bus_proxy.take(),
                states,
            )
        };

        if let Some(connection) = &connection {
            connection.set_filter(None);
            connection.set_disconnect_handler(None);
            if connection.is_connected() {
                remove_match(connection, NAME_OWNER_CHANGED_RULE);
            }
        }
        for state in states.iter().chain(bus_proxy.as_ref()) {
            state.cancel_all_pending();
        }
        drop(closure);
        if let Some(connection) = connection {
            connection.close();
            info!(bus = %self.bus, remaining = states.len(), "Bus connection closed");
        }
        self.inner.lock().destroying = false;
    }

    /// Filter for every message that is not a tracked reply.
    fn handle_message(&self, message: &Message) {
        if message.message_type() != MessageType::Signal {
            return;
        }
        if message.is_signal(DBUS_INTERFACE, "NameOwnerChanged")
            && message.sender_name().map_or(true, |sender| sender == DBUS_SERVICE)
        {
            self.handle_name_owner_changed(message);
        }
        self.route_signal(message);
    }

    fn handle_name_owner_changed(&self, message: &Message) {
        let args = match Demarshaller::new(message).get_arguments() {
            Ok(args) => args,
            Err(err) => {
                debug!(error = %err, "Malformed NameOwnerChanged");
                return;
            }
        };
        let strings: Vec<&str> = args.iter().filter_map(|arg| arg.value.as_str()).collect();
        let &[name, _old_owner, new_owner] = strings.as_slice() else {
            debug!(signature = %message.body_signature(), "Unexpected NameOwnerChanged arguments");
            return;
        };
        if name.starts_with(':') {
            return;
        }
        let callbacks = self.inner.lock().names.set_name_owner(name, new_owner, true);
        for callback in callbacks {
            callback(name, new_owner);
        }
    }

    /// Hand a signal to every state whose identity it addresses.
    fn route_signal(&self, message: &Message) {
        let (Some(path), Some(interface)) = (message.path_name(), message.interface_name()) else {
            return;
        };
        let (path, interface) = (path.as_str(), interface.as_str());
        let sender = message.sender_name().unwrap_or_default();
        let sender = sender.as_str();
        let targets: Vec<Arc<ProxyState>> = {
            let inner = self.inner.lock();
            let mut names = inner.names.owner_names(sender);
            if !sender.is_empty() {
                names.push(sender.to_string());
            }
            names
                .into_iter()
                .filter_map(|name| {
                    inner
                        .proxies
                        .get(&ProxyIdentity::new(name, path, interface))
                        .cloned()
                })
                .collect()
        };
        if targets.is_empty() {
            trace!(sender, path, interface, member = ?message.member_name(), "Signal has no receiver");
        }
        for state in targets {
            state.emit_signal(message);
        }
    }
}

impl std::fmt::Debug for BusManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("BusManager")
            .field("bus", &self.bus)
            .field("connected", &inner.connection.is_some())
            .field("proxies", &inner.proxies.len())
            .field("names", &inner.names)
            .finish()
    }
}
