//! In-process bus broker for integration tests.
//!
//! Each client connection is a peer-to-peer zbus connection over a
//! `UnixStream` pair, served by its own thread. The broker answers the
//! daemon methods the proxy layer uses and plays one test service,
//! `com.google.Gadget`, itself.

#![allow(dead_code)]

use gadget_dbus::demarshal::Demarshaller;
use gadget_dbus::marshal::{Argument, Marshaller};
use gadget_dbus::message::{
    Builder, Message, MessageExt, MessageType, DBUS_INTERFACE, DBUS_PATH, DBUS_SERVICE, ERROR_NAME_HAS_NO_OWNER,
    ERROR_UNKNOWN_METHOD, ERROR_UNKNOWN_OBJECT, INTROSPECTABLE_INTERFACE, PROPERTIES_INTERFACE,
};
use gadget_dbus::zbus::blocking::connection::Builder as ConnectionBuilder;
use gadget_dbus::zbus::blocking::{Connection, MessageIterator};
use gadget_dbus::{BusType, Connector, DbusError, Result, Value};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};

pub const SERVICE: &str = "com.google.Gadget";
pub const SERVICE_PATH: &str = "/com/google/Gadget/Test";
pub const PARENT_PATH: &str = "/com/google/Gadget";
pub const SERVICE_INTERFACE: &str = "com.google.Gadget.Test";
pub const SERVICE_OWNER: &str = ":1.1";

/// How long `Hello`, and a delayed `Introspect`, take to answer.
pub const SLOW_REPLY: Duration = Duration::from_millis(500);

/// How the service answers introspection of `SERVICE_PATH`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrospectPlan {
    /// Every request is answered at once.
    Immediate,
    /// The first request is answered after `SLOW_REPLY`, later ones at once.
    SlowFirst,
    /// The first request is answered after `SLOW_REPLY`, later ones fail.
    SlowFirstThenError,
}

const SERVICE_XML: &str = r#"<!DOCTYPE node PUBLIC "-//freedesktop//DTD D-BUS Object Introspection 1.0//EN"
 "http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd">
<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect"><arg name="data" direction="out" type="s"/></method>
  </interface>
  <interface name="org.freedesktop.DBus.Properties">
    <method name="Get">
      <arg name="interface" type="s"/><arg name="name" type="s"/>
      <arg name="value" direction="out" type="v"/>
    </method>
  </interface>
  <interface name="com.google.Gadget.Test">
    <method name="Echo">
      <arg name="input" type="s"/>
      <arg name="output" direction="out" type="s"/>
    </method>
    <method name="Add">
      <arg name="a" type="i"/><arg name="b" type="i"/>
      <arg name="sum" direction="out" type="i"/>
    </method>
    <method name="Split">
      <arg name="text" type="s"/>
      <arg name="head" direction="out" type="s"/>
      <arg name="tail" direction="out" type="s"/>
    </method>
    <method name="Hello"/>
    <signal name="Ping">
      <arg name="count" type="i"/>
      <arg name="label" type="s"/>
    </signal>
    <property name="Level" type="i" access="readwrite"/>
    <property name="Label" type="s" access="read"/>
    <property name="Secret" type="s" access="write"/>
  </interface>
</node>"#;

const PARENT_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus.Introspectable">
    <method name="Introspect"><arg name="data" direction="out" type="s"/></method>
  </interface>
  <node name="Test"/>
  <node name="Other"/>
</node>"#;

const DAEMON_XML: &str = r#"<node>
  <interface name="org.freedesktop.DBus">
    <method name="Hello"><arg direction="out" type="s"/></method>
    <method name="AddMatch"><arg type="s"/></method>
    <method name="RemoveMatch"><arg type="s"/></method>
    <method name="GetNameOwner"><arg type="s"/><arg direction="out" type="s"/></method>
    <signal name="NameOwnerChanged"><arg type="s"/><arg type="s"/><arg type="s"/></signal>
  </interface>
</node>"#;

/// A method call as the broker saw it.
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub client: String,
    pub destination: String,
    pub interface: String,
    pub member: String,
    pub args: Vec<Value>,
}

struct Client {
    unique: String,
    connection: Connection,
}

struct Shared {
    clients: Mutex<Vec<Client>>,
    owners: Mutex<HashMap<String, String>>,
    properties: Mutex<BTreeMap<String, Value>>,
    calls: Mutex<Vec<RecordedCall>>,
    introspect_plan: Mutex<IntrospectPlan>,
    service_introspects: AtomicUsize,
    messages_received: AtomicUsize,
    connections: AtomicUsize,
    next_client: AtomicU32,
}

#[derive(Clone)]
pub struct MockBus {
    shared: Arc<Shared>,
}

impl MockBus {
    pub fn new() -> Self {
        let mut owners = HashMap::new();
        owners.insert(SERVICE.to_string(), SERVICE_OWNER.to_string());
        let mut properties = BTreeMap::new();
        properties.insert("Level".to_string(), Value::Int64(7));
        properties.insert("Label".to_string(), Value::from("gadget"));
        properties.insert("Secret".to_string(), Value::from(""));
        Self {
            shared: Arc::new(Shared {
                clients: Mutex::new(Vec::new()),
                owners: Mutex::new(owners),
                properties: Mutex::new(properties),
                calls: Mutex::new(Vec::new()),
                introspect_plan: Mutex::new(IntrospectPlan::Immediate),
                service_introspects: AtomicUsize::new(0),
                messages_received: AtomicUsize::new(0),
                connections: AtomicUsize::new(0),
                next_client: AtomicU32::new(2),
            }),
        }
    }

    pub fn with_introspect_plan(self, plan: IntrospectPlan) -> Self {
        *self.shared.introspect_plan.lock() = plan;
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Messages clients have sent so far.
    pub fn messages_received(&self) -> usize {
        self.shared.messages_received.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.shared.calls.lock().clone()
    }

    pub fn count_calls(&self, member: &str) -> usize {
        self.shared.calls.lock().iter().filter(|c| c.member == member).count()
    }

    pub fn property(&self, name: &str) -> Option<Value> {
        self.shared.properties.lock().get(name).cloned()
    }

    /// Wait until the broker has handled `count` calls of `member`.
    pub fn wait_for_calls(&self, member: &str, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.count_calls(member) >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    /// Emit a service signal from the current owner of the service name.
    pub fn emit_signal(&self, member: &str, args: &[Argument]) {
        let sender = self
            .shared
            .owners
            .lock()
            .get(SERVICE)
            .cloned()
            .unwrap_or_else(|| SERVICE_OWNER.to_string());
        let signal = Message::signal(SERVICE_PATH, SERVICE_INTERFACE, member)
            .and_then(|builder| builder.sender(sender.as_str()))
            .map_err(DbusError::from)
            .and_then(|builder| with_body(builder, args))
            .unwrap();
        self.shared.broadcast(&signal);
    }

    /// Move the service name to another owner and announce it.
    pub fn set_owner(&self, owner: &str) {
        let previous = self
            .shared
            .owners
            .lock()
            .insert(SERVICE.to_string(), owner.to_string())
            .unwrap_or_default();
        let signal = Message::signal(DBUS_PATH, DBUS_INTERFACE, "NameOwnerChanged")
            .and_then(|builder| builder.sender(DBUS_SERVICE))
            .map_err(DbusError::from)
            .and_then(|builder| {
                with_body(
                    builder,
                    &[
                        Argument::typed("s", SERVICE),
                        Argument::typed("s", previous),
                        Argument::typed("s", owner),
                    ],
                )
            })
            .unwrap();
        self.shared.broadcast(&signal);
    }

    /// Drop every client connection.
    pub fn disconnect_all(&self) {
        let clients: Vec<Client> = self.shared.clients.lock().drain(..).collect();
        for client in clients {
            let _ = client.connection.close();
        }
    }
}

impl Connector for MockBus {
    fn connect(&self, _bus: BusType) -> Result<Connection> {
        let unavailable = |err: std::io::Error| DbusError::ConnectionUnavailable(err.to_string());
        let (client, server) = UnixStream::pair().map_err(unavailable)?;
        let unique = format!(":1.{}", self.shared.next_client.fetch_add(1, Ordering::SeqCst));

        // The server side must be listening before the client sends
        // anything, or the first calls are lost.
        let (ready, listening) = mpsc::channel();
        let shared = self.shared.clone();
        thread::spawn(move || {
            let built = ConnectionBuilder::unix_stream(server)
                .server(gadget_dbus::zbus::Guid::generate())
                .and_then(|builder| builder.p2p().build());
            let Ok(connection) = built else {
                return;
            };
            let messages = MessageIterator::from(&connection);
            shared.clients.lock().push(Client {
                unique: unique.clone(),
                connection: connection.clone(),
            });
            let _ = ready.send(());
            shared.serve(messages, unique, connection);
        });

        let client = ConnectionBuilder::unix_stream(client).p2p().build()?;
        listening
            .recv_timeout(Duration::from_secs(5))
            .map_err(|_| DbusError::ConnectionUnavailable("mock bus did not start".to_string()))?;
        self.shared.connections.fetch_add(1, Ordering::SeqCst);
        Ok(client)
    }
}

fn with_body(builder: Builder<'_>, args: &[Argument]) -> Result<Message> {
    let mut marshaller = Marshaller::new();
    marshaller.append_arguments(args)?;
    marshaller.finish(builder)
}

fn reply(from: &str, call: &Message, args: &[Argument]) -> Result<Message> {
    with_body(Message::method_reply(call)?.sender(from)?, args)
}

fn error(from: &str, call: &Message, name: &str, text: &str) -> Result<Message> {
    Ok(Message::method_error(call, name)?.sender(from)?.build(&(text,))?)
}

impl Shared {
    fn broadcast(&self, message: &Message) {
        let connections: Vec<Connection> = self.clients.lock().iter().map(|c| c.connection.clone()).collect();
        for connection in connections {
            let _ = connection.send(message);
        }
    }

    fn serve(self: Arc<Self>, messages: MessageIterator, unique: String, connection: Connection) {
        for message in messages {
            let Ok(message) = message else {
                return;
            };
            self.messages_received.fetch_add(1, Ordering::SeqCst);
            if message.message_type() == MessageType::MethodCall {
                self.handle_call(&unique, &connection, message);
            }
        }
    }

    fn handle_call(self: &Arc<Self>, unique: &str, connection: &Connection, call: Message) {
        let args: Vec<Value> = Demarshaller::new(&call)
            .get_arguments()
            .map(|args| args.into_iter().map(|arg| arg.value).collect())
            .unwrap_or_default();
        let destination = call
            .header()
            .destination()
            .map(|name| name.as_str().to_owned())
            .unwrap_or_default();
        let member = call.member_name().unwrap_or_default();
        let interface = call.interface_name().unwrap_or_default();

        let response = if destination == DBUS_SERVICE {
            Some(self.daemon_call(unique, &call, &member, &args))
        } else if destination == SERVICE || destination == SERVICE_OWNER {
            match self.delay_for(&call, &interface, &member) {
                Some(delay) => {
                    let shared = self.clone();
                    let connection = connection.clone();
                    let call = call.clone();
                    thread::spawn(move || {
                        thread::sleep(delay);
                        if let Ok(late) = shared.service_call(&call, &interface_of(&call), &member_of(&call), &[]) {
                            let _ = connection.send(&late);
                        }
                    });
                    None
                }
                None => Some(self.service_call(&call, &interface, &member, &args)),
            }
        } else {
            Some(error(
                DBUS_SERVICE,
                &call,
                "org.freedesktop.DBus.Error.ServiceUnknown",
                "no such name",
            ))
        };

        if let Some(Ok(response)) = response {
            if call.expects_reply() {
                let _ = connection.send(&response);
            }
        }
        self.calls.lock().push(RecordedCall {
            client: unique.to_string(),
            destination,
            interface,
            member,
            args,
        });
    }

    /// Service calls answered late instead of at once.
    fn delay_for(&self, call: &Message, interface: &str, member: &str) -> Option<Duration> {
        if interface == SERVICE_INTERFACE && member == "Hello" {
            return Some(SLOW_REPLY);
        }
        if interface != INTROSPECTABLE_INTERFACE || call.path_name().as_deref() != Some(SERVICE_PATH) {
            return None;
        }
        let seen = self.service_introspects.fetch_add(1, Ordering::SeqCst);
        let plan = *self.introspect_plan.lock();
        (seen == 0 && plan != IntrospectPlan::Immediate).then_some(SLOW_REPLY)
    }

    fn daemon_call(&self, unique: &str, call: &Message, member: &str, args: &[Value]) -> Result<Message> {
        match member {
            "Hello" => reply(DBUS_SERVICE, call, &[Argument::typed("s", unique)]),
            "AddMatch" | "RemoveMatch" => reply(DBUS_SERVICE, call, &[]),
            "GetNameOwner" => {
                let name = args.first().and_then(Value::as_str).unwrap_or("");
                match self.owners.lock().get(name).cloned() {
                    Some(owner) => reply(DBUS_SERVICE, call, &[Argument::typed("s", owner)]),
                    None => error(DBUS_SERVICE, call, ERROR_NAME_HAS_NO_OWNER, "name has no owner"),
                }
            }
            "Introspect" => reply(DBUS_SERVICE, call, &[Argument::typed("s", DAEMON_XML)]),
            _ => error(DBUS_SERVICE, call, ERROR_UNKNOWN_METHOD, "unknown daemon method"),
        }
    }

    fn service_call(&self, call: &Message, interface: &str, member: &str, args: &[Value]) -> Result<Message> {
        let owner = SERVICE_OWNER;
        let path = call.path_name().unwrap_or_default();
        match (interface, member) {
            (INTROSPECTABLE_INTERFACE, "Introspect") => {
                let failing = *self.introspect_plan.lock() == IntrospectPlan::SlowFirstThenError
                    && self.service_introspects.load(Ordering::SeqCst) > 1;
                match path.as_str() {
                    SERVICE_PATH if failing => error(owner, call, ERROR_UNKNOWN_OBJECT, "object went away"),
                    SERVICE_PATH => reply(owner, call, &[Argument::typed("s", SERVICE_XML)]),
                    PARENT_PATH => reply(owner, call, &[Argument::typed("s", PARENT_XML)]),
                    _ => error(owner, call, ERROR_UNKNOWN_OBJECT, "no such object"),
                }
            }
            (PROPERTIES_INTERFACE, "Get") => {
                let name = args.get(1).and_then(Value::as_str).unwrap_or("");
                match self.properties.lock().get(name).cloned() {
                    Some(value) => {
                        let mut marshaller = Marshaller::new();
                        marshaller.append_variant(&Argument::new(value))?;
                        marshaller.finish(Message::method_reply(call)?.sender(owner)?)
                    }
                    None => error(owner, call, ERROR_UNKNOWN_METHOD, "no such property"),
                }
            }
            (PROPERTIES_INTERFACE, "Set") => {
                if let (Some(name), Some(value)) = (args.get(1).and_then(Value::as_str), args.get(2)) {
                    self.properties
                        .lock()
                        .insert(name.to_string(), value.clone().into_unwrapped());
                }
                reply(owner, call, &[])
            }
            (SERVICE_INTERFACE, "Echo") => {
                let text = args.first().and_then(Value::as_str).unwrap_or("");
                reply(owner, call, &[Argument::typed("s", text)])
            }
            (SERVICE_INTERFACE, "Add") => {
                let sum = args.iter().filter_map(Value::as_i64).sum::<i64>();
                reply(owner, call, &[Argument::typed("i", sum)])
            }
            (SERVICE_INTERFACE, "Split") => {
                let text = args.first().and_then(Value::as_str).unwrap_or("");
                let (head, tail) = text.split_at(text.len() / 2);
                reply(owner, call, &[Argument::typed("s", head), Argument::typed("s", tail)])
            }
            (SERVICE_INTERFACE, "Hello") => reply(owner, call, &[]),
            _ => error(owner, call, ERROR_UNKNOWN_METHOD, "unknown method"),
        }
    }
}

fn interface_of(call: &Message) -> String {
    call.interface_name().unwrap_or_default()
}

fn member_of(call: &Message) -> String {
    call.member_name().unwrap_or_default()
}
