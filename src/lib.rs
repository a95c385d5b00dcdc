//! Introspection-driven D-Bus proxies.
//!
//! A [`BusContext`] hands out [`Proxy`] handles for remote objects. Each
//! proxy learns its interface by introspection and checks every call,
//! property access and signal against it. Proxies of one bus share a
//! single zbus connection, which can be driven by a host [`MainLoop`]
//! for asynchronous calls and signal delivery.

pub mod closure;
pub mod config;
pub mod connection;
pub mod connector;
pub mod demarshal;
pub mod error;
pub mod introspect;
pub mod logging;
pub mod main_loop;
pub mod marshal;
pub mod message;
pub mod name_owner;
pub mod proxy;
pub mod signature;
pub mod value;

// Re-export commonly used types
pub use crate::config::ProxySettings;
pub use connector::{BusConnector, Connector};
pub use error::{DbusError, Result};
pub use main_loop::{DefaultMainLoop, MainLoop, WatchCallback, WatchId};
pub use marshal::Argument;
pub use proxy::{
    BusContext, BusType, CallBuilder, CallId, IntrospectionState, Proxy, ProxyIdentity, SignalConnection,
};
pub use value::{Value, ValueKind};
pub use zbus;
