//! Configuration management for bus proxies.
//!
//! Settings are layered from several sources:
//! 1. Default configuration (embedded in the library)
//! 2. System-wide configuration file (`/etc/gadget-dbus/config.toml`)
//! 3. A caller-supplied configuration file
//! 4. Environment variables (prefixed with `GADGET_DBUS_`)
//!
//! Later sources override earlier ones.
//!
//! # Environment Variables
//!
//! - `GADGET_DBUS_DEFAULT_TIMEOUT_MS` - Timeout for calls that do not name one
//! - `GADGET_DBUS_INTROSPECT_TIMEOUT_MS` - Timeout of the synchronous introspection run
//! - `GADGET_DBUS_MONITOR_NAME_OWNERS` - Enable/disable name owner tracking
//! - `GADGET_DBUS_LOG_FILTER` - Filter directive used by [`crate::logging::init_logging_from`]
//! - `GADGET_DBUS_SYSTEM_BUS_ADDRESS` - Connect to this address instead of the system bus socket
//! - `GADGET_DBUS_SESSION_BUS_ADDRESS` - Connect to this address instead of the session bus

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Proxy and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Timeout for method calls issued with a zero timeout
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u32,
    /// Timeout for the synchronous introspection on proxy creation
    #[serde(default = "default_introspect_timeout_ms")]
    pub introspect_timeout_ms: u32,
    /// Query and follow bus name owners
    #[serde(default = "default_monitor_name_owners")]
    pub monitor_name_owners: bool,
    /// Log filter directive, see [`crate::logging::init_logging_from`]
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// System bus address instead of the well-known socket
    #[serde(default)]
    pub system_bus_address: Option<String>,
    /// Session bus address instead of `DBUS_SESSION_BUS_ADDRESS`
    #[serde(default)]
    pub session_bus_address: Option<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            introspect_timeout_ms: default_introspect_timeout_ms(),
            monitor_name_owners: default_monitor_name_owners(),
            log_filter: default_log_filter(),
            system_bus_address: None,
            session_bus_address: None,
        }
    }
}

impl ProxySettings {
    /// Load configuration from all sources
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config/default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config::File::with_name("/etc/gadget-dbus/config.toml").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }

        builder = builder.add_source(config::Environment::with_prefix("GADGET_DBUS"));

        let settings: ProxySettings = builder.build()?.try_deserialize()?;
        Ok(settings)
    }

    /// Resolve a per-call timeout, where zero selects the default.
    pub fn call_timeout(&self, timeout_ms: u32) -> Duration {
        if timeout_ms == 0 {
            Duration::from_millis(u64::from(self.default_timeout_ms))
        } else {
            Duration::from_millis(u64::from(timeout_ms))
        }
    }

    pub fn introspect_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.introspect_timeout_ms))
    }
}

fn default_timeout_ms() -> u32 {
    25_000
}

fn default_introspect_timeout_ms() -> u32 {
    5_000
}

fn default_monitor_name_owners() -> bool {
    true
}

fn default_log_filter() -> String {
    "gadget_dbus=info".to_string()
}
