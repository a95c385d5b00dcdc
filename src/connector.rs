//! Opening bus connections.

use crate::config::ProxySettings;
use crate::error::{DbusError, Result};
use crate::proxy::BusType;
use tracing::{debug, info};

/// Produces an authenticated connection to a bus.
///
/// The bus manager calls this on first use and again after every
/// disconnect. Tests substitute an in-process peer.
pub trait Connector: Send + Sync {
    fn connect(&self, bus: BusType) -> Result<zbus::blocking::Connection>;
}

/// Connects to the real system or session bus.
///
/// Addresses come from the usual environment (`DBUS_SESSION_BUS_ADDRESS`,
/// `DBUS_SYSTEM_BUS_ADDRESS`, the well-known system socket) unless an
/// explicit address is configured. zbus performs the SASL handshake and
/// the `Hello` call, so the connection arrives with its unique name.
#[derive(Debug, Clone, Default)]
pub struct BusConnector {
    system_address: Option<String>,
    session_address: Option<String>,
}

impl BusConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the address overrides from `settings`.
    pub fn from_settings(settings: &ProxySettings) -> Self {
        Self {
            system_address: settings.system_bus_address.clone(),
            session_address: settings.session_bus_address.clone(),
        }
    }

    pub fn with_address(mut self, bus: BusType, address: impl Into<String>) -> Self {
        match bus {
            BusType::System => self.system_address = Some(address.into()),
            BusType::Session => self.session_address = Some(address.into()),
        }
        self
    }

    pub fn address(&self, bus: BusType) -> Option<&str> {
        match bus {
            BusType::System => self.system_address.as_deref(),
            BusType::Session => self.session_address.as_deref(),
        }
    }
}

impl Connector for BusConnector {
    fn connect(&self, bus: BusType) -> Result<zbus::blocking::Connection> {
        let connection = match (self.address(bus), bus) {
            (Some(address), _) => {
                debug!(%bus, address, "Connecting to configured bus address");
                zbus::blocking::connection::Builder::address(address).and_then(|builder| builder.build())
            }
            (None, BusType::System) => zbus::blocking::Connection::system(),
            (None, BusType::Session) => zbus::blocking::Connection::session(),
        }
        .map_err(|err| DbusError::ConnectionUnavailable(format!("{} bus: {}", bus, err)))?;
        info!(%bus, unique_name = ?connection.unique_name().map(|name| name.to_string()), "Connected to bus");
        Ok(connection)
    }
}
