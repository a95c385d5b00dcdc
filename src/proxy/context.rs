//! Entry point owning one bus manager per bus type.

use super::manager::BusManager;
use super::{BusType, Proxy, ProxyIdentity};
use crate::config::ProxySettings;
use crate::main_loop::MainLoop;
use crate::connector::{BusConnector, Connector};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Creates proxies and shares their connections.
///
/// Without a main loop every call is synchronous and signals are only
/// seen by hosts that dispatch the connection themselves.
pub struct BusContext {
    connector: Arc<dyn Connector>,
    main_loop: Option<Arc<dyn MainLoop>>,
    settings: ProxySettings,
    managers: Mutex<HashMap<BusType, Arc<BusManager>>>,
}

impl BusContext {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self {
            connector,
            main_loop: None,
            settings: ProxySettings::default(),
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Context on the real system and session buses, honouring the
    /// address overrides in `settings`.
    pub fn from_settings(settings: ProxySettings) -> Self {
        Self::new(Arc::new(BusConnector::from_settings(&settings))).with_settings(settings)
    }

    /// Deliver replies and signals through `main_loop`.
    pub fn with_main_loop(mut self, main_loop: Arc<dyn MainLoop>) -> Self {
        self.main_loop = Some(main_loop);
        self
    }

    pub fn with_settings(mut self, settings: ProxySettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    fn manager(&self, bus: BusType) -> Arc<BusManager> {
        self.managers
            .lock()
            .entry(bus)
            .or_insert_with(|| {
                BusManager::new(
                    bus,
                    self.connector.clone(),
                    self.main_loop.clone(),
                    self.settings.clone(),
                )
            })
            .clone()
    }

    /// Proxy for `interface` of the object at `path` owned by `name`.
    ///
    /// Returns `None` if the identity is malformed, the bus cannot be
    /// reached or the object cannot be introspected at all.
    pub fn new_proxy(&self, bus: BusType, name: &str, path: &str, interface: &str) -> Option<Proxy> {
        self.manager(bus)
            .new_proxy(ProxyIdentity::new(name, path, interface))
    }

    pub fn new_system_proxy(&self, name: &str, path: &str, interface: &str) -> Option<Proxy> {
        self.new_proxy(BusType::System, name, path, interface)
    }

    pub fn new_session_proxy(&self, name: &str, path: &str, interface: &str) -> Option<Proxy> {
        self.new_proxy(BusType::Session, name, path, interface)
    }

    /// Number of distinct proxy states alive on `bus`.
    pub fn proxy_count(&self, bus: BusType) -> usize {
        self.managers
            .lock()
            .get(&bus)
            .map_or(0, |manager| manager.proxy_count())
    }
}

impl Default for BusContext {
    fn default() -> Self {
        Self::from_settings(ProxySettings::default())
    }
}

impl std::fmt::Debug for BusContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BusContext")
            .field("main_loop", &self.main_loop.is_some())
            .field("settings", &self.settings)
            .field("managers", &self.managers.lock().len())
            .finish()
    }
}
