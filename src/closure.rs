//! Glue between a [`Connection`] and a host [`MainLoop`].

use crate::connection::{Connection, ConnectionHooks, DispatchStatus, Timeout, Watch};
use crate::main_loop::{MainLoop, WatchCallback, WatchId};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, trace, warn};

#[derive(Default)]
struct ClosureState {
    /// Connection watch id -> loop watches (read and/or write)
    watches: HashMap<u64, Vec<WatchId>>,

    /// Connection timeout id -> loop timeout watch
    timeouts: HashMap<u64, WatchId>,

    /// Zero-interval watch that dispatches while data remains
    dispatch: Option<WatchId>,

    detached: bool,
}

struct ClosureInner {
    me: Weak<ClosureInner>,
    connection: Weak<Connection>,
    main_loop: Arc<dyn MainLoop>,
    state: Mutex<ClosureState>,
}

/// Keeps a connection serviced by a host loop for as long as it lives.
///
/// Descriptor readiness and reply deadlines are forwarded to the
/// connection, and a dispatch watch delivers one queued message per
/// iteration until the queue is empty. Dropping the closure removes
/// every watch it registered.
pub struct MainLoopClosure {
    inner: Arc<ClosureInner>,
}

impl MainLoopClosure {
    pub fn new(connection: &Arc<Connection>, main_loop: Arc<dyn MainLoop>) -> Self {
        let inner = Arc::new_cyclic(|me| ClosureInner {
            me: me.clone(),
            connection: Arc::downgrade(connection),
            main_loop,
            state: Mutex::new(ClosureState::default()),
        });
        connection.set_hooks(Some(inner.clone() as Arc<dyn ConnectionHooks>));
        debug!("Attached connection to host main loop");
        Self { inner }
    }

    /// Number of loop watches currently registered.
    pub fn watch_count(&self) -> usize {
        let state = self.inner.state.lock();
        state.watches.values().map(Vec::len).sum::<usize>()
            + state.timeouts.len()
            + usize::from(state.dispatch.is_some())
    }
}

impl Drop for MainLoopClosure {
    fn drop(&mut self) {
        if let Some(connection) = self.inner.connection.upgrade() {
            connection.set_hooks(None);
        }
        let leftovers: Vec<WatchId> = {
            let mut state = self.inner.state.lock();
            state.detached = true;
            let mut ids: Vec<WatchId> = state.watches.drain().flat_map(|(_, ids)| ids).collect();
            ids.extend(state.timeouts.drain().map(|(_, id)| id));
            ids.extend(state.dispatch.take());
            ids
        };
        for id in leftovers {
            self.inner.main_loop.remove_watch(id);
        }
        debug!("Detached connection from host main loop");
    }
}

impl ClosureInner {
    fn check_dispatch_status(&self, connection: &Connection) {
        if connection.dispatch_status() == DispatchStatus::DataRemains {
            self.dispatch_status_changed(DispatchStatus::DataRemains);
        }
    }

    fn forget_loop_watch(&self, id: WatchId) {
        let mut state = self.state.lock();
        state.watches.retain(|_, ids| {
            ids.retain(|w| *w != id);
            !ids.is_empty()
        });
        state.timeouts.retain(|_, w| *w != id);
        if state.dispatch == Some(id) {
            state.dispatch = None;
        }
    }
}

struct IoCallback {
    closure: Weak<ClosureInner>,
    watch: Arc<Watch>,
}

impl WatchCallback for IoCallback {
    fn call(&mut self, _main_loop: &dyn MainLoop, _id: WatchId) -> bool {
        let Some(closure) = self.closure.upgrade() else {
            return false;
        };
        let Some(connection) = closure.connection.upgrade() else {
            return false;
        };
        connection.handle_watch(&self.watch, true);
        closure.check_dispatch_status(&connection);
        true
    }

    fn on_remove(&mut self, _main_loop: &dyn MainLoop, id: WatchId) {
        if let Some(closure) = self.closure.upgrade() {
            closure.forget_loop_watch(id);
        }
    }
}

struct TimeoutCallback {
    closure: Weak<ClosureInner>,
    timeout: Arc<Timeout>,
}

impl WatchCallback for TimeoutCallback {
    fn call(&mut self, _main_loop: &dyn MainLoop, _id: WatchId) -> bool {
        let Some(closure) = self.closure.upgrade() else {
            return false;
        };
        let Some(connection) = closure.connection.upgrade() else {
            return false;
        };
        connection.handle_timeout(&self.timeout);
        closure.check_dispatch_status(&connection);
        true
    }

    fn on_remove(&mut self, _main_loop: &dyn MainLoop, id: WatchId) {
        if let Some(closure) = self.closure.upgrade() {
            closure.forget_loop_watch(id);
        }
    }
}

struct DispatchCallback {
    closure: Weak<ClosureInner>,
}

impl WatchCallback for DispatchCallback {
    fn call(&mut self, _main_loop: &dyn MainLoop, _id: WatchId) -> bool {
        let Some(closure) = self.closure.upgrade() else {
            return false;
        };
        let Some(connection) = closure.connection.upgrade() else {
            closure.state.lock().dispatch = None;
            return false;
        };
        if connection.dispatch() == DispatchStatus::DataRemains {
            return true;
        }
        // re-check under the lock so a concurrent enqueue cannot be missed
        let mut state = closure.state.lock();
        if connection.dispatch_status() == DispatchStatus::DataRemains {
            return true;
        }
        state.dispatch = None;
        false
    }
}

impl ConnectionHooks for ClosureInner {
    fn add_watch(&self, watch: &Arc<Watch>) -> bool {
        if !watch.is_enabled() {
            return true;
        }
        let mut state = self.state.lock();
        if state.detached {
            return false;
        }
        if state.watches.contains_key(&watch.id()) {
            return true;
        }
        let mut ids = Vec::new();
        if watch.is_readable() {
            let callback = IoCallback {
                closure: self.me.clone(),
                watch: watch.clone(),
            };
            ids.extend(self.main_loop.add_io_read_watch(watch.fd(), Box::new(callback)));
        }
        if watch.is_writable() {
            let callback = IoCallback {
                closure: self.me.clone(),
                watch: watch.clone(),
            };
            ids.extend(self.main_loop.add_io_write_watch(watch.fd(), Box::new(callback)));
        }
        if ids.is_empty() {
            warn!(fd = watch.fd(), "Main loop rejected descriptor watch");
            return false;
        }
        trace!(fd = watch.fd(), "Added descriptor watch");
        state.watches.insert(watch.id(), ids);
        true
    }

    fn remove_watch(&self, watch: &Arc<Watch>) {
        let ids = self.state.lock().watches.remove(&watch.id());
        for id in ids.into_iter().flatten() {
            self.main_loop.remove_watch(id);
        }
    }

    fn toggle_watch(&self, watch: &Arc<Watch>) {
        if watch.is_enabled() {
            self.add_watch(watch);
        } else {
            self.remove_watch(watch);
        }
    }

    fn add_timeout(&self, timeout: &Arc<Timeout>) -> bool {
        if !timeout.is_enabled() {
            return true;
        }
        let mut state = self.state.lock();
        if state.detached {
            return false;
        }
        if state.timeouts.contains_key(&timeout.id()) {
            return true;
        }
        let callback = TimeoutCallback {
            closure: self.me.clone(),
            timeout: timeout.clone(),
        };
        match self.main_loop.add_timeout_watch(timeout.interval(), Box::new(callback)) {
            Some(id) => {
                state.timeouts.insert(timeout.id(), id);
                true
            }
            None => {
                warn!(interval_ms = timeout.interval_ms(), "Main loop rejected timeout watch");
                false
            }
        }
    }

    fn remove_timeout(&self, timeout: &Arc<Timeout>) {
        let id = self.state.lock().timeouts.remove(&timeout.id());
        if let Some(id) = id {
            self.main_loop.remove_watch(id);
        }
    }

    fn toggle_timeout(&self, timeout: &Arc<Timeout>) {
        if timeout.is_enabled() {
            self.add_timeout(timeout);
        } else {
            self.remove_timeout(timeout);
        }
    }

    fn dispatch_status_changed(&self, status: DispatchStatus) {
        if status != DispatchStatus::DataRemains {
            return;
        }
        let mut state = self.state.lock();
        if state.detached || state.dispatch.is_some() {
            return;
        }
        let callback = DispatchCallback { closure: self.me.clone() };
        state.dispatch = self.main_loop.add_timeout_watch(Duration::ZERO, Box::new(callback));
        if state.dispatch.is_none() {
            warn!("Main loop rejected dispatch watch");
        }
    }

    fn wakeup_main(&self) {
        if !self.main_loop.is_main_thread() {
            self.main_loop.wake_up();
        }
    }
}
