//! Host event loop contract and a poll(2) reference loop.
//!
//! The proxy core never owns a thread. It registers descriptor and
//! timeout watches with whatever loop the application runs and is called
//! back from there. [`DefaultMainLoop`] is a small implementation for
//! applications (and tests) that have no loop of their own.

use nix::poll::{poll, PollFd, PollFlags};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(pub u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Callback attached to a watch.
pub trait WatchCallback: Send {
    /// Return `false` to remove the watch.
    fn call(&mut self, main_loop: &dyn MainLoop, watch: WatchId) -> bool;

    /// Runs once when the watch goes away, however that happens.
    fn on_remove(&mut self, _main_loop: &dyn MainLoop, _watch: WatchId) {}
}

impl<F> WatchCallback for F
where
    F: FnMut(&dyn MainLoop, WatchId) -> bool + Send,
{
    fn call(&mut self, main_loop: &dyn MainLoop, watch: WatchId) -> bool {
        self(main_loop, watch)
    }
}

/// What the proxy core needs from a host loop.
pub trait MainLoop: Send + Sync {
    fn add_io_read_watch(&self, fd: RawFd, callback: Box<dyn WatchCallback>) -> Option<WatchId>;
    fn add_io_write_watch(&self, fd: RawFd, callback: Box<dyn WatchCallback>) -> Option<WatchId>;
    fn add_timeout_watch(&self, interval: Duration, callback: Box<dyn WatchCallback>) -> Option<WatchId>;

    /// Remove a watch. Removing a watch from inside its own callback is
    /// allowed; `on_remove` then runs after the callback returns.
    fn remove_watch(&self, watch: WatchId);

    /// Whether the calling thread is the one running the loop.
    fn is_main_thread(&self) -> bool;

    /// Interrupt a blocking wait from another thread.
    fn wake_up(&self);
}

enum WatchKind {
    Read(RawFd),
    Write(RawFd),
    Timeout { interval: Duration, next: Instant },
}

struct WatchEntry {
    kind: WatchKind,
    /// `None` while the callback is running
    callback: Option<Box<dyn WatchCallback>>,
    removed: bool,
}

struct LoopState {
    watches: BTreeMap<u64, WatchEntry>,
    next_id: u64,
}

/// Single-threaded poll(2) loop with a self-pipe wake-up.
pub struct DefaultMainLoop {
    state: Mutex<LoopState>,
    owner: Mutex<ThreadId>,
    wake_reader: UnixStream,
    wake_writer: UnixStream,
    quit: AtomicBool,
}

impl DefaultMainLoop {
    pub fn new() -> io::Result<Self> {
        let (wake_reader, wake_writer) = UnixStream::pair()?;
        wake_reader.set_nonblocking(true)?;
        wake_writer.set_nonblocking(true)?;
        Ok(Self {
            state: Mutex::new(LoopState {
                watches: BTreeMap::new(),
                next_id: 1,
            }),
            owner: Mutex::new(thread::current().id()),
            wake_reader,
            wake_writer,
            quit: AtomicBool::new(false),
        })
    }

    pub fn watch_count(&self) -> usize {
        self.state
            .lock()
            .watches
            .values()
            .filter(|entry| !entry.removed)
            .count()
    }

    fn add_watch(&self, kind: WatchKind, callback: Box<dyn WatchCallback>) -> Option<WatchId> {
        let id = {
            let mut state = self.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.watches.insert(
                id,
                WatchEntry {
                    kind,
                    callback: Some(callback),
                    removed: false,
                },
            );
            id
        };
        if !self.is_main_thread() {
            self.wake_up();
        }
        Some(WatchId(id))
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        while let Ok(n) = (&self.wake_reader).read(&mut buf) {
            if n == 0 {
                break;
            }
        }
    }

    /// Wait for at most `max_wait` (forever with `None`) and run every
    /// ready callback once. Returns how many callbacks ran.
    pub fn run_once(&self, max_wait: Option<Duration>) -> io::Result<usize> {
        *self.owner.lock() = thread::current().id();

        let mut fds = vec![(0u64, self.wake_reader.as_raw_fd(), PollFlags::POLLIN)];
        let mut nearest: Option<Instant> = None;
        {
            let state = self.state.lock();
            for (id, entry) in &state.watches {
                if entry.removed {
                    continue;
                }
                match entry.kind {
                    WatchKind::Read(fd) => fds.push((*id, fd, PollFlags::POLLIN)),
                    WatchKind::Write(fd) => fds.push((*id, fd, PollFlags::POLLOUT)),
                    WatchKind::Timeout { next, .. } => {
                        nearest = Some(nearest.map_or(next, |n| n.min(next)));
                    }
                }
            }
        }

        let now = Instant::now();
        let wait = match (nearest.map(|n| n.saturating_duration_since(now)), max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let millis = wait.map_or(-1, |w| w.as_millis().min(i32::MAX as u128) as i32);

        let mut ready = Vec::new();
        {
            // SAFETY: every descriptor stays registered for the duration of the poll
            let borrowed: Vec<BorrowedFd<'_>> = fds
                .iter()
                .map(|(_, fd, _)| unsafe { BorrowedFd::borrow_raw(*fd) })
                .collect();
            let mut poll_fds: Vec<PollFd<'_>> = borrowed
                .iter()
                .zip(&fds)
                .map(|(fd, (_, _, flags))| PollFd::new(fd, *flags))
                .collect();
            match poll(&mut poll_fds, millis) {
                Ok(_) => {}
                Err(nix::errno::Errno::EINTR) => return Ok(0),
                Err(err) => return Err(io::Error::from(err)),
            }
            let fired = PollFlags::POLLIN | PollFlags::POLLOUT | PollFlags::POLLHUP | PollFlags::POLLERR;
            for (pfd, (id, _, _)) in poll_fds.iter().zip(&fds) {
                if pfd.revents().map_or(false, |r| r.intersects(fired)) {
                    if *id == 0 {
                        self.drain_wake_pipe();
                    } else {
                        ready.push(*id);
                    }
                }
            }
        }

        let now = Instant::now();
        {
            let state = self.state.lock();
            for (id, entry) in &state.watches {
                if let WatchKind::Timeout { next, .. } = entry.kind {
                    if next <= now && !entry.removed {
                        ready.push(*id);
                    }
                }
            }
        }

        let mut ran = 0;
        for id in ready {
            if self.fire(id) {
                ran += 1;
            }
        }
        Ok(ran)
    }

    fn fire(&self, id: u64) -> bool {
        let mut callback = {
            let mut state = self.state.lock();
            match state.watches.get_mut(&id) {
                Some(entry) if !entry.removed => match entry.callback.take() {
                    Some(callback) => callback,
                    None => return false,
                },
                _ => return false,
            }
        };

        let keep = callback.call(self, WatchId(id));

        let removed = {
            let mut state = self.state.lock();
            match state.watches.get_mut(&id) {
                Some(entry) if keep && !entry.removed => {
                    if let WatchKind::Timeout { interval, ref mut next } = entry.kind {
                        *next = Instant::now() + interval;
                    }
                    entry.callback = Some(callback);
                    None
                }
                _ => {
                    state.watches.remove(&id);
                    Some(callback)
                }
            }
        };
        if let Some(mut callback) = removed {
            trace!(watch = id, "Watch removed after callback");
            callback.on_remove(self, WatchId(id));
        }
        true
    }

    /// Run until [`DefaultMainLoop::quit`] is called.
    pub fn run(&self) -> io::Result<()> {
        self.quit.store(false, Ordering::Release);
        while !self.quit.load(Ordering::Acquire) {
            self.run_once(None)?;
        }
        Ok(())
    }

    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        self.wake_up();
    }

    /// Iterate until `done` holds or `timeout` passes. Returns whether
    /// `done` was reached.
    pub fn run_until(&self, mut done: impl FnMut() -> bool, timeout: Duration) -> io::Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if done() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            self.run_once(Some((deadline - now).min(Duration::from_millis(50))))?;
        }
    }
}

impl MainLoop for DefaultMainLoop {
    fn add_io_read_watch(&self, fd: RawFd, callback: Box<dyn WatchCallback>) -> Option<WatchId> {
        self.add_watch(WatchKind::Read(fd), callback)
    }

    fn add_io_write_watch(&self, fd: RawFd, callback: Box<dyn WatchCallback>) -> Option<WatchId> {
        self.add_watch(WatchKind::Write(fd), callback)
    }

    fn add_timeout_watch(&self, interval: Duration, callback: Box<dyn WatchCallback>) -> Option<WatchId> {
        let next = Instant::now() + interval;
        self.add_watch(WatchKind::Timeout { interval, next }, callback)
    }

    fn remove_watch(&self, watch: WatchId) {
        let callback = {
            let mut state = self.state.lock();
            let Some(entry) = state.watches.get_mut(&watch.0) else {
                return;
            };
            if entry.callback.is_none() {
                // running right now; `fire` finishes the removal
                entry.removed = true;
                return;
            }
            state.watches.remove(&watch.0).and_then(|entry| entry.callback)
        };
        if let Some(mut callback) = callback {
            callback.on_remove(self, watch);
        }
    }

    fn is_main_thread(&self) -> bool {
        *self.owner.lock() == thread::current().id()
    }

    fn wake_up(&self) {
        match (&self.wake_writer).write(&[1]) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => warn!(error = %err, "Failed to wake main loop"),
        }
    }
}

impl Drop for DefaultMainLoop {
    fn drop(&mut self) {
        let entries: Vec<(u64, WatchEntry)> = std::mem::take(&mut self.state.lock().watches).into_iter().collect();
        for (id, entry) in entries {
            if let Some(mut callback) = entry.callback {
                callback.on_remove(&*self, WatchId(id));
            }
        }
    }
}

impl std::fmt::Debug for DefaultMainLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultMainLoop")
            .field("watches", &self.watch_count())
            .finish()
    }
}
