//! Pause and abort surface shared by every long-running installer component

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How long paused loops sleep between checks
pub const PAUSE_POLL: Duration = Duration::from_millis(50);

/// A component the installer can pause or abort
pub trait Controllable: Send + Sync {
    fn set_paused(&self, paused: bool);
    fn abort(&self);
}

/// Pause and abort flags polled by worker loops
#[derive(Debug, Default)]
pub struct ControlFlags {
    paused: AtomicBool,
    aborted: AtomicBool,
}

impl ControlFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Block while paused. Returns early on abort.
    pub fn wait_while_paused(&self) {
        while self.is_paused() && !self.is_aborted() {
            std::thread::sleep(PAUSE_POLL);
        }
    }
}

impl Controllable for ControlFlags {
    fn set_paused(&self, paused: bool) {
        ControlFlags::set_paused(self, paused);
    }

    fn abort(&self) {
        ControlFlags::abort(self);
    }
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<Arc<dyn Controllable>>,
    paused: bool,
    aborted: bool,
}

/// Set of controllables currently running for the installer.
///
/// Remembers the last pause and abort request so components registered
/// later start in the same state.
#[derive(Default)]
pub struct ControlRegistry {
    state: Mutex<RegistryState>,
}

impl ControlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, controllable: Arc<dyn Controllable>) {
        let mut state = self.state.lock().unwrap();
        if state.paused {
            controllable.set_paused(true);
        }
        if state.aborted {
            controllable.abort();
        }
        state.entries.push(controllable);
    }

    pub fn unregister(&self, controllable: &Arc<dyn Controllable>) {
        let target = Arc::as_ptr(controllable) as *const ();
        self.state
            .lock()
            .unwrap()
            .entries
            .retain(|c| Arc::as_ptr(c) as *const () != target);
    }

    pub fn set_paused(&self, paused: bool) {
        let mut state = self.state.lock().unwrap();
        state.paused = paused;
        for c in state.entries.iter() {
            c.set_paused(paused);
        }
    }

    pub fn abort_all(&self) {
        let mut state = self.state.lock().unwrap();
        state.aborted = true;
        for c in state.entries.iter() {
            c.abort();
        }
    }

    /// Forget a previous abort before another attempt
    pub fn reset_abort(&self) {
        self.state.lock().unwrap().aborted = false;
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().unwrap().aborted
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registration that lasts for one phase
pub struct ScopedControllable<'a> {
    registry: &'a ControlRegistry,
    controllable: Arc<dyn Controllable>,
}

impl<'a> ScopedControllable<'a> {
    pub fn new(registry: &'a ControlRegistry, controllable: Arc<dyn Controllable>) -> Self {
        registry.register(controllable.clone());
        Self {
            registry,
            controllable,
        }
    }
}

impl Drop for ScopedControllable<'_> {
    fn drop(&mut self) {
        self.registry.unregister(&self.controllable);
    }
}
