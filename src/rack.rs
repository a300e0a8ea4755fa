//! The rack: a thin host harness driving the modules.
//!
//! The rack owns every module, dispatches `process` once per frame in rack
//! order, answers neighbour queries (rack order is physical adjacency) and
//! arbitrates the parameter-handle registry that mapping modules use to
//! reach other modules' parameters.
//!
//! Each module lives in a [`ModuleCell`] behind a mutex. The engine thread
//! holds a module's lock only while that module processes; a restore worker
//! holds it only while applying a snapshot. This realises the host's
//! guarantee that lifecycle calls are mutually exclusive with `process`
//! without any global lock.

use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};

use serde_json::Value;
use slotmap::{Key, KeyData, SlotMap};

use crate::module::{Module, ModuleMeta, ProcessArgs};

slotmap::new_key_type! {
    /// Stable identifier of a module within a rack.
    pub struct ModuleId;
}

impl ModuleId {
    /// Round-trip encoding used by snapshots; unmapped ids encode as -1.
    pub fn to_snapshot(self) -> i64 {
        if self.is_null() {
            -1
        } else {
            self.data().as_ffi() as i64
        }
    }

    pub fn from_snapshot(raw: i64) -> Self {
        if raw < 0 {
            Self::null()
        } else {
            KeyData::from_ffi(raw as u64).into()
        }
    }
}

/// Which side of a module to look for its expander neighbour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Errors surfaced to the host. Everything else in the crate recovers
/// silently; only failing to start a worker thread is fatal.
#[derive(Debug)]
pub enum HostError {
    WorkerSpawn(std::io::Error),
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostError::WorkerSpawn(e) => write!(f, "failed to spawn restore worker: {}", e),
        }
    }
}

impl std::error::Error for HostError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            HostError::WorkerSpawn(e) => Some(e),
        }
    }
}

/// A module and its static identity, shareable across threads.
pub struct ModuleCell {
    meta: ModuleMeta,
    inner: Mutex<Box<dyn Module>>,
}

impl ModuleCell {
    pub fn new(module: Box<dyn Module>) -> Self {
        Self {
            meta: module.meta(),
            inner: Mutex::new(module),
        }
    }

    pub fn meta(&self) -> ModuleMeta {
        self.meta
    }

    /// Locks the module, recovering from a poisoned mutex: a panicking
    /// module must not wedge the rest of the rack.
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Module>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Non-blocking lock for paths the audio thread must never wait on.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, Box<dyn Module>>> {
        match self.inner.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    pub fn snapshot(&self) -> Value {
        self.lock().snapshot()
    }

    pub fn restore(&self, blob: &Value) {
        self.lock().restore(blob);
    }
}

/// An adjacent module, as returned by [`Host::neighbour`].
#[derive(Clone)]
pub struct Neighbour {
    pub id: ModuleId,
    pub cell: Arc<ModuleCell>,
}

impl Neighbour {
    pub fn meta(&self) -> ModuleMeta {
        self.cell.meta()
    }
}

/// An indirect, revalidated reference to a remote module's parameter.
///
/// The fields live in atomics so the audio thread reads a handle without
/// taking a lock; a handle whose target vanished between frames simply
/// fails resolution and is skipped for that frame.
#[derive(Debug)]
pub struct ParamHandle {
    module_id: AtomicU64,
    param_id: AtomicUsize,
}

impl Default for ParamHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ParamHandle {
    pub fn new() -> Self {
        Self {
            module_id: AtomicU64::new(ModuleId::null().data().as_ffi()),
            param_id: AtomicUsize::new(0),
        }
    }

    pub fn module_id(&self) -> ModuleId {
        KeyData::from_ffi(self.module_id.load(Ordering::Relaxed)).into()
    }

    pub fn param_id(&self) -> usize {
        self.param_id.load(Ordering::Relaxed)
    }

    pub fn is_mapped(&self) -> bool {
        !self.module_id().is_null()
    }

    pub fn assign(&self, module: ModuleId, param: usize) {
        self.param_id.store(param, Ordering::Relaxed);
        self.module_id
            .store(module.data().as_ffi(), Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.module_id
            .store(ModuleId::null().data().as_ffi(), Ordering::Relaxed);
        self.param_id.store(0, Ordering::Relaxed);
    }
}

/// The services a module may call during `process`.
///
/// Implemented per module by the rack so neighbour queries are relative to
/// the calling module; the [`NullHost`] stands in when a module is driven
/// standalone (handles dangle, neighbours are absent).
pub trait Host {
    fn neighbour(&self, side: Side) -> Option<Neighbour>;

    /// Declared `[min, max]` of a remote parameter, or `None` if the module
    /// is gone, the index is bad, or the target is busy this frame.
    fn param_bounds(&self, module: ModuleId, param: usize) -> Option<(f32, f32)>;

    /// Writes a remote parameter, clamped to its declared range. Returns
    /// false when the target cannot be reached this frame.
    fn set_param(&self, module: ModuleId, param: usize, value: f32) -> bool;
}

/// Host implementation with no rack behind it.
pub struct NullHost;

impl Host for NullHost {
    fn neighbour(&self, _side: Side) -> Option<Neighbour> {
        None
    }

    fn param_bounds(&self, _module: ModuleId, _param: usize) -> Option<(f32, f32)> {
        None
    }

    fn set_param(&self, _module: ModuleId, _param: usize, _value: f32) -> bool {
        false
    }
}

/// Per-module view of the rack handed to `process`.
pub struct ModuleHost<'a> {
    rack: &'a Rack,
    id: ModuleId,
}

impl Host for ModuleHost<'_> {
    fn neighbour(&self, side: Side) -> Option<Neighbour> {
        self.rack.neighbour_of(self.id, side)
    }

    fn param_bounds(&self, module: ModuleId, param: usize) -> Option<(f32, f32)> {
        self.rack.param_bounds(module, param)
    }

    fn set_param(&self, module: ModuleId, param: usize, value: f32) -> bool {
        self.rack.set_param(module, param, value)
    }
}

/// Module store, dispatch loop and parameter-handle registry.
pub struct Rack {
    sample_rate: f32,
    frame: u64,
    modules: SlotMap<ModuleId, Arc<ModuleCell>>,
    /// Physical order, left to right; adjacency for expander queries.
    row: Vec<ModuleId>,
    handles: Mutex<Vec<Arc<ParamHandle>>>,
}

impl Rack {
    pub fn new(sample_rate: f32) -> Self {
        Self {
            sample_rate,
            frame: 0,
            modules: SlotMap::with_key(),
            row: Vec::new(),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Adds a module at the right end of the row and registers its
    /// parameter handles.
    pub fn add_module(&mut self, module: Box<dyn Module>) -> ModuleId {
        let handles: Vec<_> = module.param_handles().to_vec();
        let cell = Arc::new(ModuleCell::new(module));
        let meta = cell.meta();
        let id = self.modules.insert(cell);
        self.row.push(id);
        self.lock_handles().extend(handles);
        log::debug!("added module {}:{}", meta.plugin, meta.model);
        id
    }

    /// Removes a module, deregisters its handles and unmaps every handle
    /// that pointed at it.
    pub fn remove_module(&mut self, id: ModuleId) -> bool {
        let Some(cell) = self.modules.remove(id) else {
            return false;
        };
        self.row.retain(|&m| m != id);
        let owned: Vec<_> = cell.lock().param_handles().to_vec();
        let mut handles = self.lock_handles();
        handles.retain(|h| !owned.iter().any(|o| Arc::ptr_eq(h, o)));
        for handle in handles.iter() {
            if handle.module_id() == id {
                handle.clear();
            }
        }
        log::debug!("removed module {}:{}", cell.meta().plugin, cell.meta().model);
        true
    }

    pub fn module(&self, id: ModuleId) -> Option<Arc<ModuleCell>> {
        self.modules.get(id).cloned()
    }

    pub fn row(&self) -> &[ModuleId] {
        &self.row
    }

    /// Locks a module and passes its concrete type to `f`. Returns `None`
    /// if the id is stale or the module is of a different type.
    pub fn with_module<M: Module + 'static, R>(
        &self,
        id: ModuleId,
        f: impl FnOnce(&mut M) -> R,
    ) -> Option<R> {
        let cell = self.module(id)?;
        let mut guard = cell.lock();
        let module = guard.as_any_mut().downcast_mut::<M>()?;
        Some(f(module))
    }

    /// Dispatches one frame to every module in rack order.
    pub fn process_frame(&mut self) {
        let args = ProcessArgs::new(self.sample_rate, self.frame);
        for i in 0..self.row.len() {
            let id = self.row[i];
            let Some(cell) = self.modules.get(id).cloned() else {
                continue;
            };
            let host = ModuleHost { rack: &*self, id };
            cell.lock().process(&args, &host);
        }
        self.frame += 1;
    }

    pub fn process_frames(&mut self, frames: usize) {
        for _ in 0..frames {
            self.process_frame();
        }
    }

    fn neighbour_of(&self, of: ModuleId, side: Side) -> Option<Neighbour> {
        let pos = self.row.iter().position(|&m| m == of)?;
        let pos = match side {
            Side::Left => pos.checked_sub(1)?,
            Side::Right => pos + 1,
        };
        let id = *self.row.get(pos)?;
        let cell = self.modules.get(id)?.clone();
        Some(Neighbour { id, cell })
    }

    pub fn param_bounds(&self, module: ModuleId, param: usize) -> Option<(f32, f32)> {
        let cell = self.modules.get(module)?;
        let guard = cell.try_lock()?;
        let p = guard.panel().params.get(param)?;
        Some((p.min(), p.max()))
    }

    /// Atomic with respect to the engine: the write happens under the
    /// target module's lock and never blocks the caller.
    pub fn set_param(&self, module: ModuleId, param: usize, value: f32) -> bool {
        let Some(cell) = self.modules.get(module) else {
            return false;
        };
        let Some(mut guard) = cell.try_lock() else {
            return false;
        };
        match guard.panel_mut().params.get_mut(param) {
            Some(p) => {
                p.set_value(value);
                true
            }
            None => false,
        }
    }

    /// Points `handle` at a remote parameter, maintaining the registry
    /// invariant that each parameter has at most one owner. With
    /// `overwrite` the previous owner is cleared; without it the request is
    /// rejected when the target is already owned.
    pub fn update_param_handle(
        &self,
        handle: &Arc<ParamHandle>,
        module: ModuleId,
        param: usize,
        overwrite: bool,
    ) -> bool {
        if module.is_null() {
            handle.clear();
            return true;
        }
        let handles = self.lock_handles();
        for other in handles.iter() {
            if Arc::ptr_eq(other, handle) {
                continue;
            }
            if other.is_mapped() && other.module_id() == module && other.param_id() == param {
                if !overwrite {
                    return false;
                }
                other.clear();
            }
        }
        handle.assign(module, param);
        true
    }

    fn lock_handles(&self) -> MutexGuard<'_, Vec<Arc<ParamHandle>>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn handle_count(&self) -> usize {
        self.lock_handles().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Panel;
    use crate::port::Param;

    /// Minimal module for exercising the rack: out = in * gain.
    struct Gain {
        panel: Panel,
        handles: Vec<Arc<ParamHandle>>,
    }

    impl Gain {
        fn new() -> Self {
            let mut panel = Panel::new(1, 1, 0);
            panel.add_param(Param::new(0.0, 2.0, 1.0, "Gain"));
            Self {
                panel,
                handles: vec![Arc::new(ParamHandle::new())],
            }
        }
    }

    impl Module for Gain {
        fn meta(&self) -> ModuleMeta {
            ModuleMeta {
                plugin: "RackPack",
                model: "Gain",
                name: "Gain",
            }
        }

        fn panel(&self) -> &Panel {
            &self.panel
        }

        fn panel_mut(&mut self) -> &mut Panel {
            &mut self.panel
        }

        fn process(&mut self, _args: &ProcessArgs, _host: &dyn Host) {
            let v = self.panel.inputs[0].voltage(0) * self.panel.params[0].value();
            self.panel.outputs[0].set_voltage(0, v);
        }

        fn reset(&mut self) {
            self.panel.reset_params();
        }

        fn param_handles(&self) -> &[Arc<ParamHandle>] {
            &self.handles
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    #[test]
    fn test_dispatch_and_param_write() {
        let mut rack = Rack::new(48000.0);
        let id = rack.add_module(Box::new(Gain::new()));
        rack.with_module::<Gain, _>(id, |g| {
            g.panel.inputs[0].set_connected(true);
            g.panel.inputs[0].set_voltage(0, 2.0);
        }).unwrap();
        assert!(rack.set_param(id, 0, 1.5));
        rack.process_frame();
        let out = rack
            .with_module::<Gain, _>(id, |g| g.panel.outputs[0].voltage(0))
            .expect("module exists");
        assert_eq!(out, 3.0);
        assert_eq!(rack.frame(), 1);
    }

    #[test]
    fn test_set_param_clamps_and_validates() {
        let mut rack = Rack::new(48000.0);
        let id = rack.add_module(Box::new(Gain::new()));
        assert!(rack.set_param(id, 0, 99.0));
        assert_eq!(rack.param_bounds(id, 0), Some((0.0, 2.0)));
        let v = rack
            .with_module::<Gain, _>(id, |g| g.panel.params[0].value())
            .expect("module exists");
        assert_eq!(v, 2.0);
        assert!(!rack.set_param(id, 7, 1.0));
        rack.remove_module(id);
        assert!(!rack.set_param(id, 0, 1.0));
    }

    #[test]
    fn test_neighbour_sides() {
        let mut rack = Rack::new(48000.0);
        let a = rack.add_module(Box::new(Gain::new()));
        let b = rack.add_module(Box::new(Gain::new()));
        let c = rack.add_module(Box::new(Gain::new()));
        assert_eq!(rack.neighbour_of(b, Side::Left).map(|n| n.id), Some(a));
        assert_eq!(rack.neighbour_of(b, Side::Right).map(|n| n.id), Some(c));
        assert!(rack.neighbour_of(a, Side::Left).is_none());
        assert!(rack.neighbour_of(c, Side::Right).is_none());
        rack.remove_module(b);
        assert_eq!(rack.neighbour_of(a, Side::Right).map(|n| n.id), Some(c));
    }

    #[test]
    fn test_handle_registry_dedup() {
        let mut rack = Rack::new(48000.0);
        let a = rack.add_module(Box::new(Gain::new()));
        let b = rack.add_module(Box::new(Gain::new()));
        let h1 = Arc::new(ParamHandle::new());
        let h2 = Arc::new(ParamHandle::new());
        rack.lock_handles().push(h1.clone());
        rack.lock_handles().push(h2.clone());

        assert!(rack.update_param_handle(&h1, a, 0, true));
        // Mapping the same parameter elsewhere steals it.
        assert!(rack.update_param_handle(&h2, a, 0, true));
        assert!(!h1.is_mapped());
        assert!(h2.is_mapped());
        // Without overwrite the request is rejected.
        assert!(!rack.update_param_handle(&h1, a, 0, false));
        assert!(rack.update_param_handle(&h1, b, 0, false));
    }

    #[test]
    fn test_remove_module_clears_pointing_handles() {
        let mut rack = Rack::new(48000.0);
        let a = rack.add_module(Box::new(Gain::new()));
        let b = rack.add_module(Box::new(Gain::new()));
        // Two Gain modules, each registering one handle.
        assert_eq!(rack.handle_count(), 2);
        let handle = rack
            .with_module::<Gain, _>(a, |g| g.handles[0].clone())
            .expect("module exists");
        rack.update_param_handle(&handle, b, 0, true);
        assert!(handle.is_mapped());
        rack.remove_module(b);
        // b's own handle is gone, a's handle no longer points anywhere.
        assert_eq!(rack.handle_count(), 1);
        assert!(!handle.is_mapped());
    }

    #[test]
    fn test_module_id_snapshot_round_trip() {
        let mut rack = Rack::new(48000.0);
        let id = rack.add_module(Box::new(Gain::new()));
        let raw = id.to_snapshot();
        assert_eq!(ModuleId::from_snapshot(raw), id);
        assert!(ModuleId::from_snapshot(-1).is_null());
    }
}
