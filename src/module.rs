//! The host-facing module contract.
//!
//! Every module declares a fixed panel of parameters, ports and lights at
//! construction, processes one frame at a time from the host's audio thread
//! and persists its configuration as an opaque JSON snapshot. The contract
//! is deliberately small: the host only ever talks to a `Box<dyn Module>`.

use std::any::Any;

use serde_json::Value;

use crate::port::{Light, Param, Port};
use crate::rack::Host;

/// Per-frame timing handed to [`Module::process`].
#[derive(Debug, Clone, Copy)]
pub struct ProcessArgs {
    pub sample_rate: f32,
    /// Duration of one frame in seconds, `1 / sample_rate`.
    pub sample_time: f32,
    pub frame: u64,
}

impl ProcessArgs {
    pub fn new(sample_rate: f32, frame: u64) -> Self {
        Self {
            sample_rate,
            sample_time: 1.0 / sample_rate,
            frame,
        }
    }
}

/// Static identity of a module type, used for neighbour matching and
/// snapshot headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleMeta {
    /// Collection the module ships in.
    pub plugin: &'static str,
    /// Model slug, unique within the plugin.
    pub model: &'static str,
    /// Human-readable display name.
    pub name: &'static str,
}

/// The fixed complement of parameters, ports and lights a module owns.
///
/// Counts are declared once at construction and never change; the host and
/// observers index into these slices directly.
#[derive(Debug, Default)]
pub struct Panel {
    pub params: Vec<Param>,
    pub inputs: Vec<Port>,
    pub outputs: Vec<Port>,
    pub lights: Vec<Light>,
}

impl Panel {
    pub fn new(num_inputs: usize, num_outputs: usize, num_lights: usize) -> Self {
        Self {
            params: Vec::new(),
            inputs: vec![Port::new(); num_inputs],
            outputs: vec![Port::new(); num_outputs],
            lights: vec![Light::default(); num_lights],
        }
    }

    /// Appends a parameter and returns its index.
    pub fn add_param(&mut self, param: Param) -> usize {
        self.params.push(param);
        self.params.len() - 1
    }

    /// Restores every parameter to its declared default.
    pub fn reset_params(&mut self) {
        for param in &mut self.params {
            param.reset();
        }
    }
}

/// A processing module driven by the host engine.
///
/// `process` is called exactly once per audio frame from the engine thread
/// and must never block, allocate or perform I/O. Lifecycle methods
/// (`reset`, `snapshot`, `restore`) are called from the UI thread under the
/// host's guarantee that they are mutually exclusive with `process`.
pub trait Module: Send {
    fn meta(&self) -> ModuleMeta;

    fn panel(&self) -> &Panel;

    fn panel_mut(&mut self) -> &mut Panel;

    /// Advances the module by one frame.
    fn process(&mut self, args: &ProcessArgs, host: &dyn Host);

    /// Restores default parameters and clears runtime state.
    fn reset(&mut self);

    /// Opaque persistent state. Unknown or out-of-range values in the blob
    /// handed to `restore` are replaced with defaults; restoration never
    /// fails.
    fn snapshot(&self) -> Value {
        Value::Null
    }

    fn restore(&mut self, _blob: &Value) {}

    /// Parameter handles this module owns. The host registers them when the
    /// module is added and deregisters them when it is removed.
    fn param_handles(&self) -> &[std::sync::Arc<crate::rack::ParamHandle>] {
        &[]
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
