//! # RackPack: scene-aware mixing and preset sequencing modules
//!
//! `rackpack` is a collection of interacting modules for a modular
//! audio-synthesis environment, built around a push-driven, fixed-step
//! engine: the host calls [`Module::process`](module::Module::process) once
//! per audio frame on every module, and modules never block, allocate or
//! perform I/O on that path.
//!
//! ## Architecture
//!
//! The crate is organised in three layers:
//!
//! - **Primitives** — [`digital`] holds the small per-sample state machines
//!   (clock dividers, Schmitt triggers, linear fades, long-press decoding);
//!   [`port`] holds the signal-level conventions (16-channel ports, ranged
//!   parameters, smoothed lights).
//! - **Host contract** — [`module`] defines the type-erased module
//!   interface, [`rack`] the thin host that dispatches frames, answers
//!   neighbour queries and arbitrates parameter handles.
//! - **Modules** — [`intermix`] (scene-aware 8×8 matrix mixer), [`arena`]
//!   (2-D spatial mixer), [`eightface`] (preset sequencer with a
//!   worker-thread restore path) and [`cvmap`] (CV to parameter bridge over
//!   the shared [`map_core`]).
//!
//! ## Quick start
//!
//! ```
//! use rackpack::prelude::*;
//! use rackpack::intermix::param_matrix;
//!
//! // Build a rack with a matrix mixer at 48 kHz.
//! let mut rack = Rack::new(48000.0);
//! let mix = rack.add_module(Box::new(Intermix::new()));
//!
//! // Route input 1 to output 1 and feed it +5 V.
//! rack.with_module::<Intermix, _>(mix, |m| {
//!     m.panel_mut().inputs[0].set_connected(true);
//!     m.panel_mut().inputs[0].set_voltage(0, 5.0);
//! }).unwrap();
//! rack.set_param(mix, param_matrix(0, 0), 1.0);
//!
//! // One scene-poll period later the routing is live.
//! rack.process_frames(32);
//! let out = rack
//!     .with_module::<Intermix, _>(mix, |m| m.panel().outputs[0].voltage(0))
//!     .unwrap();
//! assert_eq!(out, 5.0);
//! ```

pub mod arena;
pub mod cvmap;
pub mod digital;
pub mod eightface;
pub mod intermix;
pub mod map_core;
pub mod module;
pub mod port;
pub mod rack;
mod snapshot;

/// Prelude module for convenient imports
pub mod prelude {
    // Primitives
    pub use crate::digital::{
        ButtonEvent, ClockDivider, LinearFade, LongPressButton, OnePoleFilter, PulseGenerator,
        SchmittTrigger,
    };
    pub use crate::port::{rescale, Light, Param, Port, PORT_MAX_CHANNELS};

    // Host contract
    pub use crate::module::{Module, ModuleMeta, Panel, ProcessArgs};
    pub use crate::rack::{
        Host, HostError, ModuleCell, ModuleId, Neighbour, NullHost, ParamHandle, Rack, Side,
    };

    // Modules
    pub use crate::arena::{Arena, SelectionKind};
    pub use crate::cvmap::CvMap;
    pub use crate::eightface::{Connected, EightFace, SlotCvMode};
    pub use crate::intermix::{InMode, Intermix, OutMode, SceneCvMode, SceneData};
    pub use crate::map_core::{HandleIndicator, MapCore};
}

// Re-export key types at crate root for convenience
pub use prelude::*;
