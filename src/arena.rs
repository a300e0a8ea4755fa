//! Arena: a 2-D spatial mixer.
//!
//! Eight sources and two probes live in a unit square. Every sample, each
//! probe sums the sources whose influence circle it sits inside, weighted
//! by radial proximity, and emits the mean of the contributions. Positions
//! follow either the panel parameters or, when patched, a 0–10 V CV pair.

use serde_json::{json, Value};

use crate::digital::{ClockDivider, SchmittTrigger};
use crate::module::{Module, ModuleMeta, Panel, ProcessArgs};
use crate::port::Param;
use crate::rack::Host;
use crate::snapshot;

pub const IN_PORTS: usize = 8;
pub const OUT_PORTS: usize = 2;

pub const NUM_PARAMS: usize = IN_PORTS * 2 + OUT_PORTS * 2 + OUT_PORTS;
pub const NUM_INPUTS: usize = IN_PORTS * 3 + OUT_PORTS * 2;
pub const NUM_OUTPUTS: usize = OUT_PORTS;
pub const NUM_LIGHTS: usize = OUT_PORTS;

pub const fn param_in_x(i: usize) -> usize {
    i
}
pub const fn param_in_y(i: usize) -> usize {
    IN_PORTS + i
}
pub const fn param_out_x(i: usize) -> usize {
    IN_PORTS * 2 + i
}
pub const fn param_out_y(i: usize) -> usize {
    IN_PORTS * 2 + OUT_PORTS + i
}
pub const fn param_out_sel(i: usize) -> usize {
    IN_PORTS * 2 + OUT_PORTS * 2 + i
}

pub const fn input_signal(i: usize) -> usize {
    i
}
pub const fn input_in_x(i: usize) -> usize {
    IN_PORTS + i
}
pub const fn input_in_y(i: usize) -> usize {
    IN_PORTS * 2 + i
}
pub const fn input_out_x(i: usize) -> usize {
    IN_PORTS * 3 + i
}
pub const fn input_out_y(i: usize) -> usize {
    IN_PORTS * 3 + OUT_PORTS + i
}

/// What kind of handle an observer has selected on the field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionKind {
    Input,
    Output,
}

pub struct Arena {
    panel: Panel,

    radius: [f32; IN_PORTS],
    /// Distances recomputed every frame; observers draw connection beams
    /// from them.
    dist: [[f32; IN_PORTS]; OUT_PORTS],
    selection: Option<(SelectionKind, usize)>,

    out_sel_trigger: [SchmittTrigger; OUT_PORTS],
    light_divider: ClockDivider,
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}

impl Arena {
    pub fn new() -> Self {
        let mut panel = Panel::new(NUM_INPUTS, NUM_OUTPUTS, NUM_LIGHTS);
        for i in 0..IN_PORTS {
            panel.add_param(Param::new(0.0, 1.0, 0.1, format!("Input {} x", i + 1)));
        }
        for i in 0..IN_PORTS {
            let default = 0.1 + i as f32 * (0.8 / (IN_PORTS - 1) as f32);
            panel.add_param(Param::new(0.0, 1.0, default, format!("Input {} y", i + 1)));
        }
        for i in 0..OUT_PORTS {
            panel.add_param(Param::new(0.0, 1.0, 0.9, format!("Output {} x", i + 1)));
        }
        for i in 0..OUT_PORTS {
            let default = 0.1 + i as f32 * (0.8 / (OUT_PORTS - 1) as f32);
            panel.add_param(Param::new(0.0, 1.0, default, format!("Output {} y", i + 1)));
        }
        for i in 0..OUT_PORTS {
            panel.add_param(Param::new(0.0, 1.0, 0.0, format!("Output {} select", i + 1)));
        }

        let mut module = Self {
            panel,
            radius: [0.5; IN_PORTS],
            dist: [[0.0; IN_PORTS]; OUT_PORTS],
            selection: None,
            out_sel_trigger: Default::default(),
            light_divider: ClockDivider::new(512),
        };
        module.reset();
        module
    }

    pub fn radius(&self, input: usize) -> f32 {
        self.radius[input]
    }

    /// UI entry point; safe while `process` is not running.
    pub fn set_radius(&mut self, input: usize, radius: f32) {
        self.radius[input] = radius.clamp(0.0, 1.0);
    }

    /// Distance between output probe `output` and source `input`, as of the
    /// last processed frame.
    pub fn distance(&self, output: usize, input: usize) -> f32 {
        self.dist[output][input]
    }

    pub fn set_selection(&mut self, kind: SelectionKind, id: usize) {
        self.selection = Some((kind, id));
    }

    pub fn reset_selection(&mut self) {
        self.selection = None;
    }

    pub fn is_selected(&self, kind: SelectionKind, id: usize) -> bool {
        self.selection == Some((kind, id))
    }
}

impl Module for Arena {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            plugin: "RackPack",
            model: "Arena",
            name: "Arena",
        }
    }

    fn panel(&self) -> &Panel {
        &self.panel
    }

    fn panel_mut(&mut self) -> &mut Panel {
        &mut self.panel
    }

    fn process(&mut self, _args: &ProcessArgs, _host: &dyn Host) {
        // A patched position CV overrides the panel parameter.
        for i in 0..IN_PORTS {
            if self.panel.inputs[input_in_x(i)].is_connected() {
                let x = (self.panel.inputs[input_in_x(i)].voltage(0) / 10.0).clamp(0.0, 1.0);
                self.panel.params[param_in_x(i)].set_value(x);
            }
            if self.panel.inputs[input_in_y(i)].is_connected() {
                let y = (self.panel.inputs[input_in_y(i)].voltage(0) / 10.0).clamp(0.0, 1.0);
                self.panel.params[param_in_y(i)].set_value(y);
            }
        }

        for j in 0..OUT_PORTS {
            if self.panel.inputs[input_out_x(j)].is_connected() {
                let x = (self.panel.inputs[input_out_x(j)].voltage(0) / 10.0).clamp(0.0, 1.0);
                self.panel.params[param_out_x(j)].set_value(x);
            }
            if self.panel.inputs[input_out_y(j)].is_connected() {
                let y = (self.panel.inputs[input_out_y(j)].voltage(0) / 10.0).clamp(0.0, 1.0);
                self.panel.params[param_out_y(j)].set_value(y);
            }

            let px = self.panel.params[param_out_x(j)].value();
            let py = self.panel.params[param_out_y(j)].value();

            let mut count = 0;
            let mut out = 0.0f32;
            for i in 0..IN_PORTS {
                let dx = self.panel.params[param_in_x(i)].value() - px;
                let dy = self.panel.params[param_in_y(i)].value() - py;
                let d = (dx * dx + dy * dy).sqrt();
                self.dist[j][i] = d;

                let r = self.radius[i];
                if self.panel.inputs[input_signal(i)].is_connected() && d < r {
                    let s = ((r - d) / r * 1.1).min(1.0);
                    out += self.panel.inputs[input_signal(i)].voltage(0).clamp(0.0, 10.0) * s;
                    count += 1;
                }
            }

            // The mean of the contributions, not their sum.
            if count > 0 {
                out /= count as f32;
            }
            self.panel.outputs[j].set_voltage(0, out);

            if self.out_sel_trigger[j].process(self.panel.params[param_out_sel(j)].value()) {
                self.selection = Some((SelectionKind::Output, j));
            }
        }

        if self.light_divider.tick() {
            for j in 0..OUT_PORTS {
                let lit = self.selection == Some((SelectionKind::Output, j));
                self.panel.lights[j].set_brightness(lit as u8 as f32);
            }
        }
    }

    fn reset(&mut self) {
        self.selection = None;
        self.radius = [0.5; IN_PORTS];
        self.dist = [[0.0; IN_PORTS]; OUT_PORTS];
        self.panel.reset_params();
    }

    fn snapshot(&self) -> Value {
        json!({ "radius": self.radius.to_vec() })
    }

    fn restore(&mut self, blob: &Value) {
        if let Some(radius) = snapshot::array(blob, "radius") {
            for (i, v) in radius.iter().take(IN_PORTS).enumerate() {
                self.radius[i] = (v.as_f64().unwrap_or(0.5) as f32).clamp(0.0, 1.0);
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rack::NullHost;

    fn run(module: &mut Arena, frames: usize) {
        for f in 0..frames {
            let args = ProcessArgs::new(48000.0, f as u64);
            module.process(&args, &NullHost);
        }
    }

    fn place_input(m: &mut Arena, i: usize, x: f32, y: f32, v: f32) {
        m.panel_mut().params[param_in_x(i)].set_value(x);
        m.panel_mut().params[param_in_y(i)].set_value(y);
        m.panel_mut().inputs[input_signal(i)].set_connected(true);
        m.panel_mut().inputs[input_signal(i)].set_voltage(0, v);
    }

    fn place_output(m: &mut Arena, j: usize, x: f32, y: f32) {
        m.panel_mut().params[param_out_x(j)].set_value(x);
        m.panel_mut().params[param_out_y(j)].set_value(y);
    }

    #[test]
    fn test_coincident_source_passes_full_level() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.5, 0.5, 10.0);
        place_output(&mut m, 0, 0.5, 0.5);
        run(&mut m, 1);
        // The 1.1 coefficient saturates to a flat plateau at the centre.
        assert_eq!(m.panel().outputs[0].voltage(0), 10.0);
    }

    #[test]
    fn test_out_of_radius_source_is_silent() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.1, 0.1, 10.0);
        m.set_radius(0, 0.2);
        place_output(&mut m, 0, 0.9, 0.9);
        run(&mut m, 1);
        assert_eq!(m.panel().outputs[0].voltage(0), 0.0);
    }

    #[test]
    fn test_distance_exactly_radius_is_silent() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.2, 0.5, 10.0);
        m.set_radius(0, 0.3);
        place_output(&mut m, 0, 0.5, 0.5);
        run(&mut m, 1);
        assert!((m.distance(0, 0) - 0.3).abs() < 1e-6);
        assert_eq!(m.panel().outputs[0].voltage(0), 0.0);
    }

    #[test]
    fn test_proximity_weight() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.5, 0.5, 10.0);
        place_output(&mut m, 0, 0.75, 0.5);
        run(&mut m, 1);
        // d = 0.25, r = 0.5: weight = (0.25 / 0.5) * 1.1 = 0.55.
        let v = m.panel().outputs[0].voltage(0);
        assert!((v - 5.5).abs() < 1e-3, "weighted output {}", v);
    }

    #[test]
    fn test_output_is_mean_not_sum() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.5, 0.5, 10.0);
        place_input(&mut m, 1, 0.5, 0.5, 4.0);
        place_output(&mut m, 0, 0.5, 0.5);
        run(&mut m, 1);
        assert_eq!(m.panel().outputs[0].voltage(0), 7.0);
    }

    #[test]
    fn test_input_clamped_to_unipolar_range() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.5, 0.5, -5.0);
        place_output(&mut m, 0, 0.5, 0.5);
        run(&mut m, 1);
        assert_eq!(m.panel().outputs[0].voltage(0), 0.0);
    }

    #[test]
    fn test_position_cv_overrides_parameter() {
        let mut m = Arena::new();
        place_input(&mut m, 0, 0.9, 0.9, 10.0);
        place_output(&mut m, 0, 0.5, 0.5);
        // Drag the source onto the probe with CV.
        m.panel_mut().inputs[input_in_x(0)].set_connected(true);
        m.panel_mut().inputs[input_in_x(0)].set_voltage(0, 5.0);
        m.panel_mut().inputs[input_in_y(0)].set_connected(true);
        m.panel_mut().inputs[input_in_y(0)].set_voltage(0, 5.0);
        run(&mut m, 1);
        assert_eq!(m.panel().params[param_in_x(0)].value(), 0.5);
        assert_eq!(m.panel().outputs[0].voltage(0), 10.0);
    }

    #[test]
    fn test_selection_follows_select_button() {
        let mut m = Arena::new();
        m.panel_mut().params[param_out_sel(1)].set_value(1.0);
        run(&mut m, 1);
        assert!(m.is_selected(SelectionKind::Output, 1));
        assert!(!m.is_selected(SelectionKind::Output, 0));
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut m = Arena::new();
        m.set_radius(3, 0.25);
        let blob = m.snapshot();
        let mut restored = Arena::new();
        restored.restore(&blob);
        assert_eq!(restored.radius(3), 0.25);
        // Garbage values clamp instead of failing.
        restored.restore(&serde_json::json!({ "radius": [9.0, -1.0] }));
        assert_eq!(restored.radius(0), 1.0);
        assert_eq!(restored.radius(1), 0.0);
    }
}
