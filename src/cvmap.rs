//! CVMap: a control-voltage to parameter bridge.
//!
//! Thirty-two channels across two 16-channel poly inputs, each mapped to a
//! remote module's parameter through a revalidated handle. Per frame the
//! incoming voltage is rescaled to the target's declared range, smoothed
//! with a one-pole filter and written through the host. Handles whose
//! target vanished are skipped silently.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::digital::ClockDivider;
use crate::map_core::MapCore;
use crate::module::{Module, ModuleMeta, Panel, ProcessArgs};
use crate::port::{rescale, PORT_MAX_CHANNELS};
use crate::rack::{Host, ModuleId, ParamHandle, Rack};
use crate::snapshot;

pub const MAX_CHANNELS: usize = 32;

pub const INPUT_POLY1: usize = 0;
pub const INPUT_POLY2: usize = 1;
pub const NUM_INPUTS: usize = 2;
pub const NUM_LIGHTS: usize = MAX_CHANNELS;

pub struct CvMap {
    panel: Panel,
    core: MapCore,
    /// When set, inputs are treated as ±5 V and centred before rescaling.
    bipolar_input: bool,
    light_divider: ClockDivider,
}

impl Default for CvMap {
    fn default() -> Self {
        Self::new()
    }
}

impl CvMap {
    pub fn new() -> Self {
        Self {
            panel: Panel::new(NUM_INPUTS, 0, NUM_LIGHTS),
            core: MapCore::new(MAX_CHANNELS),
            bipolar_input: false,
            light_divider: ClockDivider::new(512),
        }
    }

    pub fn map_len(&self) -> usize {
        self.core.map_len()
    }

    pub fn bipolar_input(&self) -> bool {
        self.bipolar_input
    }

    /// UI entry point; safe while `process` is not running.
    pub fn set_bipolar_input(&mut self, on: bool) {
        self.bipolar_input = on;
    }

    pub fn text_scrolling(&self) -> bool {
        self.core.text_scrolling()
    }

    pub fn set_text_scrolling(&mut self, on: bool) {
        self.core.set_text_scrolling(on);
    }

    pub fn core(&self) -> &MapCore {
        &self.core
    }

    pub fn enable_learn(&mut self, id: usize) {
        self.core.enable_learn(id);
    }

    pub fn disable_learn(&mut self, id: usize) {
        self.core.disable_learn(id);
    }

    pub fn learn_param(&mut self, id: usize, module: ModuleId, param: usize, rack: &Rack) {
        self.core.learn_param(id, module, param, rack);
    }

    pub fn clear_map(&mut self, id: usize, rack: &Rack) {
        self.core.clear_map(id, rack);
    }

    pub fn clear_maps(&mut self, rack: &Rack) {
        self.core.clear_maps(rack);
    }

    /// Blinks the mapped parameter's indicator so the user can find it.
    pub fn indicate(&mut self, id: usize) {
        self.core.indicator_mut(id).indicate();
    }

    fn channel_voltage(&self, id: usize) -> f32 {
        if id < PORT_MAX_CHANNELS {
            self.panel.inputs[INPUT_POLY1].voltage(id)
        } else {
            self.panel.inputs[INPUT_POLY2].voltage(id - PORT_MAX_CHANNELS)
        }
    }
}

impl Module for CvMap {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            plugin: "RackPack",
            model: "CVMap",
            name: "CVMap",
        }
    }

    fn panel(&self) -> &Panel {
        &self.panel
    }

    fn panel_mut(&mut self) -> &mut Panel {
        &mut self.panel
    }

    fn process(&mut self, args: &ProcessArgs, host: &dyn Host) {
        for id in 0..self.core.map_len() {
            let handle = self.core.handle(id);
            if !handle.is_mapped() {
                continue;
            }
            let module = handle.module_id();
            let param = handle.param_id();
            // A dangling or busy target skips this frame.
            let Some((min, max)) = host.param_bounds(module, param) else {
                continue;
            };
            let mut v = self.channel_voltage(id);
            if self.bipolar_input {
                v += 5.0;
            }
            v = rescale(v, 0.0, 10.0, 0.0, 1.0);
            v = self.core.filter_mut(id).process(args.sample_time, v);
            v = rescale(v, 0.0, 1.0, min, max);
            host.set_param(module, param, v);
        }

        self.core.process_indicators(args);

        if self.light_divider.tick() {
            let channels1 = self.panel.inputs[INPUT_POLY1].channels();
            let channels2 = self.panel.inputs[INPUT_POLY2].channels();
            for c in 0..PORT_MAX_CHANNELS {
                let active1 =
                    self.panel.inputs[INPUT_POLY1].is_connected() && c < channels1;
                self.panel.lights[c].set_brightness(active1 as u8 as f32);
                let active2 =
                    self.panel.inputs[INPUT_POLY2].is_connected() && c < channels2;
                self.panel.lights[PORT_MAX_CHANNELS + c].set_brightness(active2 as u8 as f32);
            }
        }
    }

    fn reset(&mut self) {
        self.core.reset();
        self.bipolar_input = false;
    }

    fn snapshot(&self) -> Value {
        json!({
            "maps": self.core.snapshot_maps(),
            "bipolarInput": self.bipolar_input,
            "textScrolling": self.core.text_scrolling(),
        })
    }

    fn restore(&mut self, blob: &Value) {
        if let Some(maps) = snapshot::array(blob, "maps") {
            self.core.restore_maps(maps);
        }
        self.bipolar_input = snapshot::boolean(blob, "bipolarInput", false);
        self.core
            .set_text_scrolling(snapshot::boolean(blob, "textScrolling", true));
    }

    fn param_handles(&self) -> &[Arc<ParamHandle>] {
        self.core.handles()
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
    use crate::port::Param;
    use approx::assert_relative_eq;

    /// Mapping target with one 0..10 parameter.
    struct Target {
        panel: Panel,
    }

    impl Target {
        fn new() -> Self {
            let mut panel = Panel::new(0, 0, 0);
            panel.add_param(Param::new(0.0, 10.0, 0.0, "Level"));
            Self { panel }
        }
    }

    impl Module for Target {
        fn meta(&self) -> ModuleMeta {
            ModuleMeta {
                plugin: "RackPackTest",
                model: "Target",
                name: "Target",
            }
        }

        fn panel(&self) -> &Panel {
            &self.panel
        }

        fn panel_mut(&mut self) -> &mut Panel {
            &mut self.panel
        }

        fn process(&mut self, _args: &ProcessArgs, _host: &dyn Host) {}

        fn reset(&mut self) {
            self.panel.reset_params();
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
            self
        }
    }

    fn build_rack() -> (Rack, ModuleId, ModuleId) {
        let mut rack = Rack::new(48000.0);
        let target = rack.add_module(Box::new(Target::new()));
        let cvmap = rack.add_module(Box::new(CvMap::new()));
        (rack, target, cvmap)
    }

    fn target_level(rack: &Rack, target: ModuleId) -> f32 {
        rack.with_module::<Target, _>(target, |t| t.panel.params[0].value())
            .expect("target exists")
    }

    #[test]
    fn test_mapped_cv_drives_parameter() {
        let (mut rack, target, cvmap) = build_rack();
        rack.with_module::<CvMap, _>(cvmap, |m| {
            m.panel.inputs[INPUT_POLY1].set_connected(true);
            m.panel.inputs[INPUT_POLY1].set_voltage(0, 10.0);
        }).unwrap();
        let handle = rack
            .with_module::<CvMap, _>(cvmap, |m| m.core.handle(0).clone())
            .expect("module exists");
        rack.update_param_handle(&handle, target, 0, true);

        // One second of smoothing is ~30 time constants.
        rack.process_frames(48_000);
        assert_relative_eq!(target_level(&rack, target), 10.0, epsilon = 1e-3);
    }

    #[test]
    fn test_bipolar_input_centres_range() {
        let (mut rack, target, cvmap) = build_rack();
        rack.with_module::<CvMap, _>(cvmap, |m| {
            m.set_bipolar_input(true);
            m.panel.inputs[INPUT_POLY1].set_connected(true);
            // 0 V bipolar sits mid-range.
            m.panel.inputs[INPUT_POLY1].set_voltage(0, 0.0);
        }).unwrap();
        let handle = rack
            .with_module::<CvMap, _>(cvmap, |m| m.core.handle(0).clone())
            .expect("module exists");
        rack.update_param_handle(&handle, target, 0, true);
        rack.process_frames(48_000);
        assert_relative_eq!(target_level(&rack, target), 5.0, epsilon = 1e-3);
    }

    #[test]
    fn test_second_poly_input_covers_upper_channels() {
        let (mut rack, target, cvmap) = build_rack();
        rack.with_module::<CvMap, _>(cvmap, |m| {
            m.panel.inputs[INPUT_POLY2].set_connected(true);
            // Channel 20 reads from the second poly input, channel 4.
            m.panel.inputs[INPUT_POLY2].set_voltage(4, 10.0);
        }).unwrap();
        let handle = rack
            .with_module::<CvMap, _>(cvmap, |m| m.core.handle(20).clone())
            .expect("module exists");
        rack.update_param_handle(&handle, target, 0, true);
        rack.with_module::<CvMap, _>(cvmap, |m| m.core.update_map_len()).unwrap();
        rack.process_frames(48_000);
        assert_relative_eq!(target_level(&rack, target), 10.0, epsilon = 1e-3);
    }

    #[test]
    fn test_dangling_handle_is_skipped() {
        let (mut rack, target, cvmap) = build_rack();
        rack.with_module::<CvMap, _>(cvmap, |m| {
            m.panel.inputs[INPUT_POLY1].set_connected(true);
            m.panel.inputs[INPUT_POLY1].set_voltage(0, 10.0);
        }).unwrap();
        let handle = rack
            .with_module::<CvMap, _>(cvmap, |m| m.core.handle(0).clone())
            .expect("module exists");
        rack.update_param_handle(&handle, target, 0, true);
        rack.remove_module(target);
        // The handle was unmapped by the removal; processing is a no-op.
        assert!(!handle.is_mapped());
        rack.process_frames(4);
    }

    #[test]
    fn test_learning_workflow_through_rack() {
        let (rack, target, cvmap) = build_rack();
        rack.with_module::<CvMap, _>(cvmap, |m| {
            m.enable_learn(0);
            m.learn_param(0, target, 0, &rack);
            assert!(m.core.handle(0).is_mapped());
            // Two slots visible: the mapping and the trailing empty one.
            assert_eq!(m.map_len(), 2);
        }).unwrap();
    }

    #[test]
    fn test_duplicate_learn_steals_mapping() {
        let (rack, target, cvmap) = build_rack();
        rack.with_module::<CvMap, _>(cvmap, |m| {
            m.learn_param(0, target, 0, &rack);
            m.learn_param(1, target, 0, &rack);
            assert!(!m.core.handle(0).is_mapped());
            assert!(m.core.handle(1).is_mapped());
        }).unwrap();
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (rack, target, cvmap) = build_rack();
        let blob = rack
            .with_module::<CvMap, _>(cvmap, |m| {
                m.learn_param(0, target, 0, &rack);
                m.set_bipolar_input(true);
                m.set_text_scrolling(false);
                m.snapshot()
            })
            .expect("module exists");

        let mut restored = CvMap::new();
        restored.restore(&blob);
        assert_eq!(restored.core.handle(0).module_id(), target);
        assert_eq!(restored.core.handle(0).param_id(), 0);
        assert!(restored.bipolar_input());
        assert!(!restored.text_scrolling());
    }

    #[test]
    fn test_restore_tolerates_missing_keys() {
        let mut m = CvMap::new();
        m.restore(&json!({}));
        assert!(!m.bipolar_input());
        assert!(m.text_scrolling());
        assert_eq!(m.map_len(), 1);
    }
}
