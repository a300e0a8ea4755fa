//! Intermix: a scene-aware 8×8 matrix mixer.
//!
//! Eight snapshottable scenes hold the routing matrix, per-input processing
//! modes, per-output enables and attenuverters. Scene selection comes from
//! panel buttons or a CV input; matrix cells cross-fade between scenes with
//! a shared pair of rise/fall times. The per-sample work is a weighted
//! 8×8 accumulation batched four outputs at a time.

use serde_json::{json, Value};

use crate::digital::{ClockDivider, LinearFade, SchmittTrigger};
use crate::module::{Module, ModuleMeta, Panel, ProcessArgs};
use crate::port::{rescale, Param};
use crate::rack::Host;
use crate::snapshot;

pub const PORTS: usize = 8;
pub const SCENE_COUNT: usize = 8;

/// Per-input processing mode.
///
/// The numeric encoding is part of the snapshot format: 0..=2 name the
/// modes, 12..=23 and 25..=36 encode a chromatic bias of −12…+12 semitones
/// as `volts = (code − 24) / 12`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InMode {
    Off,
    Direct,
    Fade,
    /// Fixed chromatic bias in semitones, −12..=−1 or 1..=12. The physical
    /// input is ignored.
    Constant(i8),
}

impl InMode {
    pub fn to_code(self) -> i64 {
        match self {
            InMode::Off => 0,
            InMode::Direct => 1,
            InMode::Fade => 2,
            InMode::Constant(c) => 24 + c as i64,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(InMode::Off),
            1 => Some(InMode::Direct),
            2 => Some(InMode::Fade),
            12..=23 | 25..=36 => Some(InMode::Constant((code - 24) as i8)),
            _ => None,
        }
    }

    /// Bias voltage of a constant mode, 1 V/octave.
    pub fn constant_volts(self) -> Option<f32> {
        match self {
            InMode::Constant(c) => Some(c as f32 / 12.0),
            _ => None,
        }
    }
}

/// Per-output switch; encoded as 0 = off, 1 = routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutMode {
    Off,
    Out,
}

impl OutMode {
    pub fn to_code(self) -> i64 {
        match self {
            OutMode::Off => 0,
            OutMode::Out => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(OutMode::Off),
            1 => Some(OutMode::Out),
            _ => None,
        }
    }
}

/// How the scene CV input selects scenes. Encoding is part of the snapshot
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneCvMode {
    /// A trigger edge advances to the next scene.
    TriggerForward,
    /// A trigger edge commits the armed scene.
    Armed,
    /// 0–10 V maps linearly onto the eight scenes.
    Voltage,
    /// 1 V/octave, C4–G4 select scenes 0–7.
    C4ToG4,
}

impl SceneCvMode {
    pub fn to_code(self) -> i64 {
        match self {
            SceneCvMode::TriggerForward => 0,
            SceneCvMode::Armed => 7,
            SceneCvMode::Voltage => 8,
            SceneCvMode::C4ToG4 => 9,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SceneCvMode::TriggerForward),
            7 => Some(SceneCvMode::Armed),
            8 => Some(SceneCvMode::Voltage),
            9 => Some(SceneCvMode::C4ToG4),
            _ => None,
        }
    }
}

/// One switchable configuration: routing matrix, input modes, output
/// enables and attenuverters. `matrix[input][output]` holds 0 or 1.
#[derive(Debug, Clone)]
pub struct SceneData {
    pub input: [InMode; PORTS],
    pub output: [OutMode; PORTS],
    pub output_at: [f32; PORTS],
    pub matrix: [[f32; PORTS]; PORTS],
}

impl Default for SceneData {
    fn default() -> Self {
        Self {
            input: [InMode::Direct; PORTS],
            output: [OutMode::Out; PORTS],
            output_at: [1.0; PORTS],
            matrix: [[0.0; PORTS]; PORTS],
        }
    }
}

pub const NUM_PARAMS: usize = PORTS * PORTS + PORTS + SCENE_COUNT + PORTS + 2;
pub const NUM_INPUTS: usize = PORTS + 1;
pub const NUM_OUTPUTS: usize = PORTS;
pub const NUM_LIGHTS: usize = PORTS * PORTS * 3 + PORTS + SCENE_COUNT;

pub const INPUT_SCENE: usize = PORTS;

pub const fn param_matrix(out: usize, inp: usize) -> usize {
    out * PORTS + inp
}
pub const fn param_output(out: usize) -> usize {
    PORTS * PORTS + out
}
pub const fn param_scene(scene: usize) -> usize {
    PORTS * PORTS + PORTS + scene
}
pub const fn param_attenuverter(out: usize) -> usize {
    PORTS * PORTS + PORTS + SCENE_COUNT + out
}
pub const PARAM_FADE_IN: usize = PORTS * PORTS + PORTS + SCENE_COUNT + PORTS;
pub const PARAM_FADE_OUT: usize = PARAM_FADE_IN + 1;

pub const fn light_matrix(out: usize, inp: usize) -> usize {
    (out * PORTS + inp) * 3
}
pub const fn light_output(out: usize) -> usize {
    PORTS * PORTS * 3 + out
}
pub const fn light_scene(scene: usize) -> usize {
    PORTS * PORTS * 3 + PORTS + scene
}

pub struct Intermix {
    panel: Panel,

    pad_brightness: f32,
    input_visualize: bool,
    output_clamp: bool,
    input_mode: [InMode; PORTS],
    scenes: [SceneData; SCENE_COUNT],
    scene_selected: usize,
    scene_mode: SceneCvMode,
    /// When set, per-input modes come from the selected scene instead of
    /// the module-wide `input_mode` array.
    scene_input_mode: bool,

    scene_next: i32,
    current_matrix: [[f32; PORTS]; PORTS],
    faders: [[LinearFade; PORTS]; PORTS],

    scene_trigger: SchmittTrigger,
    scene_divider: ClockDivider,
    light_divider: ClockDivider,
}

impl Default for Intermix {
    fn default() -> Self {
        Self::new()
    }
}

impl Intermix {
    pub fn new() -> Self {
        let mut panel = Panel::new(NUM_INPUTS, NUM_OUTPUTS, NUM_LIGHTS);
        for out in 0..PORTS {
            for inp in 0..PORTS {
                panel.add_param(Param::new(
                    0.0,
                    1.0,
                    0.0,
                    format!("Input {} to Output {}", inp + 1, out + 1),
                ));
            }
        }
        for out in 0..PORTS {
            panel.add_param(Param::new(0.0, 1.0, 0.0, format!("Output {} disable", out + 1)));
        }
        for scene in 0..SCENE_COUNT {
            panel.add_param(Param::new(0.0, 1.0, 0.0, format!("Scene {}", scene + 1)));
        }
        for out in 0..PORTS {
            panel.add_param(
                Param::new(-2.0, 2.0, 1.0, format!("Output {} attenuverter", out + 1))
                    .with_unit("x"),
            );
        }
        panel.add_param(Param::new(0.0, 4.0, 0.0, "Fade in").with_unit("s"));
        panel.add_param(Param::new(0.0, 4.0, 0.0, "Fade out").with_unit("s"));

        let mut module = Self {
            panel,
            pad_brightness: 0.75,
            input_visualize: false,
            output_clamp: true,
            input_mode: [InMode::Direct; PORTS],
            scenes: Default::default(),
            scene_selected: 0,
            scene_mode: SceneCvMode::TriggerForward,
            scene_input_mode: false,
            scene_next: -1,
            current_matrix: [[0.0; PORTS]; PORTS],
            faders: Default::default(),
            scene_trigger: SchmittTrigger::new(),
            scene_divider: ClockDivider::new(32),
            light_divider: ClockDivider::new(512),
        };
        module.reset();
        module
    }

    pub fn scene_selected(&self) -> usize {
        self.scene_selected
    }

    pub fn scene_next(&self) -> i32 {
        self.scene_next
    }

    /// Live fade level of one matrix cell.
    pub fn current_level(&self, input: usize, output: usize) -> f32 {
        self.current_matrix[input][output]
    }

    pub fn scene(&self, index: usize) -> &SceneData {
        &self.scenes[index]
    }

    pub fn input_mode(&self, input: usize) -> InMode {
        self.input_mode[input]
    }

    /// UI entry point; safe while `process` is not running.
    pub fn set_input_mode(&mut self, input: usize, mode: InMode) {
        self.input_mode[input] = mode;
    }

    /// Sets the per-scene input mode of the selected scene.
    pub fn set_scene_input(&mut self, input: usize, mode: InMode) {
        self.scenes[self.scene_selected].input[input] = mode;
    }

    pub fn scene_mode(&self) -> SceneCvMode {
        self.scene_mode
    }

    pub fn set_scene_mode(&mut self, mode: SceneCvMode) {
        self.scene_mode = mode;
    }

    pub fn scene_input_mode(&self) -> bool {
        self.scene_input_mode
    }

    pub fn set_scene_input_mode(&mut self, on: bool) {
        self.scene_input_mode = on;
    }

    pub fn output_clamp(&self) -> bool {
        self.output_clamp
    }

    pub fn set_output_clamp(&mut self, on: bool) {
        self.output_clamp = on;
    }

    pub fn set_pad_brightness(&mut self, brightness: f32) {
        self.pad_brightness = brightness.clamp(0.0, 2.0);
    }

    pub fn set_input_visualize(&mut self, on: bool) {
        self.input_visualize = on;
    }

    /// Switches to `scene`, pushing its stored values back into the panel
    /// parameters and arming a fade for every cell that differs from the
    /// outgoing scene. Out-of-range indices are ignored.
    fn scene_set(&mut self, scene: i32) {
        if scene < 0 || scene >= SCENE_COUNT as i32 {
            return;
        }
        let scene = scene as usize;
        if scene == self.scene_selected {
            return;
        }
        let previous = self.scene_selected;
        self.scene_selected = scene;
        self.scene_next = -1;

        for i in 0..SCENE_COUNT {
            let v = if i == scene { 1.0 } else { 0.0 };
            self.panel.params[param_scene(i)].set_value(v);
        }

        // One pass over the ports: `i` indexes the output-side arrays and
        // doubles as the matrix row (input) index.
        for i in 0..PORTS {
            let disabled = self.scenes[scene].output[i] != OutMode::Out;
            self.panel.params[param_output(i)].set_value(disabled as u8 as f32);
            self.panel.params[param_attenuverter(i)].set_value(self.scenes[scene].output_at[i]);
            for j in 0..PORTS {
                let p = self.scenes[scene].matrix[i][j];
                self.panel.params[param_matrix(j, i)].set_value(p);
                if p != self.scenes[previous].matrix[i][j] {
                    if p == 1.0 {
                        self.faders[i][j].trigger_fade_in();
                    } else if p == 0.0 {
                        self.faders[i][j].trigger_fade_out();
                    }
                }
                self.current_matrix[i][j] = p;
            }
        }
    }

    /// Write-back poll: folds panel edits into the selected scene and arms
    /// fades for cells the user just toggled.
    fn scene_poll(&mut self) {
        let mut scene_found = -1;
        for i in 0..SCENE_COUNT {
            if self.panel.params[param_scene(i)].value() > 0.0 {
                if i != self.scene_selected {
                    if self.scene_mode == SceneCvMode::Armed {
                        self.scene_next = i as i32;
                    } else {
                        self.scene_set(i as i32);
                    }
                    break;
                }
                scene_found = i as i32;
            }
        }
        if scene_found == -1 {
            // Keep the selected scene's button latched.
            self.panel.params[param_scene(self.scene_selected)].set_value(1.0);
        }

        let f1 = self.panel.params[PARAM_FADE_IN].value();
        let f2 = self.panel.params[PARAM_FADE_OUT].value();
        let sel = self.scene_selected;
        for i in 0..PORTS {
            self.scenes[sel].output[i] = if self.panel.params[param_output(i)].value() == 0.0 {
                OutMode::Out
            } else {
                OutMode::Off
            };
            self.scenes[sel].output_at[i] = self.panel.params[param_attenuverter(i)].value();
            for j in 0..PORTS {
                self.faders[i][j].set_rise_fall(f1, f2);
                let p = self.panel.params[param_matrix(j, i)].value();
                if p != self.scenes[sel].matrix[i][j] {
                    if p == 1.0 {
                        self.faders[i][j].trigger_fade_in();
                    } else if p == 0.0 {
                        self.faders[i][j].trigger_fade_out();
                    }
                }
                self.scenes[sel].matrix[i][j] = p;
                self.current_matrix[i][j] = p;
            }
        }
    }

    fn update_lights(&mut self, args: &ProcessArgs) {
        let s = self.light_divider.division() as f32 * args.sample_time;

        for i in 0..SCENE_COUNT {
            let v = if i == self.scene_selected {
                self.pad_brightness
            } else {
                0.0
            };
            self.panel.lights[light_scene(i)].set_smooth_brightness(v, s);
        }

        if self.input_visualize {
            let mut in_norm = [0.0f32; PORTS];
            for inp in 0..PORTS {
                in_norm[inp] = rescale(self.panel.inputs[inp].voltage(0), -10.0, 10.0, -1.0, 1.0);
            }
            for out in 0..PORTS {
                for inp in 0..PORTS {
                    let v =
                        self.current_matrix[inp][out] * in_norm[inp] * self.pad_brightness;
                    let base = light_matrix(out, inp);
                    self.panel.lights[base].set_brightness(if v < 0.0 { -v } else { 0.0 });
                    self.panel.lights[base + 1].set_brightness(if v > 0.0 { v } else { 0.0 });
                    self.panel.lights[base + 2].set_brightness(0.0);
                }
            }
        } else {
            for out in 0..PORTS {
                for inp in 0..PORTS {
                    let v = self.current_matrix[inp][out] * self.pad_brightness;
                    let base = light_matrix(out, inp);
                    self.panel.lights[base].set_smooth_brightness(v, s);
                    self.panel.lights[base + 1].set_smooth_brightness(v, s);
                    self.panel.lights[base + 2].set_smooth_brightness(v, s);
                }
            }
        }

        for out in 0..PORTS {
            let v = if self.scenes[self.scene_selected].output[out] != OutMode::Out {
                self.pad_brightness
            } else {
                0.0
            };
            self.panel.lights[light_output(out)].set_smooth_brightness(v, s);
        }
    }

    /// Restores runtime state derived from the scene store: panel params,
    /// live matrix and fade levels all mirror the selected scene.
    fn sync_to_selected_scene(&mut self) {
        for i in 0..SCENE_COUNT {
            let v = if i == self.scene_selected { 1.0 } else { 0.0 };
            self.panel.params[param_scene(i)].set_value(v);
        }
        let sel = self.scene_selected;
        for i in 0..PORTS {
            let disabled = self.scenes[sel].output[i] != OutMode::Out;
            self.panel.params[param_output(i)].set_value(disabled as u8 as f32);
            self.panel.params[param_attenuverter(i)].set_value(self.scenes[sel].output_at[i]);
            for j in 0..PORTS {
                let v = self.scenes[sel].matrix[i][j];
                self.panel.params[param_matrix(j, i)].set_value(v);
                self.current_matrix[i][j] = v;
                self.faders[i][j].reset(v);
            }
        }
    }
}

impl Module for Intermix {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            plugin: "RackPack",
            model: "Intermix",
            name: "Intermix",
        }
    }

    fn panel(&self) -> &Panel {
        &self.panel
    }

    fn panel_mut(&mut self) -> &mut Panel {
        &mut self.panel
    }

    fn process(&mut self, args: &ProcessArgs, _host: &dyn Host) {
        // Scene selection from CV takes effect for this frame's output.
        if self.panel.inputs[INPUT_SCENE].is_connected() {
            let v = self.panel.inputs[INPUT_SCENE].voltage(0);
            match self.scene_mode {
                SceneCvMode::TriggerForward => {
                    if self.scene_trigger.process(v) {
                        self.scene_set((self.scene_selected as i32 + 1) % SCENE_COUNT as i32);
                    }
                }
                SceneCvMode::C4ToG4 => {
                    let s = (v * 12.0).clamp(0.0, SCENE_COUNT as f32 - 1.0).round();
                    self.scene_set(s as i32);
                }
                SceneCvMode::Voltage => {
                    let s = rescale(v, 0.0, 10.0, 0.0, SCENE_COUNT as f32 - 1e-3).floor();
                    self.scene_set(s as i32);
                }
                SceneCvMode::Armed => {
                    if self.scene_trigger.process(v) {
                        self.scene_set(self.scene_next);
                    }
                }
            }
        }

        if self.scene_divider.tick() {
            self.scene_poll();
        }

        let mut out = [0.0f32; PORTS];
        for inp in 0..PORTS {
            let mode = if self.scene_input_mode {
                self.scenes[self.scene_selected].input[inp]
            } else {
                self.input_mode[inp]
            };
            let v = match mode {
                InMode::Off => continue,
                InMode::Direct => {
                    if !self.panel.inputs[inp].is_connected() {
                        continue;
                    }
                    self.panel.inputs[inp].voltage(0)
                }
                InMode::Fade => {
                    if !self.panel.inputs[inp].is_connected() {
                        continue;
                    }
                    for out_j in 0..PORTS {
                        self.current_matrix[inp][out_j] =
                            self.faders[inp][out_j].process(args.sample_time);
                    }
                    self.panel.inputs[inp].voltage(0)
                }
                InMode::Constant(c) => c as f32 / 12.0,
            };

            // Four outputs at a time; the adds run in the same order as the
            // scalar definition, so results match it bit for bit.
            for out_j in (0..PORTS).step_by(4) {
                out[out_j] += self.current_matrix[inp][out_j] * v;
                out[out_j + 1] += self.current_matrix[inp][out_j + 1] * v;
                out[out_j + 2] += self.current_matrix[inp][out_j + 2] * v;
                out[out_j + 3] += self.current_matrix[inp][out_j + 3] * v;
            }
        }

        let scene = &self.scenes[self.scene_selected];
        for out_j in 0..PORTS {
            let mut v = if scene.output[out_j] == OutMode::Out {
                out[out_j]
            } else {
                0.0
            };
            if self.output_clamp {
                v = v.clamp(-10.0, 10.0);
            }
            v *= scene.output_at[out_j];
            self.panel.outputs[out_j].set_voltage(0, v);
        }

        if self.light_divider.tick() {
            self.update_lights(args);
        }
    }

    fn reset(&mut self) {
        self.pad_brightness = 0.75;
        self.input_visualize = false;
        self.output_clamp = true;
        self.input_mode = [InMode::Direct; PORTS];
        self.scenes = Default::default();
        self.scene_mode = SceneCvMode::TriggerForward;
        self.scene_input_mode = false;
        self.scene_selected = 0;
        self.scene_next = -1;
        self.panel.reset_params();
        self.sync_to_selected_scene();
    }

    fn snapshot(&self) -> Value {
        let scenes: Vec<Value> = self
            .scenes
            .iter()
            .map(|scene| {
                let matrix: Vec<f32> = scene
                    .matrix
                    .iter()
                    .flat_map(|row| row.iter().copied())
                    .collect();
                json!({
                    "input": scene.input.iter().map(|m| m.to_code()).collect::<Vec<_>>(),
                    "output": scene.output.iter().map(|m| m.to_code()).collect::<Vec<_>>(),
                    "outputAt": scene.output_at.to_vec(),
                    "matrix": matrix,
                })
            })
            .collect();

        json!({
            "padBrightness": self.pad_brightness,
            "inputVisualize": self.input_visualize,
            "outputClamp": self.output_clamp,
            "inputMode": self.input_mode.iter().map(|m| m.to_code()).collect::<Vec<_>>(),
            "scenes": scenes,
            "sceneSelected": self.scene_selected,
            "sceneMode": self.scene_mode.to_code(),
            "sceneInputMode": self.scene_input_mode,
        })
    }

    fn restore(&mut self, blob: &Value) {
        self.pad_brightness = snapshot::real(blob, "padBrightness", 0.75).clamp(0.0, 2.0);
        self.input_visualize = snapshot::boolean(blob, "inputVisualize", false);
        self.output_clamp = snapshot::boolean(blob, "outputClamp", true);

        if let Some(modes) = snapshot::array(blob, "inputMode") {
            for (i, v) in modes.iter().take(PORTS).enumerate() {
                self.input_mode[i] = v
                    .as_i64()
                    .and_then(InMode::from_code)
                    .unwrap_or(InMode::Direct);
            }
        }

        if let Some(scenes) = snapshot::array(blob, "scenes") {
            for (s, scene_blob) in scenes.iter().take(SCENE_COUNT).enumerate() {
                let scene = &mut self.scenes[s];
                if let Some(input) = snapshot::array(scene_blob, "input") {
                    for (i, v) in input.iter().take(PORTS).enumerate() {
                        scene.input[i] = v
                            .as_i64()
                            .and_then(InMode::from_code)
                            .unwrap_or(InMode::Direct);
                    }
                }
                if let Some(output) = snapshot::array(scene_blob, "output") {
                    for (i, v) in output.iter().take(PORTS).enumerate() {
                        scene.output[i] = v
                            .as_i64()
                            .and_then(OutMode::from_code)
                            .unwrap_or(OutMode::Out);
                    }
                }
                if let Some(at) = snapshot::array(scene_blob, "outputAt") {
                    for (i, v) in at.iter().take(PORTS).enumerate() {
                        scene.output_at[i] =
                            (v.as_f64().unwrap_or(1.0) as f32).clamp(-2.0, 2.0);
                    }
                }
                if let Some(matrix) = snapshot::array(scene_blob, "matrix") {
                    for (i, v) in matrix.iter().take(PORTS * PORTS).enumerate() {
                        scene.matrix[i / PORTS][i % PORTS] =
                            (v.as_f64().unwrap_or(0.0) as f32).clamp(0.0, 1.0);
                    }
                }
            }
        }

        let selected = snapshot::integer(blob, "sceneSelected", 0);
        self.scene_selected = if (0..SCENE_COUNT as i64).contains(&selected) {
            selected as usize
        } else {
            log::debug!("discarding out-of-range scene index {}", selected);
            0
        };
        self.scene_mode = SceneCvMode::from_code(snapshot::integer(blob, "sceneMode", 0))
            .unwrap_or(SceneCvMode::TriggerForward);
        self.scene_input_mode = snapshot::boolean(blob, "sceneInputMode", false);
        self.scene_next = -1;

        self.sync_to_selected_scene();
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
