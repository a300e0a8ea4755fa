//! EightFace: a preset sequencer acting on the neighbouring module.
//!
//! Eight slots capture snapshots of the expander neighbour; control voltage
//! steps through them in read mode, panel buttons capture and clear them in
//! write mode. Capture is cheap and runs on the engine thread. Restore
//! mutates the neighbour's parameters and may cascade through mapping
//! modules, so it is handed to a worker thread through a single-slot
//! mailbox: the engine publishes `(slot, target, blob)` and signals; the
//! worker applies the snapshot and goes back to waiting. A newer request
//! simply overwrites the mailbox — the user's most recent selection wins.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};

use crate::digital::{ButtonEvent, ClockDivider, LongPressButton, SchmittTrigger};
use crate::module::{Module, ModuleMeta, Panel, ProcessArgs};
use crate::port::{rescale, Param};
use crate::rack::{Host, HostError, ModuleCell, Neighbour, Side};
use crate::snapshot;

pub const NUM_PRESETS: usize = 8;

pub const PARAM_MODE: usize = 0;
pub const fn param_preset(i: usize) -> usize {
    1 + i
}
pub const NUM_PARAMS: usize = 1 + NUM_PRESETS;

pub const INPUT_SLOT: usize = 0;
pub const INPUT_RESET: usize = 1;
pub const NUM_INPUTS: usize = 2;
pub const NUM_OUTPUTS: usize = 0;

pub const LIGHT_MODULE: usize = 0;
pub const fn light_preset(i: usize) -> usize {
    2 + i * 3
}
pub const NUM_LIGHTS: usize = 2 + NUM_PRESETS * 3;

/// Ignore slot CV for this long after an external reset, so a reset pulse
/// and a clock pulse arriving together don't double-step.
const RESET_DEBOUNCE: f32 = 1e-3;

/// How the slot CV input selects presets. Encoding is part of the snapshot
/// format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotCvMode {
    TriggerForward,
    TriggerReverse,
    TriggerPingpong,
    TriggerRandom,
    Voltage,
    C4ToG4,
    /// A trigger edge commits the previously armed slot.
    Armed,
}

impl SlotCvMode {
    pub fn to_code(self) -> i64 {
        match self {
            SlotCvMode::TriggerForward => 0,
            SlotCvMode::TriggerReverse => 1,
            SlotCvMode::TriggerPingpong => 2,
            SlotCvMode::TriggerRandom => 3,
            SlotCvMode::Voltage => 4,
            SlotCvMode::C4ToG4 => 5,
            SlotCvMode::Armed => 6,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SlotCvMode::TriggerForward),
            1 => Some(SlotCvMode::TriggerReverse),
            2 => Some(SlotCvMode::TriggerPingpong),
            3 => Some(SlotCvMode::TriggerRandom),
            4 => Some(SlotCvMode::Voltage),
            5 => Some(SlotCvMode::C4ToG4),
            6 => Some(SlotCvMode::Armed),
            _ => None,
        }
    }

    fn is_edge_triggered(self) -> bool {
        matches!(
            self,
            SlotCvMode::TriggerForward
                | SlotCvMode::TriggerReverse
                | SlotCvMode::TriggerPingpong
                | SlotCvMode::TriggerRandom
                | SlotCvMode::Armed
        )
    }
}

/// Neighbour status, refreshed every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connected {
    /// No module on the configured side.
    Absent,
    /// A module is there but its identity differs from the captured one;
    /// operations are disabled.
    Mismatch,
    Matched,
}

struct RestoreJob {
    slot: i32,
    target: Option<Arc<ModuleCell>>,
    blob: Option<Arc<Value>>,
}

struct WorkerState {
    running: bool,
    do_process: bool,
    job: RestoreJob,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    signal: Condvar,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn restore_loop(shared: &WorkerShared) {
    loop {
        let job = {
            let mut state = lock(&shared.state);
            while !state.do_process {
                state = shared
                    .signal
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            state.do_process = false;
            if !state.running {
                return;
            }
            RestoreJob {
                slot: state.job.slot,
                target: state.job.target.take(),
                blob: state.job.blob.take(),
            }
        };
        // The mailbox is released before the restore runs, so the engine
        // thread never waits behind a restore in progress.
        match (job.target, job.blob) {
            (Some(target), Some(blob)) if job.slot >= 0 => target.restore(&blob),
            _ => log::warn!("restore job discarded: bad slot or missing blob"),
        }
    }
}

/// The worker thread and its mailbox. Owned for the whole module lifetime;
/// dropping it signals the sentinel and joins the thread.
struct RestoreWorker {
    shared: Arc<WorkerShared>,
    handle: Option<JoinHandle<()>>,
}

impl RestoreWorker {
    fn spawn() -> Result<Self, HostError> {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                running: true,
                do_process: false,
                job: RestoreJob {
                    slot: -1,
                    target: None,
                    blob: None,
                },
            }),
            signal: Condvar::new(),
        });
        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name("eightface-restore".into())
            .spawn(move || restore_loop(&thread_shared))
            .map_err(HostError::WorkerSpawn)?;
        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn submit(&self, slot: usize, target: Arc<ModuleCell>, blob: Arc<Value>) {
        let mut state = lock(&self.shared.state);
        state.job = RestoreJob {
            slot: slot as i32,
            target: Some(target),
            blob: Some(blob),
        };
        state.do_process = true;
        self.shared.signal.notify_one();
    }
}

impl Drop for RestoreWorker {
    fn drop(&mut self) {
        {
            let mut state = lock(&self.shared.state);
            state.running = false;
            state.do_process = true;
        }
        self.shared.signal.notify_one();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

pub struct EightFace {
    panel: Panel,

    plugin_slug: String,
    model_slug: String,
    module_name: String,
    slot_cv_mode: SlotCvMode,
    preset: i32,
    preset_count: usize,
    side: Side,
    autoload: bool,
    slot_used: [bool; NUM_PRESETS],
    slots: [Option<Arc<Value>>; NUM_PRESETS],

    connected: Connected,
    preset_next: i32,
    pingpong_dir: i32,
    since_reset: f32,
    mode_light: f32,
    autoload_pending: bool,

    rng: SmallRng,
    buttons: [LongPressButton; NUM_PRESETS],
    slot_trigger: SchmittTrigger,
    reset_trigger: SchmittTrigger,
    light_divider: ClockDivider,
    worker: RestoreWorker,
}

impl EightFace {
    /// Fails only if the restore worker cannot be spawned.
    pub fn new() -> Result<Self, HostError> {
        let mut panel = Panel::new(NUM_INPUTS, NUM_OUTPUTS, NUM_LIGHTS);
        panel.add_param(Param::new(0.0, 1.0, 0.0, "Read/write mode"));
        for i in 0..NUM_PRESETS {
            panel.add_param(Param::new(0.0, 1.0, 0.0, format!("Preset slot {}", i + 1)));
        }

        let mut module = Self {
            panel,
            plugin_slug: String::new(),
            model_slug: String::new(),
            module_name: String::new(),
            slot_cv_mode: SlotCvMode::TriggerForward,
            preset: -1,
            preset_count: NUM_PRESETS,
            side: Side::Left,
            autoload: false,
            slot_used: [false; NUM_PRESETS],
            slots: Default::default(),
            connected: Connected::Absent,
            preset_next: -1,
            pingpong_dir: 1,
            since_reset: 1.0,
            mode_light: 0.0,
            autoload_pending: false,
            rng: SmallRng::from_entropy(),
            buttons: Default::default(),
            slot_trigger: SchmittTrigger::new(),
            reset_trigger: SchmittTrigger::new(),
            light_divider: ClockDivider::new(512),
            worker: RestoreWorker::spawn()?,
        };
        module.reset();
        Ok(module)
    }

    pub fn preset(&self) -> i32 {
        self.preset
    }

    pub fn preset_next(&self) -> i32 {
        self.preset_next
    }

    pub fn preset_count(&self) -> usize {
        self.preset_count
    }

    pub fn connected(&self) -> Connected {
        self.connected
    }

    pub fn slot_used(&self, slot: usize) -> bool {
        self.slot_used[slot]
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn slot_cv_mode(&self) -> SlotCvMode {
        self.slot_cv_mode
    }

    /// UI entry point; safe while `process` is not running.
    pub fn set_slot_cv_mode(&mut self, mode: SlotCvMode) {
        self.slot_cv_mode = mode;
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn set_side(&mut self, side: Side) {
        self.side = side;
    }

    pub fn autoload(&self) -> bool {
        self.autoload
    }

    pub fn set_autoload(&mut self, autoload: bool) {
        self.autoload = autoload;
    }

    /// Selects slot `p` and hands its snapshot to the worker. Out-of-range
    /// indices and unused slots are no-ops; with `arm` the slot is only
    /// remembered for the next trigger edge.
    fn preset_load(&mut self, neighbour: &Neighbour, p: i32, arm: bool) {
        if p < 0 || p >= self.preset_count as i32 {
            return;
        }
        let slot = p as usize;
        if arm {
            if self.slot_used[slot] {
                self.preset_next = p;
            }
            return;
        }
        self.preset = p;
        self.preset_next = -1;
        if !self.slot_used[slot] {
            return;
        }
        if let Some(blob) = self.slots[slot].clone() {
            self.worker.submit(slot, neighbour.cell.clone(), blob);
        }
    }

    fn preset_save(&mut self, neighbour: &Neighbour, p: usize) {
        let meta = neighbour.meta();
        self.plugin_slug = meta.plugin.to_string();
        self.model_slug = meta.model.to_string();
        self.module_name = meta.name.to_string();
        self.slots[p] = Some(Arc::new(neighbour.cell.snapshot()));
        self.slot_used[p] = true;
    }

    fn preset_clear(&mut self, p: usize) {
        self.slots[p] = None;
        self.slot_used[p] = false;
        if self.preset == p as i32 {
            self.preset = -1;
        }
        if self.slot_used.iter().all(|&used| !used) {
            self.plugin_slug.clear();
            self.model_slug.clear();
            self.module_name.clear();
        }
    }

    fn preset_set_count(&mut self, count: usize) {
        if self.preset >= count as i32 {
            self.preset = 0;
        }
        self.preset_count = count;
        self.preset_next = -1;
    }

    fn process_slot_cv(&mut self, neighbour: &Neighbour, v: f32) {
        let debounced = self.since_reset >= RESET_DEBOUNCE;
        let count = self.preset_count as i32;
        match self.slot_cv_mode {
            SlotCvMode::TriggerForward => {
                if self.slot_trigger.process(v) && debounced {
                    self.preset_load(neighbour, (self.preset + 1).rem_euclid(count), false);
                }
            }
            SlotCvMode::TriggerReverse => {
                if self.slot_trigger.process(v) && debounced {
                    self.preset_load(neighbour, (self.preset - 1).rem_euclid(count), false);
                }
            }
            SlotCvMode::TriggerPingpong => {
                if self.slot_trigger.process(v) && debounced {
                    let mut p = self.preset + self.pingpong_dir;
                    if p >= count {
                        self.pingpong_dir = -1;
                        p = count - 2;
                    } else if p < 0 {
                        self.pingpong_dir = 1;
                        p = 1;
                    }
                    self.preset_load(neighbour, p, false);
                }
            }
            SlotCvMode::TriggerRandom => {
                if self.slot_trigger.process(v) && debounced {
                    let p = self.rng.gen_range(0..count);
                    self.preset_load(neighbour, p, false);
                }
            }
            SlotCvMode::Armed => {
                if self.slot_trigger.process(v) && debounced {
                    self.preset_load(neighbour, self.preset_next, false);
                }
            }
            SlotCvMode::Voltage => {
                let p = rescale(v, 0.0, 10.0, 0.0, self.preset_count as f32).floor() as i32;
                if p != self.preset {
                    self.preset_load(neighbour, p, false);
                }
            }
            SlotCvMode::C4ToG4 => {
                let p = (v * 12.0).clamp(0.0, NUM_PRESETS as f32 - 1.0).round() as i32;
                if p != self.preset {
                    self.preset_load(neighbour, p, false);
                }
            }
        }
    }

    fn update_lights(&mut self, args: &ProcessArgs) {
        let s = args.sample_time * self.light_divider.division() as f32;

        self.mode_light += 0.3 * s;
        if self.mode_light > 1.0 {
            self.mode_light = 0.0;
        }
        let matched = if self.connected == Connected::Matched {
            self.mode_light
        } else {
            0.0
        };
        self.panel.lights[LIGHT_MODULE].set_smooth_brightness(matched, s);
        let mismatch = (self.connected == Connected::Mismatch) as u8 as f32;
        self.panel.lights[LIGHT_MODULE + 1].set_brightness(mismatch);

        let read_mode = self.panel.params[PARAM_MODE].value() == 0.0;
        for i in 0..NUM_PRESETS {
            let base = light_preset(i);
            if read_mode {
                let armed = (self.preset_next == i as i32) as u8 as f32;
                self.panel.lights[base].set_brightness(armed);
                let available = if self.preset != i as i32 && self.preset_count > i {
                    if self.slot_used[i] {
                        1.0
                    } else {
                        0.2
                    }
                } else {
                    0.0
                };
                self.panel.lights[base + 1].set_smooth_brightness(available, s);
                let active = (self.preset == i as i32) as u8 as f32;
                self.panel.lights[base + 2].set_smooth_brightness(active, s);
            } else {
                let used = self.slot_used[i] as u8 as f32;
                self.panel.lights[base].set_brightness(used);
                self.panel.lights[base + 1].set_brightness(0.0);
                self.panel.lights[base + 2].set_brightness(0.0);
            }
        }
    }
}

impl Module for EightFace {
    fn meta(&self) -> ModuleMeta {
        ModuleMeta {
            plugin: "RackPack",
            model: "EightFace",
            name: "EightFace",
        }
    }

    fn panel(&self) -> &Panel {
        &self.panel
    }

    fn panel_mut(&mut self) -> &mut Panel {
        &mut self.panel
    }

    fn process(&mut self, args: &ProcessArgs, host: &dyn Host) {
        match host.neighbour(self.side) {
            Some(neighbour) => {
                let meta = neighbour.meta();
                let matched = self.model_slug.is_empty()
                    || (meta.model == self.model_slug && meta.plugin == self.plugin_slug);
                self.connected = if matched {
                    Connected::Matched
                } else {
                    Connected::Mismatch
                };

                if matched {
                    if self.autoload_pending {
                        self.autoload_pending = false;
                        self.preset_load(&neighbour, self.preset, false);
                    }

                    if self.since_reset < 1.0 {
                        self.since_reset += args.sample_time;
                    }

                    let read_mode = self.panel.params[PARAM_MODE].value() == 0.0;
                    if read_mode {
                        if self.panel.inputs[INPUT_SLOT].is_connected() {
                            let v = self.panel.inputs[INPUT_SLOT].voltage(0);
                            self.process_slot_cv(&neighbour, v);
                        }

                        if self.slot_cv_mode.is_edge_triggered()
                            && self.panel.inputs[INPUT_RESET].is_connected()
                        {
                            let v = self.panel.inputs[INPUT_RESET].voltage(0);
                            if self.reset_trigger.process(v) {
                                self.preset_load(&neighbour, 0, false);
                                self.since_reset = 0.0;
                            }
                        }

                        for i in 0..NUM_PRESETS {
                            let pressed = self.panel.params[param_preset(i)].value() > 0.0;
                            match self.buttons[i].step(pressed, args.sample_time) {
                                ButtonEvent::NoPress => {}
                                ButtonEvent::ShortPress => {
                                    let arm = self.slot_cv_mode == SlotCvMode::Armed;
                                    self.preset_load(&neighbour, i as i32, arm);
                                }
                                ButtonEvent::LongPress => self.preset_set_count(i + 1),
                            }
                        }
                    } else {
                        for i in 0..NUM_PRESETS {
                            let pressed = self.panel.params[param_preset(i)].value() > 0.0;
                            match self.buttons[i].step(pressed, args.sample_time) {
                                ButtonEvent::NoPress => {}
                                ButtonEvent::ShortPress => self.preset_save(&neighbour, i),
                                ButtonEvent::LongPress => self.preset_clear(i),
                            }
                        }
                    }
                }
            }
            None => {
                self.connected = Connected::Absent;
            }
        }

        if self.light_divider.tick() {
            self.update_lights(args);
        }
    }

    fn reset(&mut self) {
        self.plugin_slug.clear();
        self.model_slug.clear();
        self.module_name.clear();
        self.slot_cv_mode = SlotCvMode::TriggerForward;
        self.preset = -1;
        self.preset_count = NUM_PRESETS;
        self.side = Side::Left;
        self.autoload = false;
        self.slot_used = [false; NUM_PRESETS];
        self.slots = Default::default();
        self.connected = Connected::Absent;
        self.preset_next = -1;
        self.pingpong_dir = 1;
        self.since_reset = 1.0;
        self.mode_light = 0.0;
        self.autoload_pending = false;
        self.panel.reset_params();
    }

    fn snapshot(&self) -> Value {
        let presets: Vec<Value> = (0..NUM_PRESETS)
            .map(|i| {
                if self.slot_used[i] {
                    match &self.slots[i] {
                        Some(blob) => json!({ "slotUsed": true, "slot": (**blob).clone() }),
                        None => json!({ "slotUsed": false }),
                    }
                } else {
                    json!({ "slotUsed": false })
                }
            })
            .collect();

        json!({
            "mode": match self.side { Side::Left => 0, Side::Right => 1 },
            "pluginSlug": self.plugin_slug,
            "modelSlug": self.model_slug,
            "moduleName": self.module_name,
            "slotCvMode": self.slot_cv_mode.to_code(),
            "preset": self.preset,
            "presetCount": self.preset_count,
            "autoload": self.autoload,
            "presets": presets,
        })
    }

    fn restore(&mut self, blob: &Value) {
        self.plugin_slug = snapshot::string(blob, "pluginSlug");
        self.model_slug = snapshot::string(blob, "modelSlug");
        self.module_name = snapshot::string(blob, "moduleName");
        self.slot_cv_mode = SlotCvMode::from_code(snapshot::integer(blob, "slotCvMode", 0))
            .unwrap_or(SlotCvMode::TriggerForward);
        self.side = if snapshot::integer(blob, "mode", 0) == 1 {
            Side::Right
        } else {
            Side::Left
        };
        self.autoload = snapshot::boolean(blob, "autoload", false);
        self.preset_count =
            snapshot::integer(blob, "presetCount", NUM_PRESETS as i64).clamp(1, NUM_PRESETS as i64)
                as usize;
        self.preset = snapshot::integer(blob, "preset", -1)
            .clamp(-1, NUM_PRESETS as i64 - 1) as i32;

        self.slot_used = [false; NUM_PRESETS];
        self.slots = Default::default();
        if let Some(presets) = snapshot::array(blob, "presets") {
            for (i, preset_blob) in presets.iter().take(NUM_PRESETS).enumerate() {
                let used = snapshot::boolean(preset_blob, "slotUsed", false);
                let slot = preset_blob.get("slot").cloned();
                match slot {
                    Some(slot) if used && !slot.is_null() => {
                        self.slot_used[i] = true;
                        self.slots[i] = Some(Arc::new(slot));
                    }
                    _ => {}
                }
            }
        }

        if self.preset >= self.preset_count as i32 {
            self.preset = 0;
        }
        self.preset_next = -1;
        self.autoload_pending = self.autoload
            && self.preset >= 0
            && self.slot_used[self.preset as usize];
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
