//! Shared core for parameter-mapping modules.
//!
//! Owns a bank of parameter handles plus the learning workflow that binds
//! them: a UI selects a channel, the next parameter the user touches
//! becomes its target, and the set of mappings stays contiguous from
//! channel 0 with one trailing empty "mapping..." slot. Per-channel
//! one-pole filters smooth incoming CV, and indicators blink a mapped
//! parameter on request so the user can find it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use slotmap::Key;

use crate::digital::{ClockDivider, OnePoleFilter};
use crate::module::ProcessArgs;
use crate::rack::{ModuleId, ParamHandle, Rack};

/// Smoothing time constant for mapped CV, in seconds.
pub const SMOOTH_TAU: f32 = 1.0 / 30.0;

/// One persisted mapping, `{moduleId, paramId}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MapEntry {
    #[serde(rename = "moduleId")]
    module_id: i64,
    #[serde(rename = "paramId")]
    param_id: i64,
}

/// Blinks a mapped parameter's display so it can be located: twenty
/// alternations at 0.2 s intervals.
#[derive(Debug, Clone, Default)]
pub struct HandleIndicator {
    indicate_count: i32,
    elapsed: f32,
    dimmed: bool,
}

impl HandleIndicator {
    pub fn indicate(&mut self) {
        self.indicate_count = 20;
    }

    pub fn is_active(&self) -> bool {
        self.indicate_count > 0
    }

    pub fn is_dimmed(&self) -> bool {
        self.dimmed
    }

    pub fn process(&mut self, delta_time: f32) {
        if self.indicate_count > 0 {
            self.elapsed += delta_time;
            if self.elapsed > 0.2 {
                self.elapsed = 0.0;
                self.indicate_count -= 1;
                self.dimmed = self.indicate_count % 2 == 1;
            }
        }
    }
}

pub struct MapCore {
    handles: Vec<Arc<ParamHandle>>,
    indicators: Vec<HandleIndicator>,
    filters: Vec<OnePoleFilter>,
    map_len: usize,
    /// Channel of the active learning session, -1 when idle.
    learning_id: i32,
    learned_param: bool,
    text_scrolling: bool,
    indicator_divider: ClockDivider,
}

impl MapCore {
    pub fn new(max_channels: usize) -> Self {
        Self {
            handles: (0..max_channels)
                .map(|_| Arc::new(ParamHandle::new()))
                .collect(),
            indicators: vec![HandleIndicator::default(); max_channels],
            filters: vec![OnePoleFilter::new(SMOOTH_TAU); max_channels],
            map_len: 1,
            learning_id: -1,
            learned_param: false,
            text_scrolling: true,
            indicator_divider: ClockDivider::new(1024),
        }
    }

    pub fn max_channels(&self) -> usize {
        self.handles.len()
    }

    pub fn handles(&self) -> &[Arc<ParamHandle>] {
        &self.handles
    }

    pub fn handle(&self, id: usize) -> &Arc<ParamHandle> {
        &self.handles[id]
    }

    pub fn filter_mut(&mut self, id: usize) -> &mut OnePoleFilter {
        &mut self.filters[id]
    }

    pub fn indicator_mut(&mut self, id: usize) -> &mut HandleIndicator {
        &mut self.indicators[id]
    }

    pub fn map_len(&self) -> usize {
        self.map_len
    }

    pub fn learning_id(&self) -> i32 {
        self.learning_id
    }

    pub fn text_scrolling(&self) -> bool {
        self.text_scrolling
    }

    pub fn set_text_scrolling(&mut self, on: bool) {
        self.text_scrolling = on;
    }

    pub fn reset(&mut self) {
        self.learning_id = -1;
        self.learned_param = false;
        for handle in &self.handles {
            handle.clear();
        }
        for filter in &mut self.filters {
            filter.reset();
        }
        self.map_len = 1;
    }

    /// Unmaps one channel. UI entry point; `rack` arbitrates the registry.
    pub fn clear_map(&mut self, id: usize, rack: &Rack) {
        self.learning_id = -1;
        rack.update_param_handle(&self.handles[id], ModuleId::null(), 0, true);
        self.filters[id].reset();
        self.update_map_len();
    }

    pub fn clear_maps(&mut self, rack: &Rack) {
        self.learning_id = -1;
        for (handle, filter) in self.handles.iter().zip(&mut self.filters) {
            rack.update_param_handle(handle, ModuleId::null(), 0, true);
            filter.reset();
        }
        self.map_len = 0;
    }

    /// Keeps `map_len` covering the mapped prefix plus one empty slot.
    pub fn update_map_len(&mut self) {
        let last = self
            .handles
            .iter()
            .rposition(|handle| handle.is_mapped());
        self.map_len = last.map_or(0, |id| id + 1);
        if self.map_len < self.handles.len() {
            self.map_len += 1;
        }
    }

    pub fn enable_learn(&mut self, id: usize) {
        if self.learning_id != id as i32 {
            self.learning_id = id as i32;
            self.learned_param = false;
        }
    }

    pub fn disable_learn(&mut self, id: usize) {
        if self.learning_id == id as i32 {
            self.learning_id = -1;
        }
    }

    /// Ends a successful learning session and moves on to the next
    /// unmapped channel, if any.
    fn commit_learn(&mut self) {
        if self.learning_id < 0 || !self.learned_param {
            return;
        }
        self.learned_param = false;
        let mut id = self.learning_id as usize;
        loop {
            id += 1;
            if id >= self.handles.len() {
                self.learning_id = -1;
                return;
            }
            if !self.handles[id].is_mapped() {
                self.learning_id = id as i32;
                return;
            }
        }
    }

    /// Binds channel `id` to a parameter the user just touched. Stealing a
    /// parameter that is already mapped clears its previous owner.
    pub fn learn_param(&mut self, id: usize, module: ModuleId, param: usize, rack: &Rack) {
        rack.update_param_handle(&self.handles[id], module, param, true);
        self.learned_param = true;
        self.commit_learn();
        self.update_map_len();
    }

    /// Ticks the indicator animations on the divided clock.
    pub fn process_indicators(&mut self, args: &ProcessArgs) {
        if self.indicator_divider.tick() {
            let t = self.indicator_divider.division() as f32 * args.sample_time;
            for (handle, indicator) in self.handles.iter().zip(&mut self.indicators) {
                if handle.is_mapped() {
                    indicator.process(t);
                }
            }
        }
    }

    pub fn snapshot_maps(&self) -> Value {
        let maps: Vec<MapEntry> = self.handles[..self.map_len]
            .iter()
            .map(|handle| MapEntry {
                module_id: handle.module_id().to_snapshot(),
                param_id: handle.param_id() as i64,
            })
            .collect();
        serde_json::to_value(maps).unwrap_or(Value::Array(Vec::new()))
    }

    /// Rebinds handles from a snapshot. Targets are not arbitrated here;
    /// a stale id simply dangles and is skipped at process time.
    pub fn restore_maps(&mut self, maps: &[Value]) {
        self.learning_id = -1;
        for handle in &self.handles {
            handle.clear();
        }
        for filter in &mut self.filters {
            filter.reset();
        }
        for (id, map) in maps.iter().take(self.handles.len()).enumerate() {
            let Ok(entry) = serde_json::from_value::<MapEntry>(map.clone()) else {
                continue;
            };
            if entry.module_id < 0 || entry.param_id < 0 {
                continue;
            }
            let module = ModuleId::from_snapshot(entry.module_id);
            self.handles[id].assign(module, entry.param_id as usize);
        }
        self.update_map_len();
    }
}
