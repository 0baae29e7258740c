//! Plot and series data model.
//!
//! A plot owns one X axis (timestamps, in seconds) and one Y sequence
//! per series. All sequences advance in lockstep and are capped by a
//! rolling retention window (`max_points`): once full, appends drop the
//! oldest sample. The GUI renders directly from these buffers while the
//! worker thread appends, so the whole plot set of a handler lives
//! behind a single mutex held for the duration of each append batch.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::vars::{raw_to_double, VarType};

/// Default retention window of a freshly created plot.
pub const DEFAULT_MAX_POINTS: usize = 10_000;

/// Raw byte value that decodes to logic 1 on digital plots. A project
/// convention between the host and the target-side trace macros, not a
/// protocol detail.
pub const DIGITAL_HIGH: u32 = 0xaa;

/// Value domain of a plot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Domain {
    Analog,
    Digital,
}

/// A bound pair of variable and visibility inside a plot. The series
/// does not own the variable; it references it by name through the
/// `VariableHandler`.
#[derive(Debug, Clone)]
pub struct Series {
    var_name: String,
    pub visible: bool,
    y: VecDeque<f64>,
}

impl Series {
    fn new(var_name: impl Into<String>) -> Self {
        Series {
            var_name: var_name.into(),
            visible: true,
            y: VecDeque::new(),
        }
    }

    pub fn var_name(&self) -> &str {
        &self.var_name
    }

    pub fn values(&self) -> &VecDeque<f64> {
        &self.y
    }

    pub fn newest(&self) -> Option<f64> {
        self.y.back().copied()
    }
}

/// A plot: named, grouped, and fed by one of the data handlers.
pub struct Plot {
    name: String,
    alias: String,
    domain: Domain,
    trace_var_type: VarType,
    visible: bool,
    series: Vec<Series>,
    x: VecDeque<f64>,
    max_points: usize,
}

impl Plot {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Plot {
            alias: name.clone(),
            name,
            domain: Domain::Analog,
            trace_var_type: VarType::U32,
            visible: true,
            series: vec![],
            x: VecDeque::new(),
            max_points: DEFAULT_MAX_POINTS,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn set_alias(&mut self, alias: impl Into<String>) {
        self.alias = alias.into();
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn set_domain(&mut self, domain: Domain) {
        self.domain = domain;
    }

    pub fn trace_var_type(&self) -> VarType {
        self.trace_var_type
    }

    pub fn set_trace_var_type(&mut self, ty: VarType) {
        self.trace_var_type = ty;
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn max_points(&self) -> usize {
        self.max_points
    }

    /// Adds a series bound to `var_name`, if not already present.
    pub fn add_series(&mut self, var_name: &str) {
        if !self.series.iter().any(|s| s.var_name == var_name) {
            self.series.push(Series::new(var_name));
        }
    }

    pub fn remove_series(&mut self, var_name: &str) {
        self.series.retain(|s| s.var_name != var_name);
    }

    pub fn series(&self) -> &[Series] {
        &self.series
    }

    pub fn series_mut(&mut self, var_name: &str) -> Option<&mut Series> {
        self.series.iter_mut().find(|s| s.var_name == var_name)
    }

    pub fn rename_series(&mut self, old: &str, new: &str) {
        if let Some(series) = self.series.iter_mut().find(|s| s.var_name == old) {
            series.var_name = new.to_string();
        }
    }

    /// Appends one Y value to the named series, dropping the oldest
    /// sample when the retention window is full.
    pub fn add_point(&mut self, var_name: &str, y: f64) {
        let max_points = self.max_points;
        if let Some(series) = self.series.iter_mut().find(|s| s.var_name == var_name) {
            series.y.push_back(y);
            while series.y.len() > max_points {
                series.y.pop_front();
            }
        }
    }

    /// Appends one timestamp to the X axis.
    pub fn add_time_point(&mut self, x: f64) {
        self.x.push_back(x);
        while self.x.len() > self.max_points {
            self.x.pop_front();
        }
    }

    /// Recomputes each series' newest value via `resolve` (typically the
    /// `VariableHandler`'s current values).
    pub fn update_series(&mut self, mut resolve: impl FnMut(&str) -> Option<f64>) {
        let max_points = self.max_points;
        for series in self.series.iter_mut() {
            let value = resolve(&series.var_name).unwrap_or(0.0);
            series.y.push_back(value);
            while series.y.len() > max_points {
                series.y.pop_front();
            }
        }
    }

    /// Changes the retention window, truncating the oldest samples if
    /// the sequences are already longer.
    pub fn set_max_points(&mut self, max_points: usize) {
        self.max_points = max_points;
        while self.x.len() > max_points {
            self.x.pop_front();
        }
        for series in self.series.iter_mut() {
            while series.y.len() > max_points {
                series.y.pop_front();
            }
        }
    }

    pub fn time_axis(&self) -> &VecDeque<f64> {
        &self.x
    }

    /// Oldest retained timestamp, or 0 if nothing has been appended.
    pub fn oldest_time(&self) -> f64 {
        self.x.front().copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Drops all appended data, keeping the series configuration.
    pub fn erase_data(&mut self) {
        self.x.clear();
        for series in self.series.iter_mut() {
            series.y.clear();
        }
    }

    /// Converts a raw trace word to this plot's value domain: digital
    /// plots decode the [`DIGITAL_HIGH`] convention, analog plots
    /// reinterpret per the configured trace variable type.
    pub fn value_from_raw(&self, raw: u32) -> f64 {
        match self.domain {
            Domain::Digital => {
                if raw == DIGITAL_HIGH {
                    1.0
                } else {
                    0.0
                }
            }
            Domain::Analog => raw_to_double(self.trace_var_type, raw),
        }
    }
}

/// The set of plots a data handler feeds, behind the shared append/draw
/// mutex. Plots keep insertion order for reproducible iteration.
#[derive(Default)]
pub struct PlotHandler {
    plots: Mutex<Vec<Plot>>,
}

impl PlotHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an empty plot named `name` and returns whether it was newly
    /// created.
    pub fn add_plot(&self, name: &str) -> bool {
        let mut plots = self.plots.lock().unwrap();
        if plots.iter().any(|p| p.name() == name) {
            return false;
        }
        plots.push(Plot::new(name));
        true
    }

    pub fn remove_plot(&self, name: &str) {
        self.plots.lock().unwrap().retain(|p| p.name() != name);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plots.lock().unwrap().iter().any(|p| p.name() == name)
    }

    pub fn count(&self) -> usize {
        self.plots.lock().unwrap().len()
    }

    pub fn rename_plot(&self, old: &str, new: &str) -> bool {
        let mut plots = self.plots.lock().unwrap();
        match plots.iter_mut().find(|p| p.name() == old) {
            Some(plot) => {
                plot.set_name(new);
                true
            }
            None => false,
        }
    }

    /// Applies a new retention window to every plot.
    pub fn set_max_points(&self, max_points: usize) {
        for plot in self.plots.lock().unwrap().iter_mut() {
            plot.set_max_points(max_points);
        }
    }

    pub fn erase_all_data(&self) {
        for plot in self.plots.lock().unwrap().iter_mut() {
            plot.erase_data();
        }
    }

    /// Runs `f` with the plot list locked. One call per append batch or
    /// draw pass; everything inside is observed atomically by the other
    /// side.
    pub fn with<R>(&self, f: impl FnOnce(&mut Vec<Plot>) -> R) -> R {
        f(&mut self.plots.lock().unwrap())
    }
}
