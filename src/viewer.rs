//! The sample-based viewer data handler.
//!
//! Owns a worker thread that polls at ~50 Hz while stopped and samples
//! the active group's working set while running, either by reading each
//! address through the probe or by draining the probe's own
//! host-synchronous stream (HSS). Sampled values flow into the
//! variables, the visible plots and, optionally, the CSV log.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::csv_streamer::CsvStreamer;
use crate::handler::{AcquisitionState, HandlerControl, SamplingFilter};
use crate::groups::PlotGroupHandler;
use crate::plot::PlotHandler;
use crate::probe::{DebugProbe, DebugProbeSettings, MemoryReader, Mode, SampleList};
use crate::vars::{value_in, VariableHandler};

/// Idle poll period of the worker loop.
const IDLE_POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ViewerSettings {
    pub sample_frequency_hz: f64,
    pub max_points: usize,
    pub should_log: bool,
    pub log_file_path: PathBuf,
}

impl Default for ViewerSettings {
    fn default() -> Self {
        ViewerSettings {
            sample_frequency_hz: 100.0,
            max_points: 10_000,
            should_log: false,
            log_file_path: PathBuf::new(),
        }
    }
}

struct Shared {
    control: HandlerControl,
    reader: MemoryReader,
    plots: Arc<PlotHandler>,
    vars: Arc<VariableHandler>,
    groups: Arc<PlotGroupHandler>,
    settings: Mutex<ViewerSettings>,
    probe_settings: Mutex<DebugProbeSettings>,
    average_period: Mutex<f64>,
    last_error: Mutex<String>,
}

pub struct ViewerDataHandler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl ViewerDataHandler {
    pub fn new(
        plots: Arc<PlotHandler>,
        vars: Arc<VariableHandler>,
        groups: Arc<PlotGroupHandler>,
        done: Arc<AtomicBool>,
    ) -> Self {
        let shared = Arc::new(Shared {
            control: HandlerControl::new(done),
            reader: MemoryReader::new(),
            plots,
            vars,
            groups,
            settings: Mutex::new(ViewerSettings::default()),
            probe_settings: Mutex::new(DebugProbeSettings::default()),
            average_period: Mutex::new(0.0),
            last_error: Mutex::new(String::new()),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || worker_loop(shared))
        };

        ViewerDataHandler {
            shared,
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.shared.control.state()
    }

    /// Orders a state transition; the worker performs it within one
    /// poll cycle.
    pub fn set_state(&self, state: AcquisitionState) {
        self.shared.control.set_state(state);
    }

    pub fn settings(&self) -> ViewerSettings {
        self.shared.settings.lock().unwrap().clone()
    }

    pub fn set_settings(&self, settings: ViewerSettings) {
        self.shared.plots.set_max_points(settings.max_points);
        *self.shared.settings.lock().unwrap() = settings;
    }

    pub fn probe_settings(&self) -> DebugProbeSettings {
        self.shared.probe_settings.lock().unwrap().clone()
    }

    pub fn set_probe_settings(&self, settings: DebugProbeSettings) {
        *self.shared.probe_settings.lock().unwrap() = settings;
    }

    /// Selects the debug probe backend. Only while stopped.
    pub fn set_probe(&self, probe: Box<dyn DebugProbe>) {
        self.shared.reader.change_device(probe);
    }

    /// EMA of the observed inter-sample period, for UI display.
    pub fn average_sampling_period(&self) -> f64 {
        *self.shared.average_period.lock().unwrap()
    }

    /// The probe's error message if any, else the handler's own.
    pub fn last_reader_error(&self) -> String {
        let probe_msg = self.shared.reader.last_error_msg();
        if probe_msg.is_empty() {
            self.shared.last_error.lock().unwrap().clone()
        } else {
            probe_msg
        }
    }

    /// Writes a user-entered value back to the target through the
    /// variable's type conversion.
    pub fn write_series_value(&self, var_name: &str, value: f64) -> bool {
        let var = match self.shared.vars.get(var_name) {
            Some(var) => var,
            None => return false,
        };
        let raw = var.raw_from_double(value);
        self.shared.reader.set_value(var.address(), var.size(), raw)
    }
}

impl Drop for ViewerDataHandler {
    fn drop(&mut self) {
        self.shared
            .control
            .done_handle()
            .store(true, std::sync::atomic::Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>) {
    let mut csv = CsvStreamer::new();
    let mut sample_list: SampleList = vec![];
    let mut filter = SamplingFilter::new();
    let mut start = Instant::now();
    let mut tick: u32 = 0;
    let mut last_t = 0.0;

    while !shared.control.is_done() {
        if shared.control.take_state_change() {
            if shared.control.state() == AcquisitionState::Run {
                sample_list = create_sample_list(&shared);
                prepare_csv_file(&shared, &mut csv);

                let probe_settings = shared.probe_settings.lock().unwrap().clone();
                let frequency = shared.settings.lock().unwrap().sample_frequency_hz as u32;

                if shared
                    .reader
                    .start(&probe_settings, &sample_list, frequency)
                {
                    tick = 0;
                    last_t = 0.0;
                    filter.reset();
                    start = Instant::now();
                } else {
                    let msg = shared.reader.last_error_msg();
                    *shared.last_error.lock().unwrap() = if msg.is_empty() {
                        "failed to start the debug probe".to_string()
                    } else {
                        msg
                    };
                    shared.control.force_state(AcquisitionState::Stop);
                }
            } else {
                shared.reader.stop();
                if shared.settings.lock().unwrap().should_log {
                    csv.finish_logging();
                }
            }
        }

        if shared.control.state() == AcquisitionState::Run {
            let period = start.elapsed().as_secs_f64();
            let mode = shared.probe_settings.lock().unwrap().mode;
            let (frequency, should_log) = {
                let settings = shared.settings.lock().unwrap();
                (settings.sample_frequency_hz, settings.should_log)
            };

            if mode == Mode::Hss {
                match shared.reader.read_single_entry() {
                    Some((timestamp, raw_values)) => {
                        update_variables(&shared, timestamp, &raw_values, &mut csv, should_log);

                        *shared.average_period.lock().unwrap() = filter.filter(period - last_t);
                        last_t = period;
                        tick += 1;
                    }
                    None => thread::sleep(Duration::from_micros(100)),
                }
            } else if period > (1.0 / frequency) * tick as f64 {
                let mut raw_values = HashMap::new();

                // sample by address; failed reads simply omit the entry
                for &(address, size) in &sample_list {
                    if let Some(value) = shared.reader.get_value(address, size) {
                        raw_values.insert(address, value);
                    }
                }

                update_variables(&shared, period, &raw_values, &mut csv, should_log);

                *shared.average_period.lock().unwrap() = filter.filter(period - last_t);
                last_t = period;
                tick += 1;
            } else {
                // below the sample gate; yield briefly
                thread::sleep(Duration::from_micros(100));
            }
        } else {
            thread::sleep(IDLE_POLL);
        }
    }
    info!("exiting viewer data handler thread");
}

/// Writes raw values into the matching variables, then appends one
/// sample to every visible plot under the shared plot mutex, then
/// mirrors the tick to the CSV log.
fn update_variables(
    shared: &Shared,
    timestamp: f64,
    raw_values: &HashMap<u32, u32>,
    csv: &mut CsvStreamer,
    should_log: bool,
) {
    shared.vars.apply_raw_values(raw_values);

    let mut csv_entry = HashMap::new();
    shared.vars.with(|list| {
        for var in list.iter() {
            if raw_values.contains_key(&var.address()) {
                csv_entry.insert(var.name().to_string(), value_in(list, var));
            }
        }
    });

    shared.plots.with(|plots| {
        for plot in plots.iter_mut() {
            if !plot.visible() {
                continue;
            }
            plot.update_series(|name| shared.vars.value_of(name));
            plot.add_time_point(timestamp);
        }
    });

    if should_log {
        csv.write_line(timestamp, &csv_entry);
    }
}

/// The deduplicated `(address, size)` working set: every visible series
/// of the active group, extended with the bases of fractional
/// variables.
fn create_sample_list(shared: &Shared) -> SampleList {
    let mut list = SampleList::new();
    let mut push_unique = |list: &mut SampleList, entry: (u32, u8)| {
        if !list.contains(&entry) {
            list.push(entry);
        }
    };

    if let Some(group) = shared.groups.active_group() {
        for entry in group.entries().iter().filter(|e| e.visible) {
            shared.plots.with(|plots| {
                if let Some(plot) = plots.iter().find(|p| p.name() == entry.plot_name) {
                    for series in plot.series().iter().filter(|s| s.visible) {
                        if let Some(var) = shared.vars.get(series.var_name()) {
                            push_unique(&mut list, (var.address(), var.size()));
                        }
                    }
                }
            });
        }
    }

    // bases of fractional variables have to be sampled as well
    for entry in shared.vars.fraction_base_entries() {
        push_unique(&mut list, entry);
    }

    debug!("sample list rebuilt: {} entries", list.len());
    list
}

fn prepare_csv_file(shared: &Shared, csv: &mut CsvStreamer) {
    let settings = shared.settings.lock().unwrap().clone();
    if !settings.should_log {
        return;
    }

    let mut header_names = vec![];
    if let Some(group) = shared.groups.active_group() {
        for entry in group.entries().iter().filter(|e| e.visible) {
            shared.plots.with(|plots| {
                if let Some(plot) = plots.iter().find(|p| p.name() == entry.plot_name) {
                    for series in plot.series() {
                        header_names.push(series.var_name().to_string());
                    }
                }
            });
        }
    }

    csv.prepare_file(&settings.log_file_path);
    csv.create_header(&header_names);
}
