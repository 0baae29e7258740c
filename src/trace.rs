//! The trace data handler.
//!
//! Drives the [`TraceReader`], maintains the per-channel running time,
//! applies the trigger logic and appends decoded points to the trace
//! plots. Health bookkeeping happens here as well: timestamps of error
//! frames and delayed class-3 timestamps are kept in view-pruned queues
//! so the GUI can mark them on the plots, and an excess of either stops
//! the session.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{error, info};

use crate::csv_streamer::CsvStreamer;
use crate::frame::{TraceCounters, TraceIndicators, CHANNELS, CHANNEL_MASK_WIDTH};
use crate::handler::{AcquisitionState, HandlerControl};
use crate::plot::{Domain, PlotHandler};
use crate::probe::{TraceProbe, TraceProbeSettings};
use crate::reader::TraceReader;
use crate::vars::Variable;

/// Idle poll period of the worker loop.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// When a view-pruned indicator queue grows past this, the session is
/// considered unhealthy and gets stopped.
const MAX_VIEWPORT_ERRORS: usize = 1000;

/// Channel colors, ABGR packed as in the render layer.
const CHANNEL_COLORS: [u32; 11] = [
    4_294_967_040,
    4_294_960_666,
    4_294_954_035,
    4_294_947_661,
    4_294_941_030,
    4_294_934_656,
    4_294_928_025,
    4_294_921_651,
    4_294_915_020,
    4_294_908_646,
    4_294_902_015,
];

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceSettings {
    pub max_points: usize,
    /// Channel index the trigger arms on; negative disables the
    /// trigger.
    pub trigger_channel: i32,
    pub trigger_level: f64,
    pub should_log: bool,
    pub log_file_path: PathBuf,
}

impl Default for TraceSettings {
    fn default() -> Self {
        TraceSettings {
            max_points: 10_000,
            trigger_channel: -1,
            trigger_level: 0.9,
            should_log: false,
            log_file_path: PathBuf::new(),
        }
    }
}

/// Timestamps of noteworthy frames, pruned against the oldest retained
/// plot sample so the count reflects what is actually in the viewport.
#[derive(Default)]
struct FrameTimestamps {
    times: VecDeque<f64>,
    last_total: u32,
}

impl FrameTimestamps {
    /// Appends `now` when `total` increased since the last call, then
    /// evicts entries older than `oldest`.
    fn handle(&mut self, now: f64, oldest: f64, total: u32) {
        if total > self.last_total {
            self.times.push_back(now);
        }
        self.last_total = total;

        while let Some(&front) = self.times.front() {
            if front < oldest {
                self.times.pop_front();
            } else {
                break;
            }
        }
    }

    fn len(&self) -> usize {
        self.times.len()
    }

    fn reset(&mut self) {
        self.times.clear();
        self.last_total = 0;
    }

    fn to_vec(&self) -> Vec<f64> {
        self.times.iter().copied().collect()
    }
}

struct Shared {
    control: HandlerControl,
    plots: Arc<PlotHandler>,
    trace_vars: Mutex<Vec<Variable>>,
    settings: Mutex<TraceSettings>,
    probe_settings: Mutex<TraceProbeSettings>,
    counters: Arc<TraceCounters>,
    reader_error: Arc<Mutex<String>>,
    probe_slot: Arc<Mutex<Option<Box<dyn TraceProbe>>>>,
    error_frames: Mutex<FrameTimestamps>,
    delayed3_frames: Mutex<FrameTimestamps>,
    last_error: Mutex<String>,
}

pub struct TraceDataHandler {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl TraceDataHandler {
    /// Creates the handler, registers the `CH0..CH9` trace plots on
    /// `plots` and starts the worker thread.
    pub fn new(plots: Arc<PlotHandler>, done: Arc<AtomicBool>) -> Self {
        let reader = TraceReader::new();

        let shared = Arc::new(Shared {
            control: HandlerControl::new(done),
            counters: reader.counters_handle(),
            reader_error: reader.error_handle(),
            probe_slot: reader.probe_slot(),
            plots,
            trace_vars: Mutex::new(vec![]),
            settings: Mutex::new(TraceSettings::default()),
            probe_settings: Mutex::new(TraceProbeSettings::default()),
            error_frames: Mutex::new(FrameTimestamps::default()),
            delayed3_frames: Mutex::new(FrameTimestamps::default()),
            last_error: Mutex::new(String::new()),
        });

        init_plots(&shared);

        let worker = {
            let shared = Arc::clone(&shared);
            thread::spawn(move || worker_loop(shared, reader))
        };

        TraceDataHandler {
            shared,
            worker: Some(worker),
        }
    }

    pub fn state(&self) -> AcquisitionState {
        self.shared.control.state()
    }

    pub fn set_state(&self, state: AcquisitionState) {
        self.shared.control.set_state(state);
    }

    pub fn settings(&self) -> TraceSettings {
        self.shared.settings.lock().unwrap().clone()
    }

    pub fn set_settings(&self, settings: TraceSettings) {
        self.shared.plots.set_max_points(settings.max_points);
        *self.shared.settings.lock().unwrap() = settings;
    }

    pub fn probe_settings(&self) -> TraceProbeSettings {
        self.shared.probe_settings.lock().unwrap().clone()
    }

    pub fn set_probe_settings(&self, settings: TraceProbeSettings) {
        *self.shared.probe_settings.lock().unwrap() = settings;
    }

    /// Selects the trace probe backend. Only while stopped.
    pub fn set_probe(&self, probe: Box<dyn TraceProbe>) {
        *self.shared.probe_slot.lock().unwrap() = Some(probe);
    }

    pub fn trigger_channel(&self) -> i32 {
        self.shared.settings.lock().unwrap().trigger_channel
    }

    pub fn set_trigger_channel(&self, channel: i32) {
        self.shared.settings.lock().unwrap().trigger_channel = channel;
    }

    /// Health counters including the in-viewport subsets.
    pub fn trace_indicators(&self) -> TraceIndicators {
        let mut indicators = self.shared.counters.snapshot();
        indicators.error_frames_in_view =
            self.shared.error_frames.lock().unwrap().len() as u32;
        indicators.delayed_timestamp3_in_view =
            self.shared.delayed3_frames.lock().unwrap().len() as u32;
        indicators
    }

    /// Timestamps of error frames still inside the viewport.
    pub fn error_timestamps(&self) -> Vec<f64> {
        self.shared.error_frames.lock().unwrap().to_vec()
    }

    /// Timestamps of delayed class-3 frames still inside the viewport.
    pub fn delayed3_timestamps(&self) -> Vec<f64> {
        self.shared.delayed3_frames.lock().unwrap().to_vec()
    }

    /// The reader's error message if any, else the handler's own.
    pub fn last_reader_error(&self) -> String {
        let reader_msg = self.shared.reader_error.lock().unwrap().clone();
        if reader_msg.is_empty() {
            self.shared.last_error.lock().unwrap().clone()
        } else {
            reader_msg
        }
    }

    /// Metadata (color, type) of the per-channel trace variables.
    pub fn trace_variables(&self) -> Vec<Variable> {
        self.shared.trace_vars.lock().unwrap().clone()
    }
}

impl Drop for TraceDataHandler {
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

/// One plot and one variable per channel. Trace plots default to the
/// digital domain; the GUI switches individual channels to analog with
/// a concrete type.
fn init_plots(shared: &Shared) {
    let mut trace_vars = shared.trace_vars.lock().unwrap();
    for i in 0..CHANNELS {
        let name = format!("CH{}", i);

        let mut var = Variable::new(&name);
        var.set_color(CHANNEL_COLORS[i % CHANNEL_COLORS.len()]);
        var.set_should_update_from_elf(false);
        trace_vars.push(var);

        shared.plots.add_plot(&name);
        shared.plots.with(|plots| {
            if let Some(plot) = plots.iter_mut().find(|p| p.name() == name) {
                plot.add_series(&name);
                plot.set_domain(Domain::Digital);
                plot.set_alias(&name);
            }
        });
    }
}

fn worker_loop(shared: Arc<Shared>, mut reader: TraceReader) {
    let mut cnt: u32 = 0;
    let mut time = 0.0;
    let mut triggered = false;
    let mut csv = CsvStreamer::new();
    let mut csv_entry: HashMap<String, f64> = HashMap::new();

    while !shared.control.is_done() {
        if shared.control.take_state_change() {
            if shared.control.state() == AcquisitionState::Run {
                let mut active = [false; CHANNEL_MASK_WIDTH];
                shared.plots.with(|plots| {
                    for (i, plot) in plots.iter().enumerate() {
                        if i < CHANNEL_MASK_WIDTH {
                            active[i] = plot.visible();
                        }
                    }
                });

                shared.error_frames.lock().unwrap().reset();
                shared.delayed3_frames.lock().unwrap().reset();
                shared.last_error.lock().unwrap().clear();
                csv_entry.clear();

                prepare_csv_file(&shared, &mut csv);

                let probe_settings = shared.probe_settings.lock().unwrap().clone();
                if reader.start_acquisition(&probe_settings, &active) {
                    time = 0.0;
                } else {
                    shared.control.force_state(AcquisitionState::Stop);
                }
            } else {
                reader.stop_acquisition();
                if shared.settings.lock().unwrap().should_log {
                    csv.finish_logging();
                }
                triggered = false;
            }
        }

        if shared.control.state() == AcquisitionState::Run {
            if !reader.is_valid() {
                error!("trace invalid, stopping");
                shared.control.set_state(AcquisitionState::Stop);
            }

            if let Some((delta, values)) = reader.read_trace() {
                time += delta;

                let settings = shared.settings.lock().unwrap().clone();
                let oldest = shared.plots.with(|plots| {
                    plots.first().map(|p| p.oldest_time()).unwrap_or(0.0)
                });

                let indicators = reader.indicators();
                shared.error_frames.lock().unwrap().handle(
                    time,
                    oldest,
                    indicators.error_frames_total,
                );
                shared.delayed3_frames.lock().unwrap().handle(
                    time,
                    oldest,
                    indicators.delayed_timestamp3,
                );

                shared.plots.with(|plots| {
                    for (i, plot) in plots.iter_mut().enumerate() {
                        if !plot.visible() || i >= CHANNELS {
                            continue;
                        }
                        let series_name = match plot.series().first() {
                            Some(series) => series.var_name().to_string(),
                            None => continue,
                        };

                        let new_point = plot.value_from_raw(values[i]);

                        if !triggered
                            && i as i32 == settings.trigger_channel
                            && plot.domain() == Domain::Analog
                            && new_point > settings.trigger_level
                        {
                            info!("trigger on channel {}", i);
                            triggered = true;
                            cnt = 0;
                        }

                        csv_entry.insert(series_name.clone(), new_point);

                        plot.add_point(&series_name, new_point);
                        plot.add_time_point(time);
                    }
                });

                if settings.should_log {
                    csv.write_line(time, &csv_entry);
                }

                if triggered {
                    if cnt as f64 >= settings.max_points as f64 * 0.9 {
                        info!("after-trigger trace collected, stopping");
                        shared.control.set_state(AcquisitionState::Stop);
                    }
                    cnt += 1;
                }

                if shared.error_frames.lock().unwrap().len() > MAX_VIEWPORT_ERRORS {
                    *shared.last_error.lock().unwrap() = "Too many error frames!".to_string();
                    error!("too many error frames; check clock and prescaler settings");
                    shared.control.set_state(AcquisitionState::Stop);
                }

                if shared.delayed3_frames.lock().unwrap().len() > MAX_VIEWPORT_ERRORS {
                    *shared.last_error.lock().unwrap() =
                        "Too many delayed timestamp 3 frames!".to_string();
                    error!(
                        "too many delayed timestamp 3 frames; check clock and prescaler \
                         settings or limit the logged channels"
                    );
                    shared.control.set_state(AcquisitionState::Stop);
                }
            }
        } else {
            thread::sleep(IDLE_POLL);
        }
    }
    info!("exiting trace data handler thread");
}

fn prepare_csv_file(shared: &Shared, csv: &mut CsvStreamer) {
    let settings = shared.settings.lock().unwrap().clone();
    if !settings.should_log {
        return;
    }

    let header_names = shared.plots.with(|plots| {
        plots
            .iter()
            .enumerate()
            .filter(|(_, plot)| plot.visible())
            .map(|(i, _)| format!("CH{}", i))
            .collect::<Vec<_>>()
    });

    csv.prepare_file(&settings.log_file_path);
    csv.create_header(&header_names);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_timestamps_track_counter_and_viewport() {
        let mut frames = FrameTimestamps::default();

        frames.handle(1.0, 0.0, 1); // counter went 0 -> 1
        frames.handle(2.0, 0.0, 1); // unchanged
        frames.handle(3.0, 0.0, 2); // 1 -> 2
        assert_eq!(frames.len(), 2);
        assert_eq!(frames.to_vec(), [1.0, 3.0]);

        // viewport moved past the first entry
        frames.handle(4.0, 2.5, 3);
        assert_eq!(frames.to_vec(), [3.0, 4.0]);

        frames.reset();
        assert_eq!(frames.len(), 0);
    }

    #[test]
    fn in_view_counts_follow_pruning() {
        let mut frames = FrameTimestamps::default();
        for i in 1..=5 {
            frames.handle(i as f64, 0.0, i);
        }
        assert_eq!(frames.len(), 5);

        // everything before t=4 left the viewport
        frames.handle(6.0, 4.0, 6);
        assert_eq!(frames.to_vec(), [4.0, 5.0, 6.0]);
    }
}
