//! Uniform contracts over the supported debug-probe backends.
//!
//! Two capability sets exist: [`DebugProbe`] reads and writes target
//! memory by address (sampling mode), [`TraceProbe`] streams the raw
//! trace byte stream from the target's trace unit. Concrete ST-Link and
//! J-Link backends live outside this crate and plug in through these
//! traits; the handlers only ever talk to the trait objects.

use std::collections::HashMap;
use std::sync::Mutex;

/// The wire protocol used to talk to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum WireInterface {
    Swd,
    Jtag,
}

/// The debug-probe hardware family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProbeDevice {
    StLink,
    JLink,
}

/// Sampling transport mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Mode {
    /// The host polls each address in the sample list.
    Normal,

    /// Host-synchronous streaming: the probe assembles timestamped
    /// entries on its own and the host drains them.
    Hss,
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Normal
    }
}

/// Settings for a memory-oriented probe session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugProbeSettings {
    pub device: ProbeDevice,
    pub serial_number: String,
    pub interface: WireInterface,
    pub mode: Mode,
    pub speed_khz: u32,
}

impl Default for DebugProbeSettings {
    fn default() -> Self {
        DebugProbeSettings {
            device: ProbeDevice::StLink,
            serial_number: String::new(),
            interface: WireInterface::Swd,
            mode: Mode::Normal,
            speed_khz: 100,
        }
    }
}

/// Settings for a trace-probe session.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TraceProbeSettings {
    pub device: ProbeDevice,
    pub serial_number: String,
    pub speed_khz: u32,
    /// Core clock of the target, used to scale trace timestamps.
    pub core_frequency_hz: u32,
    /// Divider applied to the trace timestamp clock.
    pub trace_prescaler: u32,
    /// Whether the target should be reset when acquisition starts.
    pub should_reset: bool,
    /// Probe-internal read timeout.
    pub timeout_ms: u32,
    /// Number of trace IO pins used (1 = SWO).
    pub trace_pins: u8,
}

impl Default for TraceProbeSettings {
    fn default() -> Self {
        TraceProbeSettings {
            device: ProbeDevice::StLink,
            serial_number: String::new(),
            speed_khz: 10_000,
            core_frequency_hz: 160_000_000,
            trace_prescaler: 1,
            should_reset: false,
            timeout_ms: 2,
            trace_pins: 1,
        }
    }
}

/// A deduplicated `(address, size)` working set sampled each tick.
pub type SampleList = Vec<(u32, u8)>;

/// One host-synchronous streaming entry: a timestamp in seconds and the
/// raw values read, keyed by address.
pub type VarEntry = (f64, HashMap<u32, u32>);

/// Memory-oriented probe capability set.
pub trait DebugProbe: Send {
    /// Starts a sampling session. Returns `false` on failure; the
    /// reason is available through [`last_error_msg`](Self::last_error_msg).
    fn start(
        &mut self,
        settings: &DebugProbeSettings,
        sample_list: &SampleList,
        sample_frequency_hz: u32,
    ) -> bool;

    fn stop(&mut self) -> bool;

    fn is_valid(&self) -> bool;

    /// Reads a value of `size` bytes at `address`. `None` if the read
    /// failed; the tick then simply omits that variable.
    fn get_value(&mut self, address: u32, size: u8) -> Option<u32>;

    /// Writes the lowest `size` bytes of `value` to `address`.
    fn set_value(&mut self, address: u32, size: u8, value: u32) -> bool;

    fn read_memory(&mut self, address: u32, buf: &mut [u8]) -> bool;

    fn write_memory(&mut self, address: u32, buf: &[u8]) -> bool;

    /// Drains one entry in HSS mode. `None` when no entry is ready.
    fn read_single_entry(&mut self) -> Option<VarEntry>;

    fn last_error_msg(&self) -> String;

    fn connected_devices(&mut self) -> Vec<String>;

    fn target_name(&self) -> String {
        String::new()
    }
}

/// Trace-oriented probe capability set.
pub trait TraceProbe: Send {
    /// Arms the trace unit and starts streaming. `active_channels`
    /// selects the stimulus ports the target is expected to use.
    fn start_acquisition(
        &mut self,
        settings: &TraceProbeSettings,
        active_channels: &[bool; crate::frame::CHANNEL_MASK_WIDTH],
    ) -> bool;

    fn stop_acquisition(&mut self) -> bool;

    fn is_valid(&self) -> bool;

    /// Reads the next raw chunk into `buf`. `Some(0)` when no data
    /// arrived within the probe's internal timeout, `None` on a probe
    /// error.
    fn read_trace_chunk(&mut self, buf: &mut [u8]) -> Option<usize>;

    fn last_error_msg(&self) -> String;

    fn connected_devices(&mut self) -> Vec<String>;
}

/// Shared, swappable handle to a [`DebugProbe`].
///
/// The GUI selects the probe while acquisition is stopped; the worker
/// thread drives it afterwards. A mutex-guarded slot keeps both sides
/// honest without threading lifetimes through the handlers.
#[derive(Default)]
pub struct MemoryReader {
    probe: Mutex<Option<Box<dyn DebugProbe>>>,
}

impl MemoryReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the backing probe. Only called while stopped.
    pub fn change_device(&self, probe: Box<dyn DebugProbe>) {
        *self.probe.lock().unwrap() = Some(probe);
    }

    pub fn start(
        &self,
        settings: &DebugProbeSettings,
        sample_list: &SampleList,
        sample_frequency_hz: u32,
    ) -> bool {
        match self.probe.lock().unwrap().as_mut() {
            Some(probe) => probe.start(settings, sample_list, sample_frequency_hz),
            None => false,
        }
    }

    pub fn stop(&self) -> bool {
        match self.probe.lock().unwrap().as_mut() {
            Some(probe) => probe.stop(),
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self.probe.lock().unwrap().as_ref() {
            Some(probe) => probe.is_valid(),
            None => false,
        }
    }

    pub fn get_value(&self, address: u32, size: u8) -> Option<u32> {
        self.probe
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|probe| probe.get_value(address, size))
    }

    pub fn set_value(&self, address: u32, size: u8, value: u32) -> bool {
        match self.probe.lock().unwrap().as_mut() {
            Some(probe) => probe.set_value(address, size, value),
            None => false,
        }
    }

    pub fn read_single_entry(&self) -> Option<VarEntry> {
        self.probe
            .lock()
            .unwrap()
            .as_mut()
            .and_then(|probe| probe.read_single_entry())
    }

    pub fn last_error_msg(&self) -> String {
        self.probe
            .lock()
            .unwrap()
            .as_ref()
            .map(|probe| probe.last_error_msg())
            .unwrap_or_default()
    }

    pub fn connected_devices(&self) -> Vec<String> {
        self.probe
            .lock()
            .unwrap()
            .as_mut()
            .map(|probe| probe.connected_devices())
            .unwrap_or_default()
    }
}
