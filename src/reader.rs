//! The trace reader: raw byte acquisition, decoding and frame delivery.
//!
//! An internal probe-reader thread drains the probe into a bounded ring
//! buffer of raw chunks. The consumer side (the trace data handler's
//! worker) pulls chunks out of the ring, runs them through the packet
//! [`Decoder`] and the [`FrameBuilder`], and receives whole
//! [`TraceFrame`]s with their delta timestamps scaled to seconds.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

use crate::decoder::Decoder;
use crate::frame::{
    FrameBuilder, TraceCounters, TraceIndicators, CHANNELS, CHANNEL_MASK_WIDTH,
};
use crate::probe::{TraceProbe, TraceProbeSettings};
use crate::ring::RingBuffer;

/// Capacity of the raw-chunk queue between the probe-reader thread and
/// the decoder.
const RAW_QUEUE_CAPACITY: usize = 2048;

/// Probe read granularity.
const CHUNK_SIZE: usize = 1024;

/// How long the consumer waits for a raw chunk before reporting "no
/// frame".
const READ_TIMEOUT: Duration = Duration::from_millis(100);

type ProbeSlot = Arc<Mutex<Option<Box<dyn TraceProbe>>>>;

pub struct TraceReader {
    probe: ProbeSlot,
    raw: Arc<RingBuffer<Vec<u8>, RAW_QUEUE_CAPACITY>>,
    counters: Arc<TraceCounters>,
    error_msg: Arc<Mutex<String>>,
    valid: Arc<AtomicBool>,
    quit: Arc<AtomicBool>,
    reader_thread: Option<JoinHandle<()>>,

    decoder: Decoder,
    builder: FrameBuilder,
    frames: VecDeque<(f64, [u32; CHANNELS])>,

    /// Seconds per trace clock tick, derived from the core frequency
    /// and prescaler at acquisition start.
    tick_seconds: f64,
}

impl Default for TraceReader {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceReader {
    pub fn new() -> Self {
        let counters = Arc::new(TraceCounters::default());
        TraceReader {
            probe: Arc::new(Mutex::new(None)),
            raw: Arc::new(RingBuffer::new()),
            builder: FrameBuilder::new([false; CHANNEL_MASK_WIDTH], Arc::clone(&counters)),
            counters,
            error_msg: Arc::new(Mutex::new(String::new())),
            valid: Arc::new(AtomicBool::new(false)),
            quit: Arc::new(AtomicBool::new(false)),
            reader_thread: None,
            decoder: Decoder::new(),
            frames: VecDeque::new(),
            tick_seconds: 0.0,
        }
    }

    /// Replaces the backing probe. Only called while stopped.
    pub fn change_device(&self, probe: Box<dyn TraceProbe>) {
        *self.probe.lock().unwrap() = Some(probe);
    }

    /// Cheap shared handle for indicator display outside the worker.
    pub fn counters_handle(&self) -> Arc<TraceCounters> {
        Arc::clone(&self.counters)
    }

    /// Cheap shared handle to the reader's error message.
    pub fn error_handle(&self) -> Arc<Mutex<String>> {
        Arc::clone(&self.error_msg)
    }

    pub(crate) fn probe_slot(&self) -> ProbeSlot {
        Arc::clone(&self.probe)
    }

    /// Arms the probe and spawns the probe-reader thread. On failure the
    /// reader stays stopped and the reason lands in
    /// [`last_error_msg`](Self::last_error_msg).
    pub fn start_acquisition(
        &mut self,
        settings: &TraceProbeSettings,
        active_channels: &[bool; CHANNEL_MASK_WIDTH],
    ) -> bool {
        {
            let mut probe = self.probe.lock().unwrap();
            let probe = match probe.as_mut() {
                Some(probe) => probe,
                None => {
                    *self.error_msg.lock().unwrap() = "no trace probe selected".to_string();
                    return false;
                }
            };

            if !probe.start_acquisition(settings, active_channels) {
                *self.error_msg.lock().unwrap() = probe.last_error_msg();
                return false;
            }
        }

        self.counters.reset();
        self.raw.clear();
        self.decoder.reset();
        self.frames.clear();
        self.builder = FrameBuilder::new(*active_channels, Arc::clone(&self.counters));
        self.error_msg.lock().unwrap().clear();
        self.tick_seconds = if settings.core_frequency_hz > 0 {
            settings.trace_prescaler.max(1) as f64 / settings.core_frequency_hz as f64
        } else {
            0.0
        };

        self.quit.store(false, Ordering::Release);
        self.valid.store(true, Ordering::Release);

        let probe = Arc::clone(&self.probe);
        let raw = Arc::clone(&self.raw);
        let counters = Arc::clone(&self.counters);
        let error_msg = Arc::clone(&self.error_msg);
        let valid = Arc::clone(&self.valid);
        let quit = Arc::clone(&self.quit);

        self.reader_thread = Some(thread::spawn(move || {
            let mut buf = [0u8; CHUNK_SIZE];
            while !quit.load(Ordering::Acquire) {
                let read = {
                    let mut probe = probe.lock().unwrap();
                    match probe.as_mut() {
                        Some(probe) => probe.read_trace_chunk(&mut buf),
                        None => None,
                    }
                };

                match read {
                    Some(0) => continue, // probe timeout, nothing new
                    Some(n) => {
                        if !raw.push(buf[..n].to_vec()) {
                            // consumer is behind; the stream now has a
                            // hole and the decoder will resynchronize
                            warn!("raw trace queue overrun, chunk dropped");
                            counters.note_error_frame();
                        }
                    }
                    None => {
                        let msg = {
                            let probe = probe.lock().unwrap();
                            probe
                                .as_ref()
                                .map(|p| p.last_error_msg())
                                .unwrap_or_default()
                        };
                        *error_msg.lock().unwrap() = if msg.is_empty() {
                            "trace probe read failed".to_string()
                        } else {
                            msg
                        };
                        valid.store(false, Ordering::Release);
                        break;
                    }
                }
            }
            info!("trace probe reader thread exiting");
        }));

        true
    }

    /// Stops the probe-reader thread and the probe. Returns within one
    /// ring-buffer timeout.
    pub fn stop_acquisition(&mut self) -> bool {
        self.quit.store(true, Ordering::Release);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
        self.valid.store(false, Ordering::Release);

        match self.probe.lock().unwrap().as_mut() {
            Some(probe) => probe.stop_acquisition(),
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Returns the next decoded frame as `(delta seconds, channel
    /// values)`, or `None` when nothing was decodable within the read
    /// timeout. A zero delta means no time advance.
    pub fn read_trace(&mut self) -> Option<(f64, [u32; CHANNELS])> {
        if let Some(frame) = self.frames.pop_front() {
            return Some(frame);
        }

        let chunk = self.raw.pop_timeout(READ_TIMEOUT)?;
        self.decoder.push(&chunk);

        loop {
            match self.decoder.pull() {
                Ok(Some(packet)) => {
                    if let Some(frame) = self.builder.feed(packet) {
                        self.frames.push_back((
                            frame.delta_ticks as f64 * self.tick_seconds,
                            frame.values,
                        ));
                    }
                }
                Ok(None) => break,
                Err(_) => self.counters.note_error_frame(),
            }
        }

        self.frames.pop_front()
    }

    /// Snapshot of the health counters. The in-view subsets are filled
    /// in by the trace data handler.
    pub fn indicators(&self) -> TraceIndicators {
        self.counters.snapshot()
    }

    pub fn last_error_msg(&self) -> String {
        self.error_msg.lock().unwrap().clone()
    }
}

impl Drop for TraceReader {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::Release);
        if let Some(handle) = self.reader_thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Serves a canned byte stream chunk by chunk, then reports
    /// timeouts.
    struct CannedProbe {
        data: Vec<u8>,
        pos: usize,
        started: bool,
    }

    impl CannedProbe {
        fn new(data: Vec<u8>) -> Self {
            CannedProbe {
                data,
                pos: 0,
                started: false,
            }
        }
    }

    impl TraceProbe for CannedProbe {
        fn start_acquisition(
            &mut self,
            _settings: &TraceProbeSettings,
            _active_channels: &[bool; CHANNEL_MASK_WIDTH],
        ) -> bool {
            self.started = true;
            true
        }

        fn stop_acquisition(&mut self) -> bool {
            self.started = false;
            true
        }

        fn is_valid(&self) -> bool {
            true
        }

        fn read_trace_chunk(&mut self, buf: &mut [u8]) -> Option<usize> {
            if self.pos >= self.data.len() {
                // back off so the reader thread does not spin hot
                thread::sleep(Duration::from_millis(1));
                return Some(0);
            }
            let n = (self.data.len() - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Some(n)
        }

        fn last_error_msg(&self) -> String {
            String::new()
        }

        fn connected_devices(&mut self) -> Vec<String> {
            vec!["canned".to_string()]
        }
    }

    #[test]
    fn frames_flow_end_to_end() {
        #[rustfmt::skip]
        let stream = vec![
            // channel 0 = 0xaa, then LTS2 delta 2
            0b0000_0001, 0xaa,
            0b0010_0000,
            // channel 1 = 0x01, then LTS2 delta 3
            0b0000_1001, 0x01,
            0b0011_0000,
        ];

        let mut reader = TraceReader::new();
        reader.change_device(Box::new(CannedProbe::new(stream)));

        let settings = TraceProbeSettings {
            core_frequency_hz: 1_000,
            trace_prescaler: 1,
            ..Default::default()
        };
        let mut active = [false; CHANNEL_MASK_WIDTH];
        active[0] = true;
        active[1] = true;

        assert!(reader.start_acquisition(&settings, &active));

        let mut frames = vec![];
        while frames.len() < 2 {
            if let Some(frame) = reader.read_trace() {
                frames.push(frame);
            }
        }
        assert!(reader.stop_acquisition());

        let (delta, values) = &frames[0];
        assert!((delta - 0.002).abs() < 1e-12);
        assert_eq!(values[0], 0xaa);

        let (delta, values) = &frames[1];
        assert!((delta - 0.003).abs() < 1e-12);
        assert_eq!(values[0], 0xaa, "unchanged channel keeps its shadow");
        assert_eq!(values[1], 0x01);
    }

    #[test]
    fn unknown_header_counts_one_error_and_decoding_resumes() {
        #[rustfmt::skip]
        let stream = vec![
            // a header outside the configured stream
            0b1001_0100,
            // followed by a valid sample on channel 0
            0b0000_0001, 0x2a,
            0b0001_0000, // LTS2, delta 1
        ];

        let mut reader = TraceReader::new();
        reader.change_device(Box::new(CannedProbe::new(stream)));

        let settings = TraceProbeSettings {
            core_frequency_hz: 1_000,
            trace_prescaler: 1,
            ..Default::default()
        };
        let mut active = [false; CHANNEL_MASK_WIDTH];
        active[0] = true;

        assert!(reader.start_acquisition(&settings, &active));

        let frame = loop {
            if let Some(frame) = reader.read_trace() {
                break frame;
            }
        };
        reader.stop_acquisition();

        assert_eq!(frame.1[0], 0x2a);
        assert_eq!(reader.indicators().error_frames_total, 1);
    }

    #[test]
    fn start_without_probe_fails() {
        let mut reader = TraceReader::new();
        let active = [false; CHANNEL_MASK_WIDTH];
        assert!(!reader.start_acquisition(&TraceProbeSettings::default(), &active));
        assert!(!reader.last_error_msg().is_empty());
    }
}
