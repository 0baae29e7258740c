//! Frame assembly on top of the packet [`Decoder`](crate::decoder::Decoder).
//!
//! The target writes one variable value per stimulus port, then the
//! trace unit appends a local timestamp. The [`FrameBuilder`] keeps a
//! last-value shadow for every channel so that each timestamp event can
//! be turned into a full [`TraceFrame`]: the delta time plus a snapshot
//! of all channels, including those that did not change since the last
//! frame.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::decoder::{TimestampDataRelation, TracePacket};

/// Number of trace channels surfaced as plots.
pub const CHANNELS: usize = 10;

/// Width of the stimulus-port active mask.
pub const CHANNEL_MASK_WIDTH: usize = 32;

/// One decoded acquisition step: the time advance since the previous
/// frame and the value shadow of every channel at that instant.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFrame {
    /// Time advance in trace clock ticks. Zero means no time advance.
    pub delta_ticks: u32,

    /// How the timestamp relates to the data packets that produced it.
    pub relation: TimestampDataRelation,

    /// Raw value of every channel as of this frame.
    pub values: [u32; CHANNELS],
}

/// Monotonic health counters maintained during decode. Shared between
/// the reader thread and the consumer; relaxed ordering is sufficient
/// since these are indicators only, and tearing between counters is
/// acceptable.
#[derive(Debug, Default)]
pub struct TraceCounters {
    pub error_frames: AtomicU32,
    pub delayed_timestamp1: AtomicU32,
    pub delayed_timestamp2: AtomicU32,
    pub delayed_timestamp3: AtomicU32,
    pub overflows: AtomicU32,
}

/// A snapshot of [`TraceCounters`] plus the in-viewport subsets
/// maintained by the trace data handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceIndicators {
    pub error_frames_total: u32,
    pub error_frames_in_view: u32,
    pub delayed_timestamp1: u32,
    pub delayed_timestamp2: u32,
    pub delayed_timestamp3: u32,
    pub delayed_timestamp3_in_view: u32,
    pub overflow_count: u32,
}

impl TraceCounters {
    pub fn reset(&self) {
        self.error_frames.store(0, Ordering::Relaxed);
        self.delayed_timestamp1.store(0, Ordering::Relaxed);
        self.delayed_timestamp2.store(0, Ordering::Relaxed);
        self.delayed_timestamp3.store(0, Ordering::Relaxed);
        self.overflows.store(0, Ordering::Relaxed);
    }

    /// Snapshots all counters. The in-view fields are left zeroed; the
    /// trace data handler fills them in from its pruned timestamp
    /// queues.
    pub fn snapshot(&self) -> TraceIndicators {
        TraceIndicators {
            error_frames_total: self.error_frames.load(Ordering::Relaxed),
            error_frames_in_view: 0,
            delayed_timestamp1: self.delayed_timestamp1.load(Ordering::Relaxed),
            delayed_timestamp2: self.delayed_timestamp2.load(Ordering::Relaxed),
            delayed_timestamp3: self.delayed_timestamp3.load(Ordering::Relaxed),
            delayed_timestamp3_in_view: 0,
            overflow_count: self.overflows.load(Ordering::Relaxed),
        }
    }

    pub fn note_error_frame(&self) {
        self.error_frames.fetch_add(1, Ordering::Relaxed);
    }
}

/// Reconstructs [`TraceFrame`]s from a packet stream.
pub struct FrameBuilder {
    values: [u32; CHANNELS],
    active: [bool; CHANNEL_MASK_WIDTH],
    counters: Arc<TraceCounters>,
}

impl FrameBuilder {
    pub fn new(active: [bool; CHANNEL_MASK_WIDTH], counters: Arc<TraceCounters>) -> Self {
        FrameBuilder {
            values: [0; CHANNELS],
            active,
            counters,
        }
    }

    /// Feeds one decoded packet; returns a frame on every timestamp
    /// event.
    pub fn feed(&mut self, packet: TracePacket) -> Option<TraceFrame> {
        match packet {
            TracePacket::Sync => None,

            TracePacket::Overflow => {
                self.counters.overflows.fetch_add(1, Ordering::Relaxed);
                None
            }

            TracePacket::Source { channel, payload } => {
                let channel = channel as usize;
                // A channel outside the active mask is discarded without
                // raising an error.
                if channel < CHANNELS && self.active[channel] {
                    let mut raw = [0u8; 4];
                    raw[..payload.len()].copy_from_slice(&payload);
                    self.values[channel] = u32::from_le_bytes(raw);
                }
                None
            }

            TracePacket::LocalTimestamp1 { ts, data_relation } => {
                match data_relation {
                    TimestampDataRelation::Sync => {}
                    TimestampDataRelation::UnknownDelay => {
                        self.counters
                            .delayed_timestamp1
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    TimestampDataRelation::AssocEventDelay => {
                        self.counters
                            .delayed_timestamp2
                            .fetch_add(1, Ordering::Relaxed);
                    }
                    TimestampDataRelation::UnknownAssocEventDelay => {
                        self.counters
                            .delayed_timestamp3
                            .fetch_add(1, Ordering::Relaxed);
                    }
                }

                Some(TraceFrame {
                    delta_ticks: ts,
                    relation: data_relation,
                    values: self.values,
                })
            }

            TracePacket::LocalTimestamp2 { ts } => Some(TraceFrame {
                delta_ticks: ts.into(),
                relation: TimestampDataRelation::Sync,
                values: self.values,
            }),
        }
    }
}
