//! # `mcuscope`
//!
//! A host-side acquisition engine for microcontroller observability.
//! Samples variables from a running embedded target through a debug
//! probe and ingests the live trace stream emitted by the target's
//! trace unit. Acquired values are time-stamped, fanned out to plot
//! buffers consumed by a GUI, and optionally mirrored to a CSV log.
//!
//! Two concurrent data handlers form the core:
//!
//! - [`ViewerDataHandler`](viewer::ViewerDataHandler) samples variables
//!   by address (or drains the probe's host-synchronous stream) at a
//!   configurable frequency;
//! - [`TraceDataHandler`](trace::TraceDataHandler) drives the
//!   [`TraceReader`](reader::TraceReader), which decodes the raw trace
//!   byte stream into per-channel frames.
//!
//! Supporting them: the packet [`Decoder`](decoder::Decoder), the
//! bounded blocking [`RingBuffer`](ring::RingBuffer), the
//! [`SymbolResolver`](symbols::SymbolResolver) that extracts variable
//! addresses and types from a compiled executable via GDB/MI, the
//! plot/series data model, and the CSV streamer.
//!
//! The GUI is an external collaborator: it renders from the
//! [`PlotHandler`](plot::PlotHandler)s under the shared plot mutex and
//! drives the handlers through their state and settings surfaces.
//! Concrete probe backends (ST-Link, J-Link) plug in through the traits
//! in [`probe`].

#[deny(rustdoc::broken_intra_doc_links)]
pub mod csv_streamer;
pub mod decoder;
pub mod frame;
pub mod groups;
pub mod handler;
pub mod plot;
pub mod probe;
pub mod reader;
pub mod ring;
pub mod symbols;
pub mod trace;
pub mod vars;
pub mod viewer;

pub use chrono;

pub use crate::decoder::{Decoder, MalformedPacket, TimestampDataRelation, TracePacket};
pub use crate::frame::{FrameBuilder, TraceCounters, TraceFrame, TraceIndicators, CHANNELS};
pub use crate::groups::{PlotGroup, PlotGroupHandler};
pub use crate::handler::AcquisitionState;
pub use crate::plot::{Domain, Plot, PlotHandler, Series};
pub use crate::probe::{
    DebugProbe, DebugProbeSettings, MemoryReader, Mode, ProbeDevice, SampleList, TraceProbe,
    TraceProbeSettings, WireInterface,
};
pub use crate::reader::TraceReader;
pub use crate::ring::RingBuffer;
pub use crate::symbols::{GdbMiProcess, MiSession, SymbolRecord, SymbolResolver};
pub use crate::trace::{TraceDataHandler, TraceSettings};
pub use crate::vars::{VarType, Variable, VariableHandler};
pub use crate::viewer::{ViewerDataHandler, ViewerSettings};
