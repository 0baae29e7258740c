use anyhow::{Context, Result};
use mcuscope::chrono::{DateTime, Duration, Local};
use mcuscope::frame::{FrameBuilder, TraceCounters, CHANNEL_MASK_WIDTH};
use mcuscope::Decoder;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(
    about = "Decodes a raw variable-trace byte stream captured from a target's trace unit into per-channel frames. Part of mcuscope; report bugs and request features at <https://github.com/mcuscope/mcuscope>."
)]
struct Opt {
    #[structopt(
        long = "--core-freq",
        name = "core-freq",
        help = "Core clock of the traced target, in Hz."
    )]
    core_frequency: u32,

    #[structopt(long = "--prescaler", help = "Trace timestamp prescaler.")]
    prescaler: Option<u32>,

    #[structopt(
        long = "--channels",
        help = "Comma-separated active channel indices.",
        use_delimiter = true,
        default_value = "0,1,2,3,4,5,6,7,8,9"
    )]
    channels: Vec<usize>,

    #[structopt(
        long = "--wall-clock",
        help = "Print wall-clock timestamps anchored at decode start."
    )]
    wall_clock: bool,

    #[structopt(name = "FILE", parse(from_os_str), help = "Raw trace input file.")]
    file: PathBuf,
}

fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    let data = fs::read(&opt.file).context("failed to open file")?;

    let mut active = [false; CHANNEL_MASK_WIDTH];
    for &channel in &opt.channels {
        if channel < CHANNEL_MASK_WIDTH {
            active[channel] = true;
        }
    }

    let counters = Arc::new(TraceCounters::default());
    let mut decoder = Decoder::new();
    let mut builder = FrameBuilder::new(active, Arc::clone(&counters));
    decoder.push(&data);

    let tick_seconds =
        opt.prescaler.unwrap_or(1).max(1) as f64 / opt.core_frequency.max(1) as f64;
    let baseline: DateTime<Local> = Local::now();
    let mut time = 0.0f64;

    loop {
        match decoder.pull() {
            Ok(Some(packet)) => {
                if let Some(frame) = builder.feed(packet) {
                    time += frame.delta_ticks as f64 * tick_seconds;
                    if opt.wall_clock {
                        let stamp = baseline
                            + Duration::nanoseconds((time * 1e9) as i64);
                        println!("{} {:?}", stamp.format("%H:%M:%S%.6f"), frame.values);
                    } else {
                        println!("{:.9} {:?}", time, frame.values);
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                counters.note_error_frame();
                eprintln!("malformed: {}", e);
            }
        }
    }

    let indicators = counters.snapshot();
    eprintln!(
        "error frames: {}, delayed3: {}, overflows: {}",
        indicators.error_frames_total, indicators.delayed_timestamp3, indicators.overflow_count
    );

    Ok(())
}
