use clap::Parser;
use ps2_core::bus::{Bus32 as _, Bus128 as _, LinearMemory};
use ps2_core::ee::{EeDmac, EePeers};
use ps2_core::fifo::{PeerFifo as _, Sif};
use ps2_core::iop::{IopDmac, Sio2Ports};
use std::time::Instant;
use tracing_subscriber::Layer as _;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const EE_GIF_BASE: u32 = 0x1000_A000;
const EE_SIF0_BASE: u32 = 0x1000_C000;
const EE_D_CTRL: u32 = 0x1000_E000;
const IOP_SIF0_BASE: u32 = 0x1F80_1520;
const IOP_DPCR2: u32 = 0x1F80_1570;

#[derive(Parser, Debug)]
#[command(name = "ps2-bench")]
#[command(about = "headless driver for the twin DMA engines", long_about = None)]
struct Args {
    /// Quadwords of GIF payload per chain segment.
    #[arg(short, long, default_value_t = 64)]
    quadwords: u32,

    /// Chain segments in the GIF program.
    #[arg(short, long, default_value_t = 256)]
    segments: u32,

    /// Enable per-unit trace output.
    #[arg(short, long)]
    verbose: bool,
}

/// Lay out a CNT-tag chain at `base`: each segment carries `qwc`
/// quadwords inline, the last segment is an END tag.
fn build_gif_chain(ram: &mut LinearMemory, base: u32, segments: u32, qwc: u32) {
    let mut cursor = base;
    for segment in 0..segments {
        let id: u64 = if segment == segments - 1 { 7 } else { 1 };
        ram.write_u128(cursor, (qwc as u64 | (id << 28)) as u128);
        for offset in 0..qwc {
            let payload = ((segment as u128) << 64) | offset as u128;
            ram.write_u128(cursor + 16 + offset * 16, payload);
        }
        cursor += 16 + qwc * 16;
    }
}

/// Lay out one IOP-side SIF0 chain tag whose payload is an EE-side
/// destination-chain tag followed by one quadword of data.
fn build_sif0_exchange(ram: &mut LinearMemory, tag_base: u32, payload_base: u32, ee_dest: u32) {
    ram.write_u32(tag_base, (1 << 30) | payload_base);
    ram.write_u32(tag_base + 4, 6);
    // EE destination-chain tag: END, one quadword to `ee_dest`.
    let ee_tag: u64 = 1 | (7 << 28) | ((ee_dest as u64) << 32);
    ram.write_u32(payload_base, ee_tag as u32);
    ram.write_u32(payload_base + 4, (ee_tag >> 32) as u32);
    for word in 0..4u32 {
        ram.write_u32(payload_base + 8 + word * 4, 0x5150_0000 | word);
    }
}

fn main() {
    let args = Args::parse();

    let level = if args.verbose { LevelFilter::TRACE } else { LevelFilter::INFO };
    let targets = tracing_subscriber::filter::Targets::new()
        .with_target("ps2_core::ee", level)
        .with_target("ps2_core::iop", level);
    let fmt_layer = tracing_subscriber::fmt::layer().without_time().with_filter(targets);
    tracing_subscriber::registry().with(fmt_layer).init();

    let mut ee = EeDmac::new();
    let mut iop = IopDmac::new();
    let mut ee_ram = LinearMemory::new(0x80_0000);
    let mut iop_ram = LinearMemory::new(0x20_0000);
    let mut peers = EePeers::new();
    let mut sif = Sif::new();
    let mut sio2 = Sio2Ports::new();

    // GIF program: a chain of CNT segments closed by an END tag.
    build_gif_chain(&mut ee_ram, 0x10_0000, args.segments, args.quadwords);
    // Bridge program: the IOP pushes an EE destination tag plus one
    // quadword through SIF0.
    build_sif0_exchange(&mut iop_ram, 0x4000, 0x5000, 0x20_0000);

    ee.write_u32(EE_D_CTRL, 1).unwrap();
    ee.write_u32(EE_GIF_BASE + 0x30, 0x10_0000).unwrap();
    ee.write_u32(EE_GIF_BASE, (1 << 8) | (1 << 2) | 1).unwrap();
    ee.write_u32(EE_SIF0_BASE, (1 << 8) | (1 << 2)).unwrap();

    iop.write_u32(IOP_DPCR2, 1 << 11).unwrap();
    iop.write_u32(IOP_SIF0_BASE + 0xC, 0x4000).unwrap();
    iop.write_u32(IOP_SIF0_BASE + 0x8, (1 << 24) | (2 << 9) | 1).unwrap();

    let mut ee_units = 0u64;
    let mut iop_units = 0u64;
    let mut gif_quadwords = 0u64;
    let start_time = Instant::now();

    loop {
        let ee_progress = ee.step(&mut ee_ram, &mut peers, &mut sif).unwrap_or_else(|error| {
            eprintln!("EE DMAC halted: {error}");
            std::process::exit(1);
        });
        let iop_progress = iop.step(&mut iop_ram, &mut sif, &mut sio2).unwrap_or_else(|error| {
            eprintln!("IOP DMAC halted: {error}");
            std::process::exit(1);
        });

        ee_units += ee_progress.is_some() as u64;
        iop_units += iop_progress.is_some() as u64;

        // Stand in for the GIF consuming its FIFO.
        while peers.gif.pop().is_some() {
            gif_quadwords += 1;
        }

        if ee_progress.is_none() && iop_progress.is_none() {
            break;
        }
    }

    let elapsed = start_time.elapsed();
    let units = ee_units + iop_units;
    println!(
        "EE units: {ee_units}, IOP units: {iop_units}, GIF quadwords: {gif_quadwords}"
    );
    println!(
        "EE irq: {}, IOP irq: {}, cpcond0: {}",
        ee.take_irq(),
        iop.take_irq(),
        ee.cpcond0()
    );
    println!(
        "{units} units in {:.2?} ({:.2} Munits/s)",
        elapsed,
        units as f64 / elapsed.as_secs_f64() / 1_000_000.0
    );

    let bridged = ee_ram.read_u128(0x20_0000);
    println!("bridged quadword: {bridged:032X}");
}
