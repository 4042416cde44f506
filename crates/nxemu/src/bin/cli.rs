use clap::Parser;
use nxemu::trace;
use nxemu::{
    Args, DeviceMemory, Gpu, GpuMemoryConfig, Memory, SoftwareBackend, TraceError, TraceRunner,
};
use std::sync::Arc;
use tracing::info;

/// Guest CPU address space of the headless harness
const CPU_ADDRESS_SPACE_BITS: u32 = 32;

fn main() {
    // Parse command-line arguments
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(2);
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load the trace
    let directives = match std::fs::read_to_string(&args.trace)
        .map_err(TraceError::from)
        .and_then(|text| trace::parse(&text))
    {
        Ok(directives) => directives,
        Err(e) => {
            eprintln!("Failed to load trace {}: {}", args.trace.display(), e);
            std::process::exit(2);
        }
    };

    let config = args.to_emulation_config();

    info!("=== Creating GPU ===");
    info!("DRAM: {:#x} bytes", args.dram_size);
    let device = Arc::new(DeviceMemory::new(args.dram_size));
    let memory = Arc::new(Memory::new(device, CPU_ADDRESS_SPACE_BITS));
    let backend = Arc::new(SoftwareBackend::new());
    let gpu = Gpu::new(config, backend.clone(), memory, GpuMemoryConfig::default());

    info!("=== Replaying {} directives ===", directives.len());
    let mut runner = TraceRunner::new(gpu);
    let result = runner.run(&directives);

    info!("=== Replay Complete ===");
    let stats = runner.stats();
    info!(
        "Directives: {} (expectations {}, reads {}, methods {}, draws {}, flips {})",
        stats.directives, stats.expectations, stats.reads, stats.methods, stats.draws, stats.flips
    );
    let backend_stats = backend.stats();
    info!(
        "Backend: {} submissions, {} render passes, {} blits, {} copies, {} presents",
        backend_stats.submissions,
        backend_stats.render_passes,
        backend_stats.blits,
        backend_stats.copies,
        backend_stats.presents
    );
    info!("Tick: {}", runner.gpu().scheduler().current_tick());

    let exit_code = match result {
        Ok(()) => {
            info!("PASS: trace replayed");
            0
        }
        Err(e) => {
            eprintln!("Trace failed: {}", e);
            1
        }
    };

    std::process::exit(exit_code);
}
