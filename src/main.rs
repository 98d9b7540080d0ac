//! xdna-ctrl: drive compiled AI Engine programs on an emulated array

use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};

use xdna_ctrl::device::{TileArray, TileKind};
use xdna_ctrl::{AccessMode, ArrayManager, Metadata, RuntimeConfig};

struct Args {
    metadata: String,
    run: Option<String>,
    iterations: u32,
}

fn usage() -> ! {
    eprintln!("Usage: xdna-ctrl <metadata.toml> [--run GRAPH] [--iterations N]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --run GRAPH       Run GRAPH on the emulated array, wait for it and end it");
    eprintln!("  --iterations N    Iterations per core for --run (default 1, 0 = unbounded)");
    eprintln!("  --sample-config   Print a sample runtime configuration file");
    std::process::exit(2);
}

fn parse_args() -> anyhow::Result<Args> {
    let mut metadata = None;
    let mut run = None;
    let mut iterations = 1;

    let mut args = env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--run" => run = Some(args.next().context("--run needs a graph name")?),
            "--iterations" => {
                let n = args.next().context("--iterations needs a count")?;
                iterations = n.parse().with_context(|| format!("Invalid iteration count '{}'", n))?;
            }
            "--sample-config" => {
                print!("{}", RuntimeConfig::sample_config());
                std::process::exit(0);
            }
            "-h" | "--help" => usage(),
            a if a.starts_with('-') => bail!("Unknown option '{}'", a),
            _ if metadata.is_none() => metadata = Some(arg),
            _ => bail!("Unexpected argument '{}'", arg),
        }
    }

    match metadata {
        Some(metadata) => Ok(Args { metadata, run, iterations }),
        None => usage(),
    }
}

fn print_summary(manager: &ArrayManager) {
    let md = manager.metadata();
    let device = manager.device();

    println!(
        "Device: {} {}x{} ({} reserved rows)",
        device.generation, device.num_cols, device.num_rows, device.reserved_rows
    );
    println!();

    println!("Graphs ({}):", md.graphs.len());
    for g in &md.graphs {
        println!("  [{}] {} - {} cores", g.id, g.name, g.cores.len());
        for c in &g.cores {
            match device.locate(TileKind::Compute, c.col, c.row) {
                Ok(tile) => println!(
                    "      core ({},{}) -> {}{}",
                    c.col,
                    c.row,
                    tile,
                    if c.triggered { " triggered" } else { "" }
                ),
                Err(e) => println!("      core ({},{}) -> {}", c.col, c.row, e),
            }
        }
        for r in md.rtps_for_graph(g.id) {
            println!(
                "      rtp {} ({} bytes, {}{})",
                r.name,
                r.num_bytes,
                if r.is_input { "in" } else { "out" },
                if r.is_async { ", async" } else { "" }
            );
        }
    }

    if !md.gmios.is_empty() {
        println!();
        println!("GMIO ports ({}):", md.gmios.len());
        for g in &md.gmios {
            println!("  {} {:?} shim {} channel {}", g.name, g.direction, g.shim_col, g.channel);
        }
    }
    if !md.plios.is_empty() {
        println!();
        println!("PLIO ports ({}):", md.plios.len());
        for p in &md.plios {
            println!("  {} {:?} shim {} stream {}", p.name, p.direction, p.shim_col, p.stream_id);
        }
    }
    if !md.external_buffers.is_empty() {
        println!();
        println!("External buffers ({}):", md.external_buffers.len());
        for e in &md.external_buffers {
            println!("  {} - {} buffers, {} descriptors", e.name, e.num_bufs, e.shim_ports.len());
        }
    }
}

fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let args = parse_args()?;
    let metadata = Metadata::from_file(&args.metadata)?;
    let array = Arc::new(TileArray::new(Arc::new(metadata.device.clone())));
    let runtime = Arc::new(RuntimeConfig::load());
    let manager = Arc::new(
        ArrayManager::new(metadata, runtime, array.clone()).context("Failed to build control plane")?,
    );

    println!("Loaded: {}", args.metadata);
    println!();
    print_summary(&manager);

    let Some(name) = args.run else {
        return Ok(());
    };

    // Nothing executes on the emulated cores; let them finish on their own
    array.set_core_autocomplete(Some(args.iterations.max(1)));

    let mut graph = manager.open_graph(&name, AccessMode::Exclusive)?;
    println!();
    println!("Running '{}' for {} iterations", name, args.iterations);
    graph.run_iterations(args.iterations)?;
    graph.wait()?;
    let ts = graph.timestamp()?;
    graph.end()?;
    println!("Graph '{}' {} at cycle {}", name, graph.status(), ts);
    graph.close()?;

    let stats = array.stats();
    println!();
    println!("Core enables:   {}", stats.core_enables);
    println!("Done polls:     {}", stats.done_polls);
    println!("Words written:  {}", stats.word_writes);
    Ok(())
}
