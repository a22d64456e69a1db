use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hetarray::device::shaders::{SCALE_F32, SCALE_F32_ENTRY};
use hetarray::device::{DeviceApi, Faults, HostDevice, HostInvocation, HostKernels};
use hetarray::deopt::Strategy;
use hetarray::exec::ReduceThreads;
use hetarray::kernel::{GeneratedKernel, SourceTable};
use hetarray::{ArrayFunction, Captures, MapAccelerator, MapThreads, Pipeline, RuntimeContext, RuntimeOptions, TypedArray};

#[derive(Parser)]
#[command(
    name = "hetarray",
    version,
    about = "Typed array maps over heterogeneous devices"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct CommonArgs {
    /// Number of host reference devices
    #[arg(long, global = true, default_value_t = 2)]
    devices: usize,
    /// Elements in the input array
    #[arg(long, global = true, default_value_t = 1 << 16)]
    size: usize,
    /// Make every device launch fail so functions fall back to host threads
    #[arg(long, global = true)]
    force_deopt: bool,
    /// Print a profile summary after the run
    #[arg(long, global = true)]
    profile: bool,
    /// Options file (JSON or key = value)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// a * x + y over (f32, f32) tuples
    Saxpy {
        #[arg(long, default_value_t = 2.5)]
        a: f32,
    },
    /// Weighted sum over (i32, f64, bool) tuples with a captured weight table
    Tuple,
    /// Threaded sum over an index sequence
    Reduce {
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
    /// Device map feeding a threaded map, chunk by chunk
    Pipeline {
        #[arg(long)]
        chunk: Option<usize>,
    },
    /// Scale an f32 array with the bundled WGSL kernel on the first GPU
    Gpu {
        #[arg(long, default_value_t = 3.0)]
        a: f32,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hetarray=info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let options = load_options(&cli.common);
    let ctx = match cli.command {
        Command::Saxpy { a } => cmd_saxpy(&cli.common, options, a),
        Command::Tuple => cmd_tuple(&cli.common, options),
        Command::Reduce { threads } => cmd_reduce(&cli.common, threads),
        Command::Pipeline { chunk } => cmd_pipeline(&cli.common, options, chunk),
        Command::Gpu { a } => cmd_gpu(&cli.common, options, a),
    };
    if let Some(ctx) = ctx {
        if ctx.options().profile {
            print_profile(&ctx);
        }
    }
}

fn load_options(common: &CommonArgs) -> RuntimeOptions {
    let loaded = match &common.config {
        Some(path) => RuntimeOptions::load(path),
        None => RuntimeOptions::from_env(),
    };
    let mut options = loaded.unwrap_or_else(|e| {
        eprintln!("error: {e}");
        process::exit(1);
    });
    options.profile |= common.profile;
    options
}

fn fail(e: hetarray::Error) -> ! {
    eprintln!("error: {e}");
    process::exit(1);
}

/// Host devices sharing `kernels`, all failing launches when asked to.
fn host_context(common: &CommonArgs, kernels: HostKernels, options: RuntimeOptions) -> Arc<RuntimeContext> {
    let devices: Vec<Arc<dyn DeviceApi>> = (0..common.devices.max(1))
        .map(|i| {
            let device = HostDevice::new(format!("host:{i}"), kernels.clone());
            if common.force_deopt {
                device.set_faults(Faults {
                    fail_launch: true,
                    ..Faults::default()
                });
            }
            Arc::new(device) as Arc<dyn DeviceApi>
        })
        .collect();
    Arc::new(RuntimeContext::new(devices, Arc::new(kernels), options))
}

fn report_strategy(name: &str, strategy: Strategy) {
    match strategy {
        Strategy::Device => eprintln!("{name}: ran on devices"),
        Strategy::Host => eprintln!("{name}: deoptimized to host threads"),
    }
}

// ─── Workloads ─────────────────────────────────────────────────────

fn cmd_saxpy(common: &CommonArgs, options: RuntimeOptions, a: f32) -> Option<Arc<RuntimeContext>> {
    let kernels = HostKernels::new();
    kernels.register("saxpy", |inv: &mut HostInvocation<'_>| {
        let x: Vec<f32> = inv.read(0)?;
        let y: Vec<f32> = inv.read(1)?;
        let n: i32 = inv.scalar(2)?;
        let a: f32 = inv.scalar(3)?;
        for i in 0..n as usize {
            inv.store(4, i, a * x[i] + y[i])?;
        }
        Ok(())
    });
    let ctx = host_context(common, kernels, options);

    let input = TypedArray::from_fn(common.size, |i| (i as f32, 1.0f32));
    let mut saxpy = MapAccelerator::new(Arc::clone(&ctx), "saxpy", Captures::new().scalar(0, a), move |(x, y): (f32, f32)| {
        a * x + y
    });
    let out = saxpy.apply(&input).unwrap_or_else(|e| fail(e));
    report_strategy("saxpy", saxpy.strategy());
    if let Some(last) = out.len().checked_sub(1) {
        println!("y[{last}] = {}", out.get(last));
    }
    Some(ctx)
}

fn cmd_tuple(common: &CommonArgs, options: RuntimeOptions) -> Option<Arc<RuntimeContext>> {
    const WEIGHTS: [f64; 4] = [0.5, 1.0, 1.5, 2.0];

    let kernels = HostKernels::new();
    kernels.register("weigh", |inv: &mut HostInvocation<'_>| {
        let ids: Vec<i32> = inv.read(0)?;
        let values: Vec<f64> = inv.read(1)?;
        let flags: Vec<bool> = inv.read(2)?;
        let n: i32 = inv.scalar(3)?;
        let weights: Vec<f64> = inv.read(4)?;
        for i in 0..n as usize {
            let w = weights[ids[i] as usize % weights.len()];
            let v = if flags[i] { values[i] * w } else { 0.0 };
            inv.store(6, i, v)?;
        }
        Ok(())
    });
    let ctx = host_context(common, kernels, options);

    let input = TypedArray::from_fn(common.size, |i| (i as i32, i as f64 * 0.25, i % 3 != 0));
    let mut weigh = MapAccelerator::new(
        Arc::clone(&ctx),
        "weigh",
        Captures::new().array(0, &WEIGHTS),
        |(id, value, flag): (i32, f64, bool)| {
            if flag {
                value * WEIGHTS[id as usize % WEIGHTS.len()]
            } else {
                0.0
            }
        },
    );
    let out = weigh.apply(&input).unwrap_or_else(|e| fail(e));
    report_strategy("weigh", weigh.strategy());
    let total: f64 = out.iter().sum();
    println!("sum = {total}");
    Some(ctx)
}

fn cmd_reduce(common: &CommonArgs, threads: usize) -> Option<Arc<RuntimeContext>> {
    let seq = TypedArray::sequence(1, 1, common.size);
    let sum = ReduceThreads::new(0i64, |a, b| a + b, threads);
    let widened = MapThreads::new(|x: i32| i64::from(x), threads)
        .apply(&seq)
        .unwrap_or_else(|e| fail(e));
    let total = sum.fold(&widened).unwrap_or_else(|e| fail(e));
    println!("sum(1..={}) = {total}", common.size);
    None
}

fn cmd_pipeline(common: &CommonArgs, options: RuntimeOptions, chunk: Option<usize>) -> Option<Arc<RuntimeContext>> {
    let kernels = HostKernels::new();
    kernels.register("square", |inv: &mut HostInvocation<'_>| {
        let x: Vec<i32> = inv.read(0)?;
        let n: i32 = inv.scalar(1)?;
        for i in 0..n as usize {
            inv.store(2, i, i64::from(x[i]) * i64::from(x[i]))?;
        }
        Ok(())
    });
    let chunk = chunk.unwrap_or(options.pipeline_chunk);
    let ctx = host_context(common, kernels, options);

    let input = TypedArray::from_fn(common.size, |i| i as i32);
    let square = MapAccelerator::new(Arc::clone(&ctx), "square", Captures::new(), |x: i32| i64::from(x) * i64::from(x));
    let mut pipeline = Pipeline::new(square)
        .then(MapThreads::new(|x: i64| (x as f64).sqrt(), 2))
        .with_chunk_size(chunk)
        .with_profiler(ctx.sink());
    let out = pipeline.apply(&input).unwrap_or_else(|e| fail(e));
    if let Some(last) = out.len().checked_sub(1) {
        println!("sqrt(x[{last}]^2) = {}", out.get(last));
    }
    Some(ctx)
}

fn cmd_gpu(common: &CommonArgs, mut options: RuntimeOptions, a: f32) -> Option<Arc<RuntimeContext>> {
    let table = Arc::new(SourceTable::new());
    table.insert(
        "scale",
        GeneratedKernel {
            source: SCALE_F32.to_string(),
            entry_point: SCALE_F32_ENTRY.to_string(),
            argument_count_hint: 4,
        },
    );
    options.multi_device = false;
    let Some(ctx) = RuntimeContext::gpu(table, options) else {
        eprintln!("no GPU adapter available");
        process::exit(1);
    };
    let ctx = Arc::new(ctx);

    let input = TypedArray::from_fn(common.size, |i| i as f32);
    let mut scale = MapAccelerator::new(Arc::clone(&ctx), "scale", Captures::new().scalar(0, a), move |x: f32| a * x);
    let out = scale.apply(&input).unwrap_or_else(|e| fail(e));
    report_strategy("scale", scale.strategy());
    if let Some(last) = out.len().checked_sub(1) {
        println!("y[{last}] = {}", out.get(last));
    }
    Some(ctx)
}

fn print_profile(ctx: &RuntimeContext) {
    println!("{:<22} {:>8} {:>14}", "phase", "count", "total");
    for (kind, (count, total)) in ctx.profiler().summary() {
        println!("{:<22} {:>8} {:>14?}", format!("{kind:?}"), count, total);
    }
}
