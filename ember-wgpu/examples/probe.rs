//! Probe the local GPU and print what ember negotiated.
//!
//! # Usage
//!
//! ```text
//! RUST_LOG=ember=debug cargo run -p ember-wgpu --example probe -- --power low_power
//!
//! # Also time the tunable kernels and print the winners
//! cargo run -p ember-wgpu --example probe -- --autotune
//! ```

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ember::{GpuContext, PowerPreference, Result, RuntimeConfig, TuneTarget};
use ember_wgpu::WgpuBackend;

/// Print the negotiated capabilities of the preferred adapter
#[derive(Parser)]
#[command(name = "probe")]
struct Cli {
    /// Adapter preference to try first
    #[arg(long, default_value = "high_performance",
          value_parser = ["high_performance", "low_power", "default"])]
    power: String,

    /// Offer half-precision shaders if the adapter has them
    #[arg(long)]
    f16: bool,

    /// Run the workgroup auto-tuner over a few representative sizes
    #[arg(long)]
    autotune: bool,

    /// Runtime config JSON file; flags override its fields
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    pollster::block_on(run(cli))
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    let first: PowerPreference = serde_json::from_value(serde_json::Value::String(cli.power))?;
    config.power_preferences.retain(|p| *p != first);
    config.power_preferences.insert(0, first);
    config.autotune.enabled |= cli.autotune;

    let backend = WgpuBackend::new().with_shader_f16(cli.f16);
    let ctx = GpuContext::create(backend, config).await?;
    let caps = ctx.capabilities()?;
    println!("{}", serde_json::to_string_pretty(&*caps)?);

    if cli.autotune {
        let targets = [
            TuneTarget::Matmul { m: 256, n: 256, k: 256 },
            TuneTarget::RmsNorm { batch: 64, hidden: 4096 },
            TuneTarget::Softmax { batch: 64, size: 4096 },
            TuneTarget::Silu { size: 1 << 20 },
            TuneTarget::ResidualAdd { size: 1 << 20 },
        ];
        for result in ctx.autotune_kernels(&targets).await? {
            println!(
                "{:<28} size class {:>2}  workgroup {:?}  {:.1} us",
                result.kernel,
                result.size_class,
                result.workgroup,
                result.elapsed.as_secs_f64() * 1e6,
            );
        }
    }
    Ok(())
}
