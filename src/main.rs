use clap::Parser;
use diffusion_lm::{Config, GatedFeedForward, Tensor};
use log::info;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::PathBuf;

/// Resolve a model config and optionally run its feed-forward block.
#[derive(Parser, Debug)]
#[command(name = "diffusion-lm")]
struct Args {
    /// JSON config file
    config: PathBuf,

    /// Build the feed-forward block and run one forward pass
    #[arg(long)]
    ffn: bool,

    /// Batch size of the random input
    #[arg(long, default_value_t = 1)]
    batch: usize,

    /// Sequence length of the random input
    #[arg(long, default_value_t = 8)]
    seq: usize,

    /// Random seed for parameters and input
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Load block parameters from this file instead of random init
    #[arg(long)]
    params: Option<PathBuf>,

    /// Write the block parameters to this file
    #[arg(long)]
    save_params: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    info!("Loading config from: {}", args.config.display());
    let config = Config::from_json_file(&args.config)?;
    info!(
        "Config {}: n_embed={}, n_head={}, n_query_groups={}, padded_vocab={}, intermediate={}",
        config.name(),
        config.n_embed(),
        config.n_head(),
        config.n_query_groups(),
        config.padded_vocab_size(),
        config.intermediate_size()
    );

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{}", config.to_json_string()?)?;

    if !args.ffn {
        return Ok(());
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let ffn = match &args.params {
        Some(path) => {
            info!("Loading feed-forward parameters from: {}", path.display());
            let mut reader = BufReader::new(File::open(path)?);
            GatedFeedForward::load(&mut reader, config.n_embed(), config.intermediate_size())?
        }
        None => GatedFeedForward::from_config(&config, &mut rng)?,
    };
    info!("Feed-forward block: {} parameters", ffn.num_parameters());

    if let Some(path) = &args.save_params {
        let mut writer = BufWriter::new(File::create(path)?);
        ffn.write_to(&mut writer)?;
        writer.flush()?;
        info!("Saved feed-forward parameters to: {}", path.display());
    }

    let x = Tensor::random(&[args.batch, args.seq, config.n_embed()], &mut rng)?;
    let y = ffn.forward(&x)?;
    info!("Forward pass: {:?} -> {:?}", x.shape(), y.shape());
    writeln!(out, "output shape: {:?}", y.shape())?;

    Ok(())
}
