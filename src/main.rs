use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::info;

use nano_genai::{
    ConfigOverrides, GenerationConfig, LlmPipeline, Result, ScriptedModel, StreamingStatus,
};

#[derive(Parser, Debug)]
#[command(name = "nano-genai")]
#[command(about = "A minimalistic text-generation decoding engine")]
struct Args {
    /// Generation config JSON file (greedy preset when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Prompt length used to resolve the token budget
    #[arg(long, default_value = "8")]
    prompt_len: usize,

    /// Override max_new_tokens
    #[arg(long)]
    max_new_tokens: Option<usize>,

    /// Run the pipeline over a scripted model
    #[arg(long)]
    demo: bool,

    /// Vocabulary size of the scripted model
    #[arg(long, default_value = "64")]
    vocab_size: usize,
}

fn main() -> ExitCode {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &Args) -> Result<()> {
    println!("nano-genai v{}", env!("CARGO_PKG_VERSION"));

    let base = match &args.config {
        Some(path) => {
            info!(path = %path.display(), "loading generation config");
            GenerationConfig::from_file(path)?
        }
        None => GenerationConfig::greedy(),
    };
    let mut overrides = ConfigOverrides::new();
    if let Some(max_new_tokens) = args.max_new_tokens {
        overrides = overrides.max_new_tokens(max_new_tokens);
    }
    let config = base.with_overrides(&overrides)?;

    let budget = config.get_max_new_tokens(args.prompt_len)?;
    println!("Mode: {}", config.resolve_mode().as_str());
    println!("Prompt length: {}", args.prompt_len);
    println!("Max new tokens: {budget}");
    println!("Return sequences: {}", config.num_return_sequences);

    if !args.demo {
        return Ok(());
    }

    let prompt: Vec<u32> = (1..=args.prompt_len as u32).collect();
    let model = ScriptedModel::hashed(args.vocab_size, config.rng_seed.unwrap_or(0));
    let mut pipeline = LlmPipeline::new(model);

    let output = if !config.is_beam_search() && config.num_return_sequences == 1 {
        let mut print_token = |token: u32| {
            print!("{token} ");
            StreamingStatus::Running
        };
        print!("Stream: ");
        let output = pipeline.generate(&prompt, &config, Some(&mut print_token))?;
        println!();
        output
    } else {
        pipeline.generate(&prompt, &config, None)?
    };

    for (i, seq) in output.sequences.iter().enumerate() {
        println!(
            "[{i}] score={:.4} finish={:?} tokens={:?}",
            seq.score, seq.finish_reason, seq.token_ids
        );
    }
    println!(
        "Steps: {}, infer calls: {}",
        output.stats.steps, output.stats.infer_calls
    );
    Ok(())
}
