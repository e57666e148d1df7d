use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Result};
use candle_core::Device;
use clap::{Parser, Subcommand};

use rewardtune_common::{
    load_prompts, prepare_prompts, DataConfig, ModelConfig, TextTokenizer, TrainingArguments,
};
use rewardtune_core::{
    HeuristicRewardModel, PolicyModel, PooledRewardModel, PreferenceChoiceRewardModel, RewardModel,
    TinyCausalLm,
};
use rewardtune_train::{
    BestOfNConfig, BestOfNTrainer, ConsoleReporter, DelayReporter, ExpertIterationTrainer,
    JsonlReporter, LocalHub, RewardScorer,
};

#[derive(Parser, Debug)]
#[command(name = "rewardtune", about = "Expert-iteration fine-tuning against a reward model")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Write the default training arguments to a JSON file.
    InitConfig(InitConfigArgs),
    /// Run the iterative generate → score → filter → fine-tune loop.
    Train(TrainArgs),
    /// One pass of best-of-n filtering, optionally followed by fine-tuning.
    BestOfN(BestOfNArgs),
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
}

/// Where the policy and reward models come from.
#[derive(Parser, Debug)]
struct ModelArgs {
    /// Use a freshly initialised tiny policy and the heuristic reward model.
    #[arg(long)]
    mock: bool,
    #[arg(long, required_unless_present = "mock")]
    policy_dir: Option<PathBuf>,
    #[arg(long, required_unless_present = "mock")]
    reward_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct PromptArgs {
    /// JSON array, JSONL (`prompt` or `text` field) or one prompt per line.
    #[arg(long)]
    prompts: PathBuf,
    /// Drop prompts of at least this many characters (0 = keep all).
    #[arg(long, default_value = "0")]
    max_prompt_chars: usize,
    /// Keep only the first N prompts after shuffling (0 = all).
    #[arg(long, default_value = "0")]
    num_prompts: usize,
    #[arg(long, default_value = "0")]
    shuffle_seed: u64,
}

#[derive(Parser, Debug)]
struct TrainArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[command(flatten)]
    prompts: PromptArgs,
    #[command(flatten)]
    models: ModelArgs,
    #[arg(long)]
    val_reward_dir: Option<PathBuf>,
    /// Append one JSON line of metrics per superbatch.
    #[arg(long)]
    metrics_jsonl: Option<PathBuf>,
    /// Root of a local model hub to publish to.
    #[arg(long)]
    hub_dir: Option<PathBuf>,
    #[arg(long, default_value = "local")]
    hub_user: String,
    /// Pause after every superbatch so a remote sink can flush.
    #[arg(long, default_value = "0")]
    delay_secs: u64,
    /// Save the fine-tuned policy and tokenizer here at the end.
    #[arg(long, default_value = "checkpoints/final")]
    output_dir: PathBuf,
}

#[derive(Parser, Debug)]
struct BestOfNArgs {
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    #[command(flatten)]
    prompts: PromptArgs,
    #[command(flatten)]
    models: ModelArgs,
    #[arg(long, default_value = "output")]
    output_dir: PathBuf,
    #[arg(long, default_value = "UNDEFINED")]
    run_name: String,
    #[arg(long, default_value = "4")]
    completions_per_prompt: usize,
    /// Fine-tune once on the filtered completions.
    #[arg(long)]
    finetune: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::InitConfig(args) => cmd_init_config(args),
        Command::Train(args) => cmd_train(args),
        Command::BestOfN(args) => cmd_best_of_n(args),
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────────

fn load_or_create_args(path: &Path) -> Result<TrainingArguments> {
    if path.exists() {
        return TrainingArguments::load(path);
    }
    let default = TrainingArguments::default();
    default.save(path)?;
    eprintln!("Created default config at {}", path.display());
    Ok(default)
}

fn load_prompt_pool(args: &PromptArgs) -> Result<Vec<String>> {
    let prompts = load_prompts(&args.prompts)?;
    let config = DataConfig {
        max_prompt_char_length: args.max_prompt_chars,
        num_prompts: args.num_prompts,
        shuffle_seed: args.shuffle_seed,
    };
    let prompts = prepare_prompts(prompts, &config);
    if prompts.is_empty() {
        bail!("no prompts left in {}", args.prompts.display());
    }
    tracing::info!(prompts = prompts.len(), "Loaded prompt pool");
    Ok(prompts)
}

/// Tokenizer saved next to a model, falling back to byte level.
fn load_tokenizer(dir: &Path) -> Result<TextTokenizer> {
    if dir.join("tokenizer_meta.json").exists() || dir.join("tokenizer.json").exists() {
        TextTokenizer::load(dir)
    } else {
        Ok(TextTokenizer::byte_level())
    }
}

fn load_reward(dir: &Path, preference_choice: bool, device: &Device) -> Result<RewardScorer> {
    let model: Box<dyn RewardModel> = if preference_choice {
        Box::new(PreferenceChoiceRewardModel::new(TinyCausalLm::load(dir, device)?))
    } else {
        Box::new(PooledRewardModel::load(dir, device)?)
    };
    Ok(RewardScorer::new(model, load_tokenizer(dir)?))
}

fn load_models(
    models: &ModelArgs,
    args: &TrainingArguments,
    device: &Device,
) -> Result<(Box<dyn PolicyModel>, TextTokenizer, RewardScorer)> {
    if models.mock {
        let policy = TinyCausalLm::new(&ModelConfig::default(), device)?;
        let reward = RewardScorer::new(Box::new(HeuristicRewardModel), TextTokenizer::byte_level());
        return Ok((Box::new(policy), TextTokenizer::byte_level(), reward));
    }
    let (Some(policy_dir), Some(reward_dir)) = (&models.policy_dir, &models.reward_dir) else {
        bail!("--policy-dir and --reward-dir are required without --mock");
    };
    let policy = TinyCausalLm::load(policy_dir, device)?;
    let tokenizer = load_tokenizer(policy_dir)?;
    let reward = load_reward(reward_dir, args.reward_model_is_steamshp, device)?;
    Ok((Box::new(policy), tokenizer, reward))
}

// ── Command implementations ────────────────────────────────────────────────────

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    TrainingArguments::default().save(&args.output)?;
    eprintln!("Wrote default training arguments to {}", args.output.display());
    Ok(())
}

fn cmd_train(args: TrainArgs) -> Result<()> {
    let training_args = load_or_create_args(&args.config)?;
    let prompts = load_prompt_pool(&args.prompts)?;
    let device = Device::cuda_if_available(0)?;
    let (policy, tokenizer, reward) = load_models(&args.models, &training_args, &device)?;

    let mut trainer = ExpertIterationTrainer::new(policy, tokenizer, reward, training_args)
        .with_reporter(Box::new(ConsoleReporter::stdout()));
    if let Some(dir) = &args.val_reward_dir {
        // The validation model always gives a direct score.
        trainer = trainer.with_validation(load_reward(dir, false, &device)?);
    }
    if let Some(path) = &args.metrics_jsonl {
        trainer = trainer.with_reporter(Box::new(JsonlReporter::create(path)?));
    }
    if args.delay_secs > 0 {
        trainer = trainer.with_reporter(Box::new(DelayReporter {
            delay: Duration::from_secs(args.delay_secs),
        }));
    }
    if let Some(dir) = &args.hub_dir {
        trainer = trainer.with_hub(Box::new(LocalHub::new(dir, args.hub_user.clone())));
    }

    let summary = trainer.train(&prompts)?;
    eprintln!(
        "Training done: {}/{} superbatches completed, {} skipped, {} abandoned, {} optimizer steps",
        summary.completed,
        summary.superbatch_count,
        summary.skipped_malformed,
        summary.abandoned,
        summary.optimizer_steps
    );

    trainer.policy().save_weights(&args.output_dir)?;
    trainer.tokenizer().save(&args.output_dir)?;
    eprintln!("Saved to {}", args.output_dir.display());
    Ok(())
}

fn cmd_best_of_n(args: BestOfNArgs) -> Result<()> {
    let training_args = load_or_create_args(&args.config)?;
    let prompts = load_prompt_pool(&args.prompts)?;
    let device = Device::cuda_if_available(0)?;
    let (policy, tokenizer, reward) = load_models(&args.models, &training_args, &device)?;

    let config = BestOfNConfig {
        completions_per_prompt: args.completions_per_prompt,
        output_dir: args.output_dir,
        run_name: args.run_name,
        ..Default::default()
    };
    let mut trainer = BestOfNTrainer::new(policy, tokenizer, reward, training_args, config)?;
    let summary = trainer.run(&prompts, args.finetune)?;
    eprintln!(
        "Best-of-{}: {} completions, {} prompts dropped, {} kept. Outputs in {}",
        args.completions_per_prompt,
        summary.completions,
        summary.dropped_prompts,
        summary.filtered.len(),
        trainer.output_folder().display()
    );
    if let Some(outcome) = summary.finetune {
        eprintln!(
            "Fine-tuned: loss {:.4}, KL {:.4} over {} minibatches",
            outcome.average_loss, outcome.average_kl, outcome.valid_minibatches
        );
    }
    Ok(())
}
