use std::fs::read_to_string;
use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use log::info;

use tokcodec::regex::{GPT2_SPLIT_PATTERN, GPT4_SPLIT_PATTERN};
use tokcodec::{CodecConfig, DirectoryRegistry, RegexTokenizer, Token, TokenCodec};

#[derive(Parser)]
#[command(name = "tokcodec")]
#[command(about = "Convert text to token ids and back", long_about = None)]
#[command(version)]
struct Cli {
    #[command(flatten)]
    source: Source,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Source {
    /// JSON file naming the registry and vocabulary
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry directory (overrides the config file)
    #[arg(long, global = true)]
    registry: Option<PathBuf>,

    /// Vocabulary name (overrides the config file)
    #[arg(long, global = true)]
    vocab: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode text to token ids
    Encode {
        text: String,
        /// Turn special-token literals into their ids
        #[arg(long)]
        special: bool,
    },
    /// Decode token ids back to text
    Decode {
        #[arg(required = true)]
        ids: Vec<Token>,
        /// Render special tokens instead of dropping them
        #[arg(long)]
        keep_special: bool,
    },
    /// Show vocabulary details
    Info,
    /// Train a byte-level BPE vocabulary and install it in the registry
    Train {
        #[arg(long)]
        input: PathBuf,
        #[arg(long, default_value_t = 512)]
        vocab_size: usize,
        #[arg(long, value_enum, default_value_t = SplitPattern::Gpt4)]
        pattern: SplitPattern,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum SplitPattern {
    Gpt2,
    Gpt4,
}

impl Source {
    fn resolve(&self) -> anyhow::Result<CodecConfig> {
        let from_file = match &self.config {
            Some(path) => Some(
                CodecConfig::load(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?,
            ),
            None => None,
        };
        let registry = self
            .registry
            .clone()
            .or_else(|| from_file.as_ref().map(|c| c.registry.clone()));
        let vocabulary = self
            .vocab
            .clone()
            .or_else(|| from_file.as_ref().map(|c| c.vocabulary.clone()));
        match (registry, vocabulary) {
            (Some(registry), Some(vocabulary)) => Ok(CodecConfig {
                registry,
                vocabulary,
            }),
            _ => bail!(
                "a registry and vocabulary are required (--config, or --registry and --vocab)"
            ),
        }
    }

    fn open(&self) -> anyhow::Result<TokenCodec> {
        let config = self.resolve()?;
        config
            .open()
            .with_context(|| format!("failed to open vocabulary {}", config.vocabulary))
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Encode { text, special } => {
            let codec = cli.source.open()?;
            let ids = if special {
                codec.encode_with_special(&text)?
            } else {
                codec.encode(&text)?
            };
            println!("{ids:?}");
        }
        Commands::Decode { ids, keep_special } => {
            let codec = cli.source.open()?;
            let text = if keep_special {
                codec.decode_with_special(&ids)?
            } else {
                codec.decode(&ids)?
            };
            println!("{text}");
        }
        Commands::Info => {
            let codec = cli.source.open()?;
            println!("name: {}", codec.name());
            println!("vocab size: {}", codec.vocab_size());
        }
        Commands::Train {
            input,
            vocab_size,
            pattern,
        } => {
            let config = cli.source.resolve()?;
            let text = read_to_string(&input)
                .with_context(|| format!("failed to read {}", input.display()))?;
            let pattern = match pattern {
                SplitPattern::Gpt2 => GPT2_SPLIT_PATTERN,
                SplitPattern::Gpt4 => GPT4_SPLIT_PATTERN,
            };
            let mut tokenizer = RegexTokenizer::with_pattern(pattern)?;
            tokenizer.train(&text, vocab_size)?;
            let path = DirectoryRegistry::new(&config.registry)
                .install(&config.vocabulary, &tokenizer)?;
            info!("wrote {}", path.display());
            println!(
                "trained {} merges into {}",
                tokenizer.num_merges(),
                path.display()
            );
        }
    }

    Ok(())
}
