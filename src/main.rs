//! tekmerion CLI - Evidence-grounded reading-comprehension item generation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tekmerion::capability::{
    Embedder, LlmEmbedder, LlmGenerator, LlmQualityScorer, LlmVerifier, SeedContext,
};
use tekmerion::models::split_sentences;
use tekmerion::{
    Config, Difficulty, GenerateRequest, LlmClient, Orchestrator, SimilarPipeline, SimilarRequest,
    VectorIndex,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tekmerion")]
#[command(version)]
#[command(about = "Evidence-grounded reading-comprehension item generation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate one verified multiple-choice item
    Generate {
        /// Topic category for the passage
        #[arg(short, long)]
        topic: String,

        /// Difficulty band
        #[arg(short, long, value_enum, default_value = "standard")]
        difficulty: Difficulty,

        /// Target passage length in characters (overrides config)
        #[arg(long)]
        target_chars: Option<u32>,

        /// Seed the passage from the corpus: retrieval query for the seed
        #[arg(long)]
        seed_query: Option<String>,

        /// Skip choices and verification; produce passage + quality only
        #[arg(long)]
        passage_only: bool,

        /// Write the result JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Build a study pack of easier material for a difficult passage
    Similar {
        /// The passage the learner found too hard (inline)
        #[arg(long, conflicts_with = "passage_file")]
        passage: Option<String>,

        /// Read the passage from a file
        #[arg(long)]
        passage_file: Option<PathBuf>,

        /// Why the learner found it hard, in their own words
        #[arg(short, long, default_value = "too difficult")]
        reason: String,

        /// Group ids already served; repeat to exclude several
        #[arg(long = "exclude")]
        exclude: Vec<String>,

        /// Retrieval candidate cap (overrides config)
        #[arg(long)]
        top_k: Option<usize>,

        /// Similarity floor for candidates (overrides config)
        #[arg(long)]
        min_score: Option<f64>,

        /// Write the result JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Validate configuration (and the vector index, if present)
    Validate,

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# tekmerion configuration file

[endpoint]
# API key (can also use OPENAI_API_KEY env var)
# api_key = "sk-..."
base_url = "https://api.openai.com/v1"
timeout_secs = 180
max_retries = 3

[models]
generator = { id = "gpt-4o", temperature = 0.4 }
rewriter = { id = "gpt-4o-mini", temperature = 0.1 }
verifier = { id = "gpt-4o-mini", temperature = 0.2 }
quality = { id = "gpt-4o-mini", temperature = 0.2 }
embedding = "text-embedding-3-small"

[pipeline]
sim_threshold = 0.22
max_keep = 2
max_repair_rounds = 2
max_regenerate = 0
worker_pool_size = 6
target_chars = 900

[retrieval]
index_path = "data/vectors.f32"
metadata_path = "data/metadata.jsonl"
embed_dim = 1536
pass_threshold = 0.75
multi_query_n = 3
enable_hyde = true
degraded_margin = 0.05
improve_delta = 0.02
top_k = 8
context_top_k = 5
min_score = 0.22
"#;
    println!("{example}");
}

fn spinner(message: &str) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}").expect("static spinner template"),
    );
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

fn load_config(path: &PathBuf) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn build_client(config: &Config) -> Result<Arc<LlmClient>> {
    let api_key = config
        .resolve_api_key()
        .context("Failed to resolve API key")?;
    let client = LlmClient::new(
        Some(api_key),
        config.endpoint.base_url.clone(),
        config.endpoint.timeout_secs,
        config.endpoint.max_retries,
    )?;
    Ok(Arc::new(client))
}

fn emit_json<T: serde::Serialize>(value: &T, output: Option<&PathBuf>) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize result")?;
    match output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write {path:?}"))?;
            info!(path = ?path, "Result written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

async fn seed_from_corpus(
    config: &Config,
    embedder: &LlmEmbedder,
    query: &str,
) -> Result<SeedContext> {
    let index = VectorIndex::load(&config.retrieval).context("Failed to load vector index")?;
    let vectors = embedder.embed(&[query.to_string()]).await?;
    let Some(vector) = vectors.first() else {
        bail!("Embedding capability unavailable; cannot resolve --seed-query");
    };
    let hits = index.search(vector, 1);
    let Some(hit) = hits.first() else {
        bail!("No corpus passage matched the seed query");
    };
    let record = index
        .record(hit.row)
        .context("Index row without metadata")?;
    Ok(SeedContext {
        group_id: Some(record.group_id.clone()),
        sentences: split_sentences(&record.passage),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            config
                .resolve_api_key()
                .context("Failed to resolve API key")?;

            info!("Configuration is valid");
            info!("  Generator:  {}", config.models.generator.id);
            info!("  Verifier:   {}", config.models.verifier.id);
            info!("  Embedding:  {}", config.models.embedding);
            info!(
                "  Pipeline:   sim_threshold={}, repair_rounds={}, pool={}",
                config.pipeline.sim_threshold,
                config.pipeline.max_repair_rounds,
                config.pipeline.worker_pool_size
            );

            if config.retrieval.index_path.exists() {
                let index = VectorIndex::load(&config.retrieval)
                    .context("Vector index failed validation")?;
                info!(
                    "  Index:      {} passages, dim {}",
                    index.len(),
                    index.dim()
                );
            } else {
                info!(
                    "  Index:      not present at {:?} (similar disabled)",
                    config.retrieval.index_path
                );
            }
            return Ok(());
        }

        Commands::Generate {
            topic,
            difficulty,
            target_chars,
            seed_query,
            passage_only,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let client = build_client(&config)?;

            let embedder = Arc::new(LlmEmbedder::new(
                client.clone(),
                config.models.embedding.clone(),
            ));
            let seed_context = match seed_query {
                Some(query) => Some(seed_from_corpus(&config, &embedder, &query).await?),
                None => None,
            };

            let orchestrator = Orchestrator::new(
                Arc::new(LlmGenerator::new(
                    client.clone(),
                    config.models.generator.clone(),
                    config.models.rewriter.clone(),
                )),
                Arc::new(LlmQualityScorer::new(
                    client.clone(),
                    config.models.quality.clone(),
                )),
                Arc::new(LlmVerifier::new(
                    client.clone(),
                    config.models.verifier.clone(),
                )),
                embedder,
                config.pipeline.clone(),
            );

            let request = GenerateRequest {
                topic,
                difficulty,
                target_chars,
                seed_context,
                include_choices: !passage_only,
            };

            let bar = spinner("Generating item...");
            let result = orchestrator.run(&request).await;
            bar.finish_and_clear();
            let result = result?;

            println!("\n=== Item Generation Complete ===");
            println!("Title:       {}", result.title);
            println!("Key:         {}", result.db_key);
            println!("Sentences:   {}", result.sentences.len());
            println!("Choices:     {}", result.choices.len());
            if let Some(eval) = &result.rag_eval {
                println!("Accuracy:    {:.0}%", eval.label_accuracy * 100.0);
                println!("Evidence:    {:.3} avg ({})", eval.avg_evidence_strength, eval.method);
            }
            println!("Repairs:     {} over {} rounds", result.repairs.len(), result.telemetry.repair_rounds);
            println!("Exhausted:   {}", result.exhausted);
            println!("Runtime:     {:.1}s", result.telemetry.total_ms / 1000.0);
            let stats = client.rate_limiter().stats();
            println!(
                "API:         {} requests, {} rate limited, {:.1}s waiting",
                stats.total_requests, stats.total_429s, stats.total_wait_secs
            );

            emit_json(&result, output.as_ref())?;
        }

        Commands::Similar {
            passage,
            passage_file,
            reason,
            exclude,
            top_k,
            min_score,
            output,
        } => {
            let mut config = load_config(&cli.config)?;
            if let Some(top_k) = top_k {
                config.retrieval.top_k = top_k;
            }
            if let Some(min_score) = min_score {
                config.retrieval.min_score = min_score;
            }
            let client = build_client(&config)?;

            let passage = match (passage, passage_file) {
                (Some(text), _) => text,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read {path:?}"))?,
                (None, None) => bail!("Provide --passage or --passage-file"),
            };

            let index = Arc::new(
                VectorIndex::load(&config.retrieval).context("Failed to load vector index")?,
            );
            let pipeline = SimilarPipeline::new(
                client.clone(),
                config.models.rewriter.clone(),
                Arc::new(LlmQualityScorer::new(
                    client.clone(),
                    config.models.quality.clone(),
                )),
                Arc::new(LlmEmbedder::new(
                    client.clone(),
                    config.models.embedding.clone(),
                )),
                index,
                config.retrieval.clone(),
            );

            let request = SimilarRequest {
                passage,
                reason,
                exclude_group_ids: exclude.into_iter().collect(),
            };

            let bar = spinner("Building study pack...");
            let result = pipeline.run(&request).await;
            bar.finish_and_clear();
            let result = result?;

            println!("\n=== Study Pack Complete ===");
            println!("Title:       {}", result.title);
            println!("Key:         {}", result.db_key);
            println!("Query:       {}", result.final_query);
            println!(
                "Score:       {:.2} -> {:.2}",
                result.eval_before.overall, result.eval_after.overall
            );
            println!("Queries:     {}", result.queries_used.len());
            println!("Context:     {} passages", result.used_context.len());
            println!("Sentences:   {}", result.sentences.len());
            let stats = client.rate_limiter().stats();
            println!(
                "API:         {} requests, {} rate limited, {:.1}s waiting",
                stats.total_requests, stats.total_429s, stats.total_wait_secs
            );

            emit_json(&result, output.as_ref())?;
        }
    }

    Ok(())
}
