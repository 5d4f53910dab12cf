//! RAG CLI - Run the retrieval pipeline over a local corpus.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use rag_core::{FusionMethod, Mode, RagConfig, RunOptions};
use rag_index::{
    Bm25Index, Corpus, ExtractiveGenerator, HashedEmbedder, HashedVectorIndex, OverlapReranker,
    RuleRewriter,
};
use rag_query::{ChannelSink, EventSink, Pipeline, PipelineOutput, TraceEvent};

/// RAG - Adaptive retrieval and ranking over local documents
#[derive(Parser)]
#[command(name = "rag")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/rag-engine/config.toml, then ./rag-engine.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Retrieve ranked context for a query
    Query {
        /// Query text
        query: String,

        /// Directory of .md/.txt files to search
        #[arg(long)]
        corpus: PathBuf,

        /// Recurse into subdirectories of the corpus
        #[arg(short, long)]
        recursive: bool,

        /// auto, vector-only, hybrid, decomposed, or self-refine
        #[arg(short, long, default_value = "auto")]
        mode: Mode,

        /// Results per backend call
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// Self-refinement budget
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Confidence needed to accept a pass
        #[arg(long)]
        threshold: Option<f32>,

        /// Rerank fused results by term overlap
        #[arg(long)]
        rerank: bool,

        /// Disable the keyword backend
        #[arg(long)]
        no_keyword: bool,

        /// Generate an extractive answer from the context
        #[arg(long)]
        answer: bool,

        /// Stream debug events to stderr as JSON lines
        #[arg(long)]
        debug: bool,

        /// Print the full output as JSON
        #[arg(long)]
        json: bool,

        /// Print per-stage durations
        #[arg(long)]
        timing: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn setup_logging(verbose: bool) {
    let level = if verbose { Level::DEBUG } else { Level::WARN };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_config(path: Option<&Path>) -> Result<RagConfig, Box<dyn std::error::Error>> {
    Ok(match path {
        Some(path) => RagConfig::load(path)?,
        None => RagConfig::load_default()?,
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
        Commands::Query {
            query,
            corpus,
            recursive,
            mode,
            top_k,
            max_iterations,
            threshold,
            rerank,
            no_keyword,
            answer,
            debug,
            json,
            timing,
        } => {
            if rerank {
                config.fusion.method = FusionMethod::Rerank;
            }
            if no_keyword {
                config.retrieval.hybrid = false;
            }

            let mut options = RunOptions::from_config(&config);
            options.mode = mode;
            options.debug = debug;
            if let Some(top_k) = top_k {
                options.top_k = top_k;
            }
            if let Some(max_iterations) = max_iterations {
                options.max_iterations = max_iterations;
            }
            if let Some(threshold) = threshold {
                options.confidence_threshold = threshold;
            }

            let pipeline = build_pipeline(config, &corpus, recursive, answer)?;
            let output = run_query(&pipeline, &query, &options).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&output)?);
            } else {
                print_output(&output);
                if timing {
                    print_timing(&output);
                }
            }
        }
    }

    Ok(())
}

fn build_pipeline(
    config: RagConfig,
    corpus_dir: &Path,
    recursive: bool,
    answer: bool,
) -> Result<Pipeline, Box<dyn std::error::Error>> {
    let corpus = Corpus::load_dir(corpus_dir, recursive)?;
    if corpus.is_empty() {
        eprintln!("No .md or .txt content found at: {}", corpus_dir.display());
        std::process::exit(1);
    }
    info!("Indexed {} chunk(s)", corpus.len());

    let mut builder = Pipeline::builder(
        config,
        Arc::new(HashedVectorIndex::new(&corpus, HashedEmbedder::default())),
    )
    .keyword_index(Arc::new(Bm25Index::new(&corpus)))
    .rewriter(Arc::new(RuleRewriter::new()))
    .reranker(Arc::new(OverlapReranker::default()));

    if answer {
        builder = builder.generator(Arc::new(ExtractiveGenerator::default()));
    }

    Ok(builder.build())
}

async fn run_query(
    pipeline: &Pipeline,
    query: &str,
    options: &RunOptions,
) -> Result<PipelineOutput, Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let (tx, mut rx) = mpsc::unbounded_channel::<TraceEvent>();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => eprintln!("{}", line),
                Err(e) => eprintln!("Error encoding {} event: {}", event.name(), e),
            }
        }
    });

    let sink: Option<Arc<dyn EventSink>> = if options.debug {
        Some(Arc::new(ChannelSink::new(tx)))
    } else {
        drop(tx);
        None
    };

    let result = pipeline.run_with(query, options, &cancel, sink).await;
    // Sender drops with the pipeline's sink; drain what was sent.
    printer.await.ok();

    Ok(result?)
}

fn print_output(output: &PipelineOutput) {
    println!("Strategy: {}", output.strategy);

    for record in &output.iterations {
        println!(
            "  pass {}: confidence {:.3} -> {:?}",
            record.iteration_index, record.confidence, record.decision
        );
    }

    if output.context.is_empty() {
        println!("\nNo results.");
    } else {
        println!();
        for result in &output.context {
            let sources: Vec<_> = result.sources.iter().map(|s| s.as_str()).collect();
            let score = match result.rerank_score {
                Some(rerank) => format!("fused {:.3}, rerank {:.3}", result.fused_score, rerank),
                None => format!("fused {:.3}", result.fused_score),
            };
            println!(
                "{}. {}#{} ({}; {})",
                result.final_rank,
                result.candidate.document_id,
                result.candidate.chunk_index,
                score,
                sources.join("+")
            );
            println!("   {}", result.candidate.text_preview.replace('\n', " "));
        }
    }

    if let Some(answer) = &output.answer {
        println!("\nAnswer: {}", answer);
    }

    let annotations = output.trace.annotations();
    if !annotations.is_empty() {
        println!("\nWarnings:");
        for annotation in annotations {
            println!("  - {}", annotation);
        }
    }

    let total = output
        .trace
        .stage_events
        .iter()
        .map(|e| e.ended_at)
        .max()
        .unwrap_or_default();
    println!("\nCompleted in {}ms", total.as_millis());
}

fn print_timing(output: &PipelineOutput) {
    println!("\nStage timings:");
    for (stage, duration) in output.trace.timing_breakdown() {
        println!("  {:<24} {:>8.2}ms", stage, duration.as_secs_f64() * 1000.0);
    }
}
