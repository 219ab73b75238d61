use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::warn;
use tracing_subscriber::EnvFilter;

use airgap_core::config::{Config, Settings};
use airgap_core::data_processor::DataProcessor;
use airgap_core::types::Document;
use airgap_infer::{ModelFamily, ModelRegistry, ProcessEngine};
use airgap_rag::{AskOptions, RagPipeline};

#[derive(Parser)]
#[command(name = "airgap", about = "Offline question answering over your own documents")]
struct Cli {
    /// Directory holding config.toml and its per-environment overlays.
    #[arg(long, global = true, default_value = ".")]
    config_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Index text files or directories of text files.
    Ingest {
        #[arg(required = true)]
        paths: Vec<PathBuf>,
        /// Only read the first N files of each directory.
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Ask a question and stream the answer.
    Ask {
        question: String,
        /// Send the question without retrieved context.
        #[arg(long)]
        no_rag: bool,
        /// Registry name of the model to use.
        #[arg(long)]
        model: Option<String>,
        /// Wrap the prompt in the model family's chat template.
        #[arg(long)]
        template: bool,
        #[arg(long)]
        show_prompt: bool,
        #[arg(long)]
        top_k: Option<usize>,
    },
    /// List indexed documents.
    Docs,
    /// Remove a document by id, id prefix, or filename.
    Remove { doc: String },
    /// Remove every document from the index.
    Reset,
    /// List configured models and whether their files are present.
    Models,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env_name = std::env::var("RUST_ENV").unwrap_or_else(|_| "dev".to_string());
    let config = Config::load_from(&cli.config_dir, &env_name).context("loading configuration")?;
    let settings = config.settings().context("validating configuration")?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Command::Ingest { paths, limit } => {
            let pipeline = rt.block_on(open_pipeline(&settings, None))?;
            ingest(&pipeline, &paths, limit)?;
            rt.block_on(pipeline.persist())?;
        }
        Command::Ask { question, no_rag, model, template, show_prompt, top_k } => {
            let pipeline = rt.block_on(open_pipeline(&settings, model.as_deref()))?;
            let model_name = model.unwrap_or_else(|| settings.generation.model.clone());
            let mut options = AskOptions::from_settings(&settings);
            options.use_rag = options.use_rag && !no_rag;
            options.top_k = top_k.unwrap_or(options.top_k);
            if template {
                options.chat_template = ModelFamily::from_name(&model_name);
                if options.chat_template.is_none() {
                    warn!("No chat template known for {model_name}, sending the raw prompt");
                }
            }
            ask(&pipeline, &question, &options, show_prompt)?;
        }
        Command::Docs => {
            let pipeline = rt.block_on(open_pipeline(&settings, None))?;
            let docs = pipeline.documents();
            if docs.is_empty() {
                println!("No documents indexed.");
            }
            for d in docs {
                println!("{}  {:>5} chunks  {}", &d.doc_id[..12.min(d.doc_id.len())], d.chunks, d.filename);
            }
        }
        Command::Remove { doc } => {
            let pipeline = rt.block_on(open_pipeline(&settings, None))?;
            let removed = pipeline.remove_document(&doc)?;
            rt.block_on(pipeline.persist())?;
            println!("Removed {removed} chunks.");
        }
        Command::Reset => {
            let pipeline = rt.block_on(open_pipeline(&settings, None))?;
            pipeline.reset();
            rt.block_on(pipeline.persist())?;
            println!("Index cleared.");
        }
        Command::Models => {
            let registry = ModelRegistry::new(settings.generation.clone());
            for info in registry.list() {
                let marker = if info.name == settings.generation.model { "*" } else { " " };
                match (info.available, info.file_size_mb) {
                    (true, Some(mb)) => println!(
                        "{marker} {:<10} {:>8.1} MB  {:<8} {}",
                        info.name,
                        mb,
                        info.quantization.unwrap_or_default(),
                        info.path.map(|p| p.display().to_string()).unwrap_or_default()
                    ),
                    _ => println!(
                        "{marker} {:<10} missing      {}",
                        info.name,
                        info.path.map(|p| p.display().to_string()).unwrap_or_else(|| "(not configured)".into())
                    ),
                }
            }
        }
    }
    Ok(())
}

async fn open_pipeline(settings: &Settings, model: Option<&str>) -> anyhow::Result<RagPipeline> {
    let name = model.unwrap_or(&settings.generation.model);
    let model_path = settings.generation.model_file(name);
    if model.is_some() && model_path.is_none() {
        bail!("model '{name}' is not configured; see `airgap models`");
    }
    let engine = ProcessEngine::new(name, &settings.generation.binary, model_path.unwrap_or_default());
    RagPipeline::open(settings.clone(), Arc::new(engine)).await.context("opening index")
}

fn ingest(pipeline: &RagPipeline, paths: &[PathBuf], limit: Option<usize>) -> anyhow::Result<()> {
    let processor = limit.map_or_else(DataProcessor::new, DataProcessor::with_limit);
    let mut documents: Vec<Document> = Vec::new();
    for path in paths {
        documents.extend(processor.process_path(path).with_context(|| format!("reading {}", path.display()))?);
    }

    let pb = ProgressBar::new(documents.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} documents ({percent}%) {msg}")?
            .progress_chars("#>-"),
    );
    let (mut added, mut skipped) = (0usize, 0usize);
    for doc in &documents {
        pb.set_message(doc.source.filename.clone());
        let summary = pipeline.ingest(doc)?;
        added += summary.chunks_added;
        skipped += summary.duplicates_skipped;
        pb.inc(1);
    }
    pb.finish_with_message("done");
    println!("Indexed {} documents: {added} chunks added, {skipped} already present.", documents.len());
    Ok(())
}

fn ask(pipeline: &RagPipeline, question: &str, options: &AskOptions, show_prompt: bool) -> anyhow::Result<()> {
    let answer = pipeline.ask_with(question, &[], options)?;
    if show_prompt {
        eprintln!("----- prompt -----\n{}\n------------------", answer.prompt);
    }
    if options.use_rag && !answer.context_included {
        eprintln!("(no matching context found; answering without documents)");
    } else if answer.truncated {
        eprintln!("(context truncated to fit the prompt budget)");
    }

    let mut stdout = std::io::stdout().lock();
    for token in answer.tokens {
        match token {
            Ok(t) => {
                stdout.write_all(t.as_bytes())?;
                stdout.flush()?;
            }
            Err(e) => {
                writeln!(stdout)?;
                return Err(e).context("generation failed");
            }
        }
    }
    writeln!(stdout)?;

    if !answer.citations.is_empty() {
        writeln!(stdout, "\nSources:")?;
        for c in &answer.citations {
            writeln!(stdout, "  {} (chunk {}, score {:.3})", c.filename, c.ordinal, c.score)?;
        }
    }
    Ok(())
}
