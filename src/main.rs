use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use codectx::context::payload_str;
use codectx::indexer::SymbolLocation;
use codectx::memory::SearchResult;
use codectx::{ConfigManager, ContextOrchestrator, CursorPosition};
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

// ============================================================================
// CLI Argument Parsing
// ============================================================================

#[derive(Parser)]
#[command(name = "codectx", version, about = "codectx - context engine for coding assistants")]
struct Cli {
    /// Output JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    /// Project root (defaults to current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index the project and report what was found
    Index,
    /// List symbols declared in a file
    Symbols { file: PathBuf },
    /// List imports of a file
    Deps { file: PathBuf },
    /// Find every symbol with this exact name
    Refs { name: String },
    /// Show the hierarchical outline of a file
    Outline { file: PathBuf },
    /// Print the context bundle assembled for a query
    Context {
        query: String,
        /// Active file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Selected code in the active file
        #[arg(long)]
        selection: Option<String>,
        /// Cursor line in the active file (1-based)
        #[arg(long, requires = "file")]
        line: Option<usize>,
    },
    /// Answer a request with suggestions and related files
    Ask { query: String },
    /// Record an edit to a file
    Record {
        file: PathBuf,
        #[arg(long)]
        old: String,
        #[arg(long)]
        new: String,
        #[arg(long, default_value = "edit")]
        change_type: String,
    },
    /// Semantic search over stored memories
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
    },
    /// Export all memories to a JSON file
    Export { out: PathBuf },
    /// Remove stale, low-scoring memories
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Show memory store statistics
    Stats,
    /// Write the effective configuration to the project config file
    Config,
}

/// JSON envelope for non-interactive output
fn json_output(success: bool, data: Value, error: Option<&str>) -> String {
    json!({
        "success": success,
        "data": data,
        "error": error,
    })
    .to_string()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Check for --json flag before initializing logging
    let json_mode = std::env::args().any(|arg| arg == "--json");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("codectx=info"));

    if json_mode {
        // stdout carries the envelope; logs go to stderr without colors
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_ansi(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    } else if std::env::var("CODECTX_LOG_JSON").is_ok() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .init();
    }

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("project root {} not found", root.display()))?;

    match run_command(cli.command, &root, cli.json).await {
        Ok(()) => Ok(()),
        Err(e) if cli.json => {
            println!("{}", json_output(false, Value::Null, Some(&format!("{:#}", e))));
            std::process::exit(1);
        }
        Err(e) => Err(e),
    }
}

// ============================================================================
// Command Runner
// ============================================================================

async fn run_command(command: Commands, root: &Path, json_mode: bool) -> Result<()> {
    if let Commands::Config = command {
        let manager = ConfigManager::new(root)?;
        manager.save()?;
        let path = manager.project_config_path().display().to_string();
        if json_mode {
            println!("{}", json_output(true, json!({ "path": path }), None));
        } else {
            println!("Configuration written to {}", path);
        }
        return Ok(());
    }

    let config = ConfigManager::load(root)?;
    let mut engine = ContextOrchestrator::initialize(root, config).await?;

    let outcome = execute(&mut engine, command, root, json_mode).await;
    engine.shutdown().await;
    outcome
}

async fn execute(
    engine: &mut ContextOrchestrator,
    command: Commands,
    root: &Path,
    json_mode: bool,
) -> Result<()> {
    match command {
        Commands::Index => {
            let indexer = engine.indexer();
            if json_mode {
                println!("{}", json_output(true, json!({
                    "root": root.display().to_string(),
                    "state": indexer.state(),
                    "language": indexer.language(),
                    "files": indexer.file_count(),
                    "language_servers": indexer.server_languages(),
                }), None));
            } else {
                println!("Root:      {}", root.display());
                println!("Language:  {}", indexer.language());
                println!("Files:     {}", indexer.file_count());
                println!("State:     {:?}", indexer.state());
                let servers: Vec<String> =
                    indexer.server_languages().iter().map(|l| l.to_string()).collect();
                println!(
                    "Servers:   {}",
                    if servers.is_empty() { "heuristic parser".to_string() } else { servers.join(", ") }
                );
            }
        }
        Commands::Symbols { file } => {
            let symbols = engine.get_symbols(&file);
            if json_mode {
                println!("{}", json_output(true, json!({ "file": file, "symbols": symbols }), None));
            } else if symbols.is_empty() {
                println!("No symbols in {}", file.display());
            } else {
                for s in symbols {
                    match &s.container {
                        Some(container) => println!("{:>5}  {:<9} {}.{}", s.line, s.kind, container, s.name),
                        None => println!("{:>5}  {:<9} {}", s.line, s.kind, s.name),
                    }
                }
            }
        }
        Commands::Deps { file } => {
            let deps = engine.get_dependencies(&file);
            if json_mode {
                println!("{}", json_output(true, json!({ "file": file, "dependencies": deps }), None));
            } else {
                for d in deps {
                    println!("{}", d);
                }
            }
        }
        Commands::Refs { name } => {
            let refs = engine.find_symbol_references(&name);
            if json_mode {
                println!("{}", json_output(true, json!({ "name": name, "references": refs }), None));
            } else if refs.is_empty() {
                println!("No symbol named {}", name);
            } else {
                print_locations(&refs);
            }
        }
        Commands::Outline { file } => {
            let outline = engine.indexer().get_document_outline(&file);
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&outline)?, None));
            } else {
                println!(
                    "{}: {} classes, {} functions, {} constants, {} types",
                    outline.path, outline.classes, outline.functions, outline.constants, outline.types
                );
                print!("{}", outline.render());
            }
        }
        Commands::Context {
            query,
            file,
            selection,
            line,
        } => {
            if let Some(file) = &file {
                let cursor = line.map(|line| CursorPosition { line, column: 0 });
                engine.update_context(file, selection.as_deref(), cursor).await?;
            }
            let bundle = engine.get_enhanced_context(&query).await;
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&bundle)?, None));
            } else {
                print!("{}", bundle.format_for_llm());
            }
        }
        Commands::Ask { query } => {
            let response = engine.process_request(&query).await;
            if json_mode {
                println!("{}", json_output(true, json!({
                    "query": response.query,
                    "suggestions": response.suggestions,
                    "related_files": response.related_files,
                    "context": response.context,
                }), None));
            } else {
                if response.suggestions.is_empty() {
                    println!("No suggestions.");
                }
                for s in &response.suggestions {
                    println!("* {}", s);
                }
                for f in &response.related_files {
                    println!("> {}", f);
                }
            }
        }
        Commands::Record {
            file,
            old,
            new,
            change_type,
        } => {
            engine.record_change(&file, &change_type, &old, &new).await?;
            let diff = engine
                .agent_context()
                .recent_changes
                .latest()
                .map(|c| c.diff.clone())
                .unwrap_or_default();
            if json_mode {
                println!("{}", json_output(true, json!({ "file": file, "diff": diff }), None));
            } else {
                print!("{}", diff);
                println!("Recorded {} on {}", change_type, file.display());
            }
        }
        Commands::Search { query, limit } => {
            let results = engine.semantic_search(&query, limit).await;
            if json_mode {
                println!("{}", json_output(true, json!({ "query": query, "results": results }), None));
            } else if results.is_empty() {
                println!("No matches.");
            } else {
                print_results(&results);
            }
        }
        Commands::Export { out } => {
            let document = engine.export(&out).await?;
            if json_mode {
                println!("{}", json_output(true, json!({
                    "path": out,
                    "memories": document.memories.len(),
                    "code_patterns": document.code_patterns.len(),
                    "relationships": document.relationships.len(),
                }), None));
            } else {
                println!(
                    "Exported {} memories, {} patterns, {} relationships to {}",
                    document.memories.len(),
                    document.code_patterns.len(),
                    document.relationships.len(),
                    out.display()
                );
            }
        }
        Commands::Cleanup { days } => {
            let removed = engine.cleanup(days).await?;
            if json_mode {
                println!("{}", json_output(true, json!({ "removed": removed, "days": days }), None));
            } else {
                println!("Removed {} memories older than {} days", removed, days);
            }
        }
        Commands::Stats => {
            let stats = engine.stats().await;
            let recent = engine.get_recent_conversations(3).await;
            if json_mode {
                println!("{}", json_output(true, serde_json::to_value(&stats)?, None));
            } else {
                print!("{}", stats.format());
                for entry in recent {
                    let text = payload_str(&entry.content, "query")
                        .or_else(|| payload_str(&entry.content, "file_path"))
                        .unwrap_or("-");
                    println!("  {}  {}", entry.created_at.format("%Y-%m-%d %H:%M"), text);
                }
            }
        }
        // written by run_command before the engine starts
        Commands::Config => {}
    }
    Ok(())
}

fn print_locations(locations: &[SymbolLocation]) {
    for loc in locations {
        println!("{}:{}  {} {}", loc.path, loc.line, loc.symbol.kind, loc.symbol.name);
    }
}

fn print_results(results: &[SearchResult]) {
    for r in results {
        println!(
            "[{:.3}] {:<12} {}",
            r.similarity,
            r.kind.to_string(),
            r.summary(100)
        );
        if let Some(path) = &r.file_path {
            println!("         {}", path);
        }
    }
}
