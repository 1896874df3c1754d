#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand, ValueEnum};
use kiln_config::{Config, MaterializeMode};
use kiln_engine::{ArtifactStore, BuildOptions, EngineError, EvictionReport, RuleKey, TargetGraph};
use kiln_util::fs::LocalFs;
use kiln_util::CancelToken;
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

/// Exit code on success, or the error to report.
type CliResult = Result<i32, EngineError>;

#[derive(Debug, Parser)]
#[command(name = "kiln", about = "A content-addressed build engine for polyglot repositories")]
#[command(version)]
struct Cli {
    /// Repository root (defaults to the nearest directory holding kiln.toml)
    #[arg(long, global = true)]
    repo: Option<PathBuf>,
    /// Log engine internals at debug level
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a new Kiln repository
    Init {
        /// Directory to initialize (defaults to the current directory)
        dir: Option<PathBuf>,
    },
    /// Build targets and everything they depend on
    Build {
        /// Target patterns (`//pkg:name`, `//pkg:`, `//pkg/...`); all targets if omitted
        targets: Vec<String>,
        /// Keep building independent targets after a failure
        #[arg(long)]
        keep_going: bool,
        /// Maximum number of concurrent actions
        #[arg(long, short = 'j', value_parser = parse_jobs)]
        jobs: Option<usize>,
        /// How cached outputs are placed into the output directory
        #[arg(long, value_enum)]
        materialize: Option<Materialize>,
        /// Override the artifact cache directory
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Write every build event as a JSON line to this file
        #[arg(long)]
        events: Option<PathBuf>,
        /// Suppress per-action progress lines
        #[arg(long, short = 'q')]
        quiet: bool,
    },
    /// Print the input rule key of each selected target
    Rulekey {
        /// Target patterns; all targets if omitted
        targets: Vec<String>,
    },
    /// Print the dependency graph of the selected targets
    Graph {
        /// Target patterns; all targets if omitted
        targets: Vec<String>,
        /// Emit Graphviz dot instead of an indented listing
        #[arg(long)]
        dot: bool,
    },
    /// Inspect and trim the artifact cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
    /// Remove materialized outputs
    Clean {
        /// Also remove the artifact cache
        #[arg(long)]
        cache: bool,
    },
}

#[derive(Debug, Subcommand)]
enum CacheAction {
    /// Evict cache entries
    Gc {
        /// Evict least recently used entries until the cache fits (defaults to cache_max_bytes)
        #[arg(long)]
        max_bytes: Option<u64>,
        /// Evict entries not used for this many days
        #[arg(long)]
        older_than_days: Option<u64>,
        /// Evict entries whose manifest cannot be read
        #[arg(long)]
        corrupt: bool,
    },
    /// Show the provenance and outputs of a cache entry
    Show {
        /// Rule key (64 hex characters)
        key: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Materialize {
    Copy,
    Hardlink,
}

impl From<Materialize> for MaterializeMode {
    fn from(value: Materialize) -> Self {
        match value {
            Materialize::Copy => Self::Copy,
            Materialize::Hardlink => Self::Hardlink,
        }
    }
}

fn parse_jobs(value: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(0) => Err("must be at least 1".to_owned()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            e.exit_code()
        }
    };
    process::exit(code);
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("KILN_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> CliResult {
    let repo = cli.repo;
    match cli.command {
        Command::Init { dir } => cmd_init(dir),
        Command::Build {
            targets,
            keep_going,
            jobs,
            materialize,
            cache_dir,
            events,
            quiet,
        } => {
            let options = BuildOptions {
                targets,
                keep_going: keep_going.then_some(true),
                concurrency: jobs,
                materialize_mode: materialize.map(MaterializeMode::from),
                cache_dir,
                progress: !quiet,
                event_log: events,
                cancel: CancelToken::new(),
            };
            cmd_build(&repo_root(repo)?, &options)
        }
        Command::Rulekey { targets } => cmd_rulekey(&repo_root(repo)?, &targets),
        Command::Graph { targets, dot } => cmd_graph(&repo_root(repo)?, &targets, dot),
        Command::Cache { action } => match action {
            CacheAction::Gc {
                max_bytes,
                older_than_days,
                corrupt,
            } => cmd_cache_gc(&repo_root(repo)?, max_bytes, older_than_days, corrupt),
            CacheAction::Show { key } => cmd_cache_show(&repo_root(repo)?, &key),
        },
        Command::Clean { cache } => cmd_clean(&repo_root(repo)?, cache),
    }
}

/// The explicit `--repo`, else the nearest ancestor of the current
/// directory holding `kiln.toml`, else the current directory.
fn repo_root(explicit: Option<PathBuf>) -> Result<PathBuf, EngineError> {
    if let Some(dir) = explicit {
        return Ok(dir);
    }
    let cwd = std::env::current_dir().map_err(|source| EngineError::io(Path::new("."), source))?;
    let root = find_root(&cwd).unwrap_or(cwd);
    tracing::debug!(root = %root.display(), "repository root");
    Ok(root)
}

fn find_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join("kiln.toml").is_file())
        .map(Path::to_path_buf)
}

/// Route SIGINT and SIGTERM to `cancel`. A second SIGINT exits immediately.
fn install_interrupt_handler(cancel: &CancelToken) -> Result<(), EngineError> {
    let flag = cancel.flag();
    let register = |result: std::io::Result<signal_hook::SigId>| {
        result.map(drop).map_err(|e| EngineError::Internal {
            message: format!("cannot install signal handler: {e}"),
        })
    };
    register(signal_hook::flag::register_conditional_shutdown(
        SIGINT,
        130,
        Arc::clone(&flag),
    ))?;
    register(signal_hook::flag::register(SIGINT, Arc::clone(&flag)))?;
    register(signal_hook::flag::register(SIGTERM, flag))?;
    Ok(())
}

fn cmd_init(dir: Option<PathBuf>) -> CliResult {
    let dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir().map_err(|source| EngineError::io(Path::new("."), source))?,
    };
    kiln_engine::init_repo(&dir)?;

    eprintln!("    Created repository at {}", dir.display());
    eprintln!();
    eprintln!("  To get started:");
    eprintln!("    cd {}", dir.display());
    eprintln!("    kiln build");
    Ok(0)
}

fn cmd_build(root: &Path, options: &BuildOptions) -> CliResult {
    install_interrupt_handler(&options.cancel)?;
    let report = kiln_engine::build(root, options)?;
    let summary = &report.summary;
    let secs = report.duration.as_secs_f64();

    if !summary.failures.is_empty() {
        eprintln!();
        eprint!("{}", summary.render_failures());
    }
    if summary.cancelled {
        eprintln!("    Cancelled after {secs:.2}s ({})", summary.counts_line());
    } else if summary.is_success() {
        eprintln!(
            "    Finished {} target(s) in {secs:.2}s ({})",
            summary.total(),
            summary.counts_line()
        );
    } else {
        eprintln!("    Failed after {secs:.2}s ({})", summary.counts_line());
    }
    Ok(summary.exit_code())
}

fn cmd_rulekey(root: &Path, targets: &[String]) -> CliResult {
    for (id, key) in kiln_engine::rule_keys(root, targets)? {
        println!("{key}  {id}");
    }
    Ok(0)
}

fn cmd_graph(root: &Path, targets: &[String], dot: bool) -> CliResult {
    let config = Config::from_path(&root.join("kiln.toml"))?;
    let graph = TargetGraph::load(root, &config)?;
    let selected = graph.select(targets)?;
    let ids = graph.closure(&selected);

    if dot {
        println!("digraph kiln {{");
    }
    for id in &ids {
        let target = graph.target(id)?;
        if dot {
            println!("  \"{id}\" [label=\"{id}\\n{}\"];", target.kind);
            for dep in target.deps() {
                println!("  \"{id}\" -> \"{dep}\";");
            }
        } else {
            println!("{id} ({})", target.kind);
            for dep in target.deps() {
                println!("  -> {dep}");
            }
        }
    }
    if dot {
        println!("}}");
    }
    Ok(0)
}

fn open_store(root: &Path) -> Result<(Config, ArtifactStore), EngineError> {
    let config = Config::from_path(&root.join("kiln.toml"))?;
    let store = ArtifactStore::open(&config.cache_dir(root), Arc::new(LocalFs))?;
    Ok((config, store))
}

fn cmd_cache_gc(root: &Path, max_bytes: Option<u64>, older_than_days: Option<u64>, corrupt: bool) -> CliResult {
    let (config, store) = open_store(root)?;
    let mut removed = EvictionReport::default();

    let cutoff = older_than_days.and_then(|days| {
        SystemTime::now().checked_sub(Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
    });
    if corrupt || cutoff.is_some() {
        let report = store.evict(|entry| {
            (corrupt && entry.corrupt) || cutoff.is_some_and(|cutoff| entry.accessed < cutoff)
        })?;
        accumulate(&mut removed, report);
    }
    if let Some(limit) = max_bytes.or(config.build.cache_max_bytes) {
        accumulate(&mut removed, store.evict_to_size(limit)?);
    }

    let stats = store.stats()?;
    eprintln!(
        "    Removed {} entries and {} blobs ({} bytes)",
        removed.entries_removed, removed.blobs_removed, removed.bytes_freed
    );
    eprintln!(
        "    Cache holds {} entries and {} blobs ({} bytes)",
        stats.entries, stats.blobs, stats.total_bytes
    );
    Ok(0)
}

fn accumulate(total: &mut EvictionReport, report: EvictionReport) {
    total.entries_removed = total.entries_removed.saturating_add(report.entries_removed);
    total.blobs_removed = total.blobs_removed.saturating_add(report.blobs_removed);
    total.bytes_freed = total.bytes_freed.saturating_add(report.bytes_freed);
}

fn cmd_cache_show(root: &Path, key: &str) -> CliResult {
    let key: RuleKey = key.parse()?;
    let (_, store) = open_store(root)?;
    let Some(entry) = store.lookup(&key)? else {
        return Err(EngineError::CacheEntryMissing { key: key.to_string() });
    };
    let metadata = store.read_metadata(&key)?;
    let json = serde_json::to_string_pretty(&metadata).map_err(|e| EngineError::Metadata {
        message: e.to_string(),
    })?;

    println!("{json}");
    println!();
    for output in entry.outputs() {
        println!("{}  {:o}  {}", output.hash, output.mode, output.path);
    }
    Ok(0)
}

fn cmd_clean(root: &Path, cache: bool) -> CliResult {
    let config = Config::from_path(&root.join("kiln.toml"))?;
    kiln_util::fs::remove_dir_all_if_exists(&config.output_dir(root))?;
    if cache {
        kiln_util::fs::remove_dir_all_if_exists(&config.cache_dir(root))?;
        eprintln!("    Cleaned outputs and cache");
    } else {
        eprintln!("    Cleaned outputs");
    }
    Ok(0)
}
