use std::path::PathBuf;

use facet::Facet;
use figue as args;
use heapscope_async::{CancelFlag, DumpAsyncOptions, RenderMode, RuntimeConventions, dump_async};
use heapscope_snapshot::MemorySnapshot;
use tracing::info;

const SNAPSHOT_ENV: &str = "HEAPSCOPE_SNAPSHOT";

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// JSON heap snapshot to analyze (falls back to $HEAPSCOPE_SNAPSHOT).
    #[facet(args::named, default)]
    snapshot: Option<String>,
    /// Per-type counts instead of stacks.
    #[facet(args::named, default)]
    stats: bool,
    /// Merge stacks on common prefixes.
    #[facet(args::named, default)]
    coalesce: bool,
    /// Only the operation (or state machine) at this hex address.
    #[facet(args::named, default)]
    address: Option<String>,
    /// Only operations with this hex method table.
    #[facet(args::named, default)]
    mt: Option<String>,
    /// Only operations whose type contains this text.
    #[facet(args::named, default)]
    type_filter: Option<String>,
    /// Include operations with no state machine.
    #[facet(args::named, default)]
    tasks: bool,
    /// Include completed operations.
    #[facet(args::named, default)]
    completed: bool,
    /// Dump fields of each frame.
    #[facet(args::named, default)]
    fields: bool,
    /// JSON runtime naming table replacing the .NET defaults.
    #[facet(args::named, default)]
    conventions: Option<String>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let path = snapshot_path(&cli)?;
    let options = options_from_cli(&cli)?;
    let conventions = load_conventions(cli.conventions.as_deref())?;

    let json = std::fs::read_to_string(&path)
        .map_err(|e| format!("failed to read {}: {e}", path.display()))?;
    let snapshot = MemorySnapshot::from_json(&json)
        .map_err(|e| format!("failed to load {}: {e}", path.display()))?;
    info!(
        path = %path.display(),
        objects = snapshot.object_count(),
        "loaded heap snapshot"
    );

    let rendered = dump_async(
        &snapshot,
        &options,
        &conventions,
        &CancelFlag::new(),
    )
    .map_err(|e| e.to_string())?;
    print!("{rendered}");
    Ok(())
}

fn parse_cli() -> Result<Cli, String> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("heapscope")
                .description("Reconstruct async stacks from a managed heap snapshot")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}

fn snapshot_path(cli: &Cli) -> Result<PathBuf, String> {
    cli.snapshot
        .clone()
        .or_else(|| std::env::var(SNAPSHOT_ENV).ok())
        .map(PathBuf::from)
        .ok_or_else(|| format!("no snapshot given: pass --snapshot or set {SNAPSHOT_ENV}"))
}

fn load_conventions(path: Option<&str>) -> Result<RuntimeConventions, String> {
    let Some(path) = path else {
        return Ok(RuntimeConventions::default());
    };
    let json = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read conventions {path}: {e}"))?;
    let conventions = facet_json::from_str(&json)
        .map_err(|e| format!("invalid conventions {path}: {e}"))?;
    info!(path, "loaded runtime conventions");
    Ok(conventions)
}

fn options_from_cli(cli: &Cli) -> Result<DumpAsyncOptions, String> {
    let mode = match (cli.stats, cli.coalesce) {
        (true, true) => return Err("--stats and --coalesce are mutually exclusive".to_string()),
        (true, false) => RenderMode::Stats,
        (false, true) => RenderMode::Coalesced,
        (false, false) => RenderMode::FullStacks,
    };
    Ok(DumpAsyncOptions {
        mode,
        address: cli.address.as_deref().map(parse_hex).transpose()?,
        method_table: cli.mt.as_deref().map(parse_hex).transpose()?,
        type_substring: cli.type_filter.clone(),
        include_plain: cli.tasks,
        include_completed: cli.completed,
        show_fields: cli.fields,
    })
}

fn parse_hex(raw: &str) -> Result<u64, String> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .unwrap_or(raw);
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex address {raw:?}: {e}"))
}
