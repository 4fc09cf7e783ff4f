use clap::{ArgAction, Args, Parser, Subcommand};
use color_eyre::eyre::{eyre, Context, Result};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;
use fpmm_data::store::project;
use fpmm_data::{SqliteStore, TradeFilter, TradeStore, TradeType};
use fpmm_decode::TradeDecoder;
use fpmm_ingest::config::RPC_URLS_ENV;
use fpmm_ingest::{
    default_repair_fields, enrich_timestamps, repair_incomplete, run_ingest, FetchScheduler,
    IngestConfig, IngestOptions, IngestReport, ProviderPool,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone)]
struct AppContext {
    db_path: String,
    config: IngestConfig,
}

#[derive(Parser, Debug)]
#[command(name = "fpmm-trades")]
#[command(about = "Reconstruct FPMM prediction-market trades from transaction receipts")]
#[command(version)]
struct Cli {
    #[arg(long, short = 'v', action = ArgAction::Count, global = true)]
    verbose: u8,

    #[arg(long, short = 'q', global = true)]
    quiet: bool,

    #[arg(long, global = true, default_value = "data/fpmm.sqlite")]
    db_path: String,

    /// YAML ingestion config. Flags below override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON-RPC endpoint; repeat for several providers.
    #[arg(long = "rpc-url", global = true)]
    rpc_urls: Vec<String>,

    #[arg(long, global = true)]
    workers: Option<usize>,

    #[arg(long, global = true)]
    pacing_ms: Option<u64>,

    #[arg(long, global = true)]
    max_attempts: Option<u32>,

    #[arg(long, global = true)]
    batch_size: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Fetch, decode and store the trades of a list of transactions.
    Ingest(IngestArgs),
    /// Reprocess stored records that are missing fields.
    Repair(RepairArgs),
    /// Add block timestamps to stored records.
    Timestamps(TimestampsArgs),
    Status,
    /// Decode one transaction and print its records without storing them.
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// File with one transaction hash per line.
    #[arg(long, conflicts_with = "hash")]
    hashes_file: Option<PathBuf>,

    #[arg(long)]
    hash: Vec<String>,

    /// Skip hashes that already have a stored record.
    #[arg(long)]
    skip_known: bool,
}

#[derive(Args, Debug)]
struct RepairArgs {
    #[arg(long, default_value = "buy")]
    collection: TradeType,

    /// Field whose absence marks a record as incomplete. Defaults depend on the collection.
    #[arg(long = "field")]
    fields: Vec<String>,
}

#[derive(Args, Debug)]
struct TimestampsArgs {
    #[arg(long)]
    collection: TradeType,
}

#[derive(Args, Debug)]
struct InspectArgs {
    #[arg(long)]
    hash: String,

    /// Only print these document fields.
    #[arg(long = "field")]
    fields: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet)?;

    let config = load_config(&cli)?;
    let ctx = AppContext {
        db_path: cli.db_path,
        config,
    };

    match cli.command {
        Commands::Ingest(args) => handle_ingest(&ctx, args).await,
        Commands::Repair(args) => handle_repair(&ctx, args).await,
        Commands::Timestamps(args) => handle_timestamps(&ctx, args).await,
        Commands::Status => handle_status(&ctx),
        Commands::Inspect(args) => handle_inspect(&ctx, args).await,
    }
}

fn init_tracing(verbose: u8, quiet: bool) -> Result<()> {
    let level = if quiet {
        Level::WARN
    } else {
        match verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level.as_str()))
        .wrap_err("failed to initialize tracing filter")?;

    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

/// Config file, then flags, then `FPMM_RPC_URLS` when no provider was given.
fn load_config(cli: &Cli) -> Result<IngestConfig> {
    let mut config = match &cli.config {
        Some(path) => IngestConfig::from_yaml_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?,
        None => IngestConfig::default(),
    };

    for url in &cli.rpc_urls {
        config.add_providers(url);
    }
    if config.providers.is_empty() {
        if let Ok(list) = std::env::var(RPC_URLS_ENV) {
            config.add_providers(&list);
        }
    }

    if let Some(workers) = cli.workers {
        config.workers = Some(workers);
    }
    if let Some(pacing_ms) = cli.pacing_ms {
        config.pacing_ms = pacing_ms;
    }
    if let Some(max_attempts) = cli.max_attempts {
        config.max_attempts = max_attempts;
    }
    if let Some(batch_size) = cli.batch_size {
        config.batch_size = batch_size;
    }
    Ok(config)
}

fn open_store(ctx: &AppContext) -> Result<SqliteStore> {
    if ctx.db_path != ":memory:" {
        if let Some(parent) = Path::new(&ctx.db_path).parent() {
            if !parent.as_os_str().is_empty() {
                ensure_dir(parent)?;
            }
        }
    }
    SqliteStore::new(&ctx.db_path).wrap_err("failed to open SQLite store")
}

fn build_pool(config: &IngestConfig) -> Result<Arc<ProviderPool>> {
    config
        .validate()
        .wrap_err_with(|| format!("invalid ingestion config (providers come from --rpc-url or {RPC_URLS_ENV})"))?;
    let pool = ProviderPool::from_endpoints(&config.providers, config.pacing(), config.request_timeout())
        .wrap_err("failed to build RPC provider pool")?;
    Ok(Arc::new(pool))
}

fn build_scheduler(config: &IngestConfig, progress: bool) -> Result<FetchScheduler> {
    let pool = build_pool(config)?;
    let decoder = TradeDecoder::new(config.decoder_config()?);
    Ok(
        FetchScheduler::new(pool, decoder, config.retry_policy(), config.dispatch_policy())
            .with_progress(progress),
    )
}

/// Cancels the returned token on Ctrl-C.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("interrupt received, finishing in-flight work");
                token.cancel();
            }
            Err(e) => tracing::error!("failed to listen for interrupt: {}", e),
        }
    });
    cancel
}

fn read_hashes(args: &IngestArgs) -> Result<Vec<String>> {
    match &args.hashes_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            Ok(content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_string)
                .collect())
        }
        None => Ok(args.hash.clone()),
    }
}

async fn handle_ingest(ctx: &AppContext, args: IngestArgs) -> Result<()> {
    let hashes = read_hashes(&args)?;
    if hashes.is_empty() {
        return Err(eyre!("no transaction hashes given (use --hashes-file or --hash)"));
    }

    let store = open_store(ctx)?;
    let scheduler = build_scheduler(&ctx.config, true)?;
    let options = IngestOptions {
        skip_known: args.skip_known,
        batch_size: ctx.config.batch_size,
    };

    let report = run_ingest(&scheduler, &store, hashes, options, cancel_on_interrupt())
        .await
        .wrap_err("ingest failed")?;

    print_report(&report);
    info!(db_path = %ctx.db_path, "ingest command finished");
    Ok(())
}

async fn handle_repair(ctx: &AppContext, args: RepairArgs) -> Result<()> {
    let fields = if args.fields.is_empty() {
        default_repair_fields(args.collection)
    } else {
        args.fields
    };

    let store = open_store(ctx)?;
    let scheduler = build_scheduler(&ctx.config, true)?;
    let report = repair_incomplete(
        &scheduler,
        &store,
        args.collection,
        &fields,
        ctx.config.batch_size,
        cancel_on_interrupt(),
    )
    .await
    .wrap_err("repair failed")?;

    print_report(&report);
    info!(collection = args.collection.collection(), "repair command finished");
    Ok(())
}

async fn handle_timestamps(ctx: &AppContext, args: TimestampsArgs) -> Result<()> {
    let store = open_store(ctx)?;
    let pool = build_pool(&ctx.config)?;

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.green} {msg}")
            .wrap_err("failed to create progress style")?,
    );
    pb.set_message(format!("fetching block timestamps for {}", args.collection.collection()));
    pb.enable_steady_tick(std::time::Duration::from_millis(100));

    let report = enrich_timestamps(
        pool,
        &store,
        args.collection,
        ctx.config.retry_policy(),
        ctx.config.batch_size,
        cancel_on_interrupt(),
    )
    .await
    .wrap_err("timestamp enrichment failed")?;
    pb.finish_and_clear();

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Collection", args.collection.collection()]);
    table.add_row(vec!["Records without timestamp", &report.documents.to_string()]);
    table.add_row(vec!["Distinct blocks", &report.blocks.to_string()]);
    table.add_row(vec!["Blocks fetched", &report.fetched.to_string()]);
    table.add_row(vec!["Blocks failed", &report.failed_blocks.len().to_string()]);
    table.add_row(vec!["Blocks abandoned", &report.abandoned_blocks.len().to_string()]);
    table.add_row(vec!["Records updated", &report.updated.to_string()]);
    println!("\n{}\n", table);

    for (block, message) in report.failed_blocks.iter().take(20) {
        warn!(block, error = %message, "block timestamp missing");
    }
    Ok(())
}

fn handle_status(ctx: &AppContext) -> Result<()> {
    let store = open_store(ctx)?;

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Collection", "Records", "Missing timestamp"]);

    let missing_timestamp = TradeFilter {
        missing_timestamp: true,
        ..TradeFilter::default()
    };
    let mut total = 0;
    for trade_type in TradeType::ALL {
        let count = store
            .count(trade_type)
            .wrap_err_with(|| format!("failed to count {}", trade_type.collection()))?;
        let missing = store
            .find(trade_type, &missing_timestamp)
            .wrap_err_with(|| format!("failed to query {}", trade_type.collection()))?
            .len();
        total += count;
        table.add_row(vec![
            trade_type.collection().to_string(),
            count.to_string(),
            missing.to_string(),
        ]);
    }

    let unique = store
        .known_hashes()
        .wrap_err("failed to query transaction hashes")?
        .len();

    println!("\n{}\n", table);
    println!("Database: {}", ctx.db_path);
    println!("Unique transactions: {unique}");

    info!(records = total, unique_transactions = unique, "status command finished");
    Ok(())
}

async fn handle_inspect(ctx: &AppContext, args: InspectArgs) -> Result<()> {
    let scheduler = build_scheduler(&ctx.config, false)?;
    let hashes = fpmm_ingest::prepare_hashes([args.hash.as_str()]);
    let report = scheduler.run(hashes.clone(), cancel_on_interrupt()).await;

    let keep: Vec<&str> = args.fields.iter().map(String::as_str).collect();
    for record in report.records_in_order(&hashes) {
        let document = record.to_document();
        let document = if keep.is_empty() {
            document
        } else {
            project(&document, &keep)
        };
        let rendered =
            serde_json::to_string_pretty(&document).wrap_err("failed to render document")?;
        println!("{rendered}");
    }

    for failure in &report.failures {
        warn!(
            tx_hash = %failure.transaction_hash,
            tag = failure.tag,
            log_index = ?failure.log_index,
            error = %failure.message,
            "inspect diagnostic"
        );
    }
    Ok(())
}

fn print_report(report: &IngestReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Metric", "Value"]);
    table.add_row(vec!["Hashes requested", &report.requested.to_string()]);
    table.add_row(vec!["Skipped (already stored)", &report.skipped_known.to_string()]);
    table.add_row(vec!["Processed", &report.processed.to_string()]);
    table.add_row(vec!["Abandoned", &report.abandoned.to_string()]);
    table.add_row(vec!["Not dispatched", &report.not_dispatched.to_string()]);
    table.add_row(vec!["Trade records", &report.records.to_string()]);
    table.add_row(vec!["Inserted", &report.sink.inserted.to_string()]);
    table.add_row(vec!["Modified", &report.sink.modified.to_string()]);
    table.add_row(vec!["Failed writes", &report.sink.failed_records.len().to_string()]);
    table.add_row(vec!["Failed batches", &report.sink.batch_errors.len().to_string()]);
    table.add_row(vec!["Failures", &report.failures.len().to_string()]);
    println!("\n{}\n", table);

    for failure in &report.failures {
        warn!(
            tx_hash = %failure.transaction_hash,
            tag = failure.tag,
            log_index = ?failure.log_index,
            error = %failure.message,
            "failed hash"
        );
    }
    if report.cancelled {
        warn!("run was interrupted; rerun to pick up the remaining hashes");
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path)
        .wrap_err_with(|| format!("failed to create data directory {}", path.display()))?;
    Ok(())
}
