use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use setlist_overlay::{
    BatchManifest, DeliveryAdapter, DirectorySaver, ExportMode, ExportProgress, ExportRequest,
    ExportStage, Platform, SetlistOverlay,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "setlist-overlay", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply a manifest's overlays to every document and export the batch.
    Export(ExportArgs),
}

#[derive(Parser, Debug)]
struct ExportArgs {
    /// Batch manifest JSON.
    #[arg(long)]
    manifest: PathBuf,

    /// Output directory.
    #[arg(long)]
    out: PathBuf,

    #[arg(long, value_enum, default_value_t = ModeChoice::Pdf)]
    mode: ModeChoice,

    /// Prepend a cover page with title, date and song list (PDF only).
    #[arg(long)]
    cover: bool,

    /// Font file for overlay text; the system font is used otherwise.
    #[arg(long)]
    font: Option<PathBuf>,

    /// User agent of the receiving device; handsets get review-then-save delivery.
    #[arg(long)]
    user_agent: Option<String>,

    /// JSONL timing log.
    #[arg(long)]
    perf_log: Option<PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeChoice {
    Pdf,
    Images,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("setlist_overlay=info")),
        )
        .init();

    match Cli::parse().cmd {
        Command::Export(args) => export(args).await,
    }
}

async fn export(args: ExportArgs) -> anyhow::Result<()> {
    let mut builder = SetlistOverlay::builder();
    if let Some(font) = &args.font {
        builder = builder.register_font_file(font);
    }
    if let Some(path) = &args.perf_log {
        builder = builder.perf_log(path);
    }
    let engine = builder.build().context("configure overlay engine")?;

    let manifest = BatchManifest::load(&args.manifest)
        .await
        .with_context(|| format!("read manifest {}", args.manifest.display()))?;

    let outcome = engine
        .run_manifest(&manifest)
        .await
        .context("apply manifest overlays")?;
    if outcome.is_empty() {
        println!(
            "nothing to export: none of the {} document(s) carries a song form",
            manifest.documents.len()
        );
        return Ok(());
    }

    let mode = match args.mode {
        ModeChoice::Pdf => ExportMode::Pdf {
            cover_page: args.cover,
        },
        ModeChoice::Images => ExportMode::Images,
    };
    let request = ExportRequest {
        outcome,
        metadata: manifest.metadata.clone(),
        mode,
    };
    let report = engine
        .export(&request, &mut |p: &ExportProgress| match p.stage {
            ExportStage::Page { page, pages } => {
                tracing::debug!(item = %p.item_label, page, pages, "page written")
            }
            stage => tracing::info!(current = p.current, total = p.total, item = %p.item_label, ?stage, "export progress"),
        })
        .await;
    for failure in &report.failures {
        eprintln!("failed: {} ({})", failure.item_label, failure.error);
    }
    if report.artifacts.is_empty() {
        anyhow::bail!("nothing exported ({} of {} documents failed)", report.failures.len(), report.attempted);
    }

    let platform = args
        .user_agent
        .as_deref()
        .map(Platform::from_user_agent)
        .unwrap_or(Platform::Unrestricted);
    let mut delivery = DeliveryAdapter::new(platform, Arc::new(DirectorySaver::new(&args.out)));
    let mut summary = delivery.deliver(report.artifacts).await;
    if platform == Platform::Restricted {
        for item in delivery.review_items() {
            println!("ready: {}", item.artifact.file_name);
        }
        summary = delivery.save_all().await;
    }
    if let Some(perf) = engine.perf() {
        perf.flush();
    }

    println!(
        "exported {}/{} documents, saved {} file(s) to {}",
        report.succeeded,
        report.attempted,
        summary.delivered,
        args.out.display()
    );
    if summary.failed > 0 {
        anyhow::bail!("{} file(s) could not be saved", summary.failed);
    }
    Ok(())
}
