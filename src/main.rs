use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use tracing::{error, info, warn};

mod config;
mod llm;
mod state;
mod studio;
mod utils;

use config::CONFIG;
use llm::{read_upload, GeminiImageClient};
use studio::slot::{SlotStatus, ThemeSlot};
use studio::{
    export_all, BatchOrchestrator, BatchSummary, DispatchPolicy, ImageGenerator, PromptTable,
    QualityMode, RetryTarget,
};
use utils::logging::init_logging;

#[derive(Debug, Parser)]
#[command(name = "phantom_studio", about = "Render one portrait in six themed styles")]
struct Cli {
    /// Portrait to render (PNG, JPEG, WebP or HEIC).
    image: PathBuf,

    /// Output directory; defaults to STUDIO_OUTPUT_DIR.
    #[arg(long)]
    out: Option<PathBuf>,

    #[arg(long, default_value = "standard")]
    quality: QualityMode,

    /// Overrides STUDIO_DISPATCH_POLICY.
    #[arg(long)]
    dispatch: Option<DispatchPolicy>,

    /// Re-run in high-quality mode with the personal key when quota runs out.
    #[arg(long)]
    upgrade_on_quota: bool,

    /// Personal API key to switch to when quota runs out. Implies --upgrade-on-quota.
    #[arg(long, value_name = "KEY")]
    personal_key: Option<String>,

    /// Retry each failed slot once before exporting.
    #[arg(long)]
    retry_failed: bool,
}

/// Drains the current batch.
///
/// On Ctrl-C the batch is cancelled and the slots that had already settled
/// are returned, since cancelling empties the orchestrator's slot list.
async fn run_until_settled(orchestrator: &mut BatchOrchestrator) -> Option<Vec<ThemeSlot>> {
    loop {
        tokio::select! {
            event = orchestrator.next_event() => {
                let Some(event) = event else {
                    return None;
                };
                match (event.status, event.error_kind) {
                    (SlotStatus::Failed, Some(kind)) => warn!(
                        token = %event.token,
                        index = event.index,
                        slot = %event.slot_id,
                        theme = event.theme.label(),
                        kind = kind.code(),
                        "{}",
                        kind.guidance()
                    ),
                    _ => info!(
                        token = %event.token,
                        index = event.index,
                        slot = %event.slot_id,
                        theme = event.theme.label(),
                        status = event.status.as_str(),
                        "Slot settled"
                    ),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let finished = orchestrator.interrupt();
                warn!("Interrupted; exporting {} finished rendering(s)", finished.len());
                return Some(finished);
            }
        }
    }
}

fn log_summary(orchestrator: &BatchOrchestrator, summary: &BatchSummary) {
    info!(
        "Batch {} finished in {} mode: done={} failed={} pending={} stale_discarded={}",
        orchestrator.current_token(),
        orchestrator.quality(),
        summary.done,
        summary.failed,
        summary.pending,
        orchestrator.stale_discarded()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let _guards = init_logging(&CONFIG.log_level, Path::new("logs"));
    let cli = Cli::parse();

    let (bytes, mime_type) = read_upload(&cli.image).await?;
    info!("Loaded {} ({} bytes)", cli.image.display(), bytes.len());

    let client = Arc::new(GeminiImageClient::from_config(&CONFIG));
    let generator: Arc<dyn ImageGenerator> = client.clone();

    let mut prompts = PromptTable::builtin();
    if let Some(path) = CONFIG.studio_prompts_path.as_deref() {
        prompts = prompts.with_overrides_from_path(path);
    }

    let mut settings = CONFIG.studio_settings();
    if let Some(dispatch) = cli.dispatch {
        settings.dispatch = dispatch;
    }

    let mut orchestrator = BatchOrchestrator::new(generator, prompts, settings);
    orchestrator.start_batch_from_bytes(bytes, &mime_type, cli.quality)?;
    let mut interrupted = run_until_settled(&mut orchestrator).await;

    let upgrade_allowed = cli.upgrade_on_quota || cli.personal_key.is_some();
    if interrupted.is_none() && upgrade_allowed && orchestrator.summary().suggests_upgrade() {
        if let Some(key) = cli.personal_key.as_deref() {
            if !client.select_personal_key(key) {
                warn!("Ignoring blank --personal-key");
            }
        }
        if client.has_personal_key() {
            orchestrator.credential_changed()?;
            interrupted = run_until_settled(&mut orchestrator).await;
        } else {
            warn!("Quota exhausted and no personal key is available; skipping upgrade");
        }
    }

    if interrupted.is_none() && cli.retry_failed {
        let failed: Vec<_> = orchestrator
            .slots()
            .iter()
            .filter(|slot| slot.status() == SlotStatus::Failed)
            .map(|slot| slot.id())
            .collect();
        for slot_id in failed {
            if let Err(err) = orchestrator.retry(RetryTarget::Slot(slot_id), None) {
                error!("Retry failed to start: {}", err);
            }
        }
        interrupted = run_until_settled(&mut orchestrator).await;
    }

    let out_dir = cli.out.unwrap_or_else(|| CONFIG.studio_output_dir.clone());
    let slots = match &interrupted {
        Some(finished) => finished.as_slice(),
        None => {
            log_summary(&orchestrator, &orchestrator.summary());
            orchestrator.slots()
        }
    };
    let written = export_all(slots, &out_dir, CONFIG.export_stagger()).await?;
    info!("Exported {} file(s) to {}", written.len(), out_dir.display());

    Ok(())
}
