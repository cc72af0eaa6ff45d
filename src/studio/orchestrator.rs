//! Fan-out of one portrait into six themed renderings.
//!
//! Remote calls run as independent tasks and report into a single channel;
//! only the orchestrator mutates the slot list, one update at a time. Each
//! update carries the [`BatchToken`] it was issued under and is dropped if
//! the batch has since been cancelled or restarted.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::llm::media::SourceImage;
use crate::state::{ApplyOutcome, BatchState, BatchToken, SlotUpdate};
use crate::studio::error::{GenerationError, GenerationErrorKind, StudioError};
use crate::studio::generator::{GenerationRequest, ImageGenerator, QualityMode};
use crate::studio::slot::{SlotId, SlotStatus, ThemeSlot};
use crate::studio::theme::{PromptTable, Theme};
use crate::utils::timing::BatchTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchPolicy {
    /// One request at a time with a pause between them.
    #[default]
    Serial,
    /// All requests at once.
    Parallel,
}

impl DispatchPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchPolicy::Serial => "serial",
            DispatchPolicy::Parallel => "parallel",
        }
    }
}

impl fmt::Display for DispatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DispatchPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "serial" | "sequential" => Ok(DispatchPolicy::Serial),
            "parallel" | "concurrent" => Ok(DispatchPolicy::Parallel),
            other => Err(format!("unknown dispatch policy '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StudioSettings {
    pub dispatch: DispatchPolicy,
    /// Gap between consecutive requests under serial dispatch.
    pub pacing: Duration,
    pub request_timeout: Duration,
}

impl Default for StudioSettings {
    fn default() -> Self {
        Self {
            dispatch: DispatchPolicy::Serial,
            pacing: Duration::from_millis(4500),
            request_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryTarget {
    All,
    Slot(SlotId),
}

/// A slot that just settled.
#[derive(Debug, Clone)]
pub struct SlotEvent {
    pub token: BatchToken,
    pub index: usize,
    pub slot_id: SlotId,
    pub theme: Theme,
    pub status: SlotStatus,
    pub error_kind: Option<GenerationErrorKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub pending: usize,
    pub done: usize,
    pub failed: usize,
    pub failures: Vec<(Theme, GenerationErrorKind)>,
}

impl BatchSummary {
    pub fn suggests_upgrade(&self) -> bool {
        self.failures.iter().any(|(_, kind)| kind.suggests_upgrade())
    }
}

#[derive(Debug, Clone, Copy)]
struct Job {
    index: usize,
    slot_id: SlotId,
    theme: Theme,
}

/// Everything a task needs to run one job and report back.
#[derive(Clone)]
struct Dispatch {
    generator: Arc<dyn ImageGenerator>,
    prompts: Arc<PromptTable>,
    source: Arc<SourceImage>,
    quality: QualityMode,
    token: BatchToken,
    timeout: Duration,
    updates: mpsc::UnboundedSender<SlotUpdate>,
}

impl Dispatch {
    async fn run(&self, job: Job) {
        let request = GenerationRequest {
            theme: job.theme,
            prompt: self.prompts.render(job.theme),
            source: Arc::clone(&self.source),
            quality: self.quality,
        };

        debug!(
            token = %self.token,
            theme = %job.theme,
            quality = %self.quality,
            "Issuing generation request"
        );
        let outcome = match tokio::time::timeout(self.timeout, self.generator.generate(request)).await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(GenerationError::new(
                GenerationErrorKind::TimedOut,
                format!("no response after {}s", self.timeout.as_secs_f32()),
            )),
        };

        let update = SlotUpdate {
            token: self.token,
            slot_id: job.slot_id,
            index: job.index,
            outcome,
        };
        if self.updates.send(update).is_err() {
            debug!(token = %self.token, theme = %job.theme, "Orchestrator gone; dropping result");
        }
    }
}

/// Runs queued single-slot retries one at a time, at least `pacing` apart.
///
/// Retries whose batch was superseded while queued are skipped.
async fn run_serial_retries(
    mut queue: mpsc::UnboundedReceiver<(Dispatch, Job)>,
    epoch_rx: watch::Receiver<BatchToken>,
    pacing: Duration,
) {
    let mut last_issued: Option<Instant> = None;
    while let Some((dispatch, job)) = queue.recv().await {
        if let Some(last) = last_issued {
            tokio::time::sleep_until(last + pacing).await;
        }
        let current = *epoch_rx.borrow();
        if current != dispatch.token {
            debug!(token = %dispatch.token, theme = %job.theme, "Skipping retry of a superseded batch");
            continue;
        }
        last_issued = Some(Instant::now());
        dispatch.run(job).await;
    }
}

pub struct BatchOrchestrator {
    generator: Arc<dyn ImageGenerator>,
    prompts: Arc<PromptTable>,
    settings: StudioSettings,
    state: BatchState,
    epoch_tx: watch::Sender<BatchToken>,
    updates_tx: mpsc::UnboundedSender<SlotUpdate>,
    updates_rx: mpsc::UnboundedReceiver<SlotUpdate>,
    source: Option<Arc<SourceImage>>,
    quality: QualityMode,
    timer: Option<BatchTimer>,
    retry_queue: Option<mpsc::UnboundedSender<(Dispatch, Job)>>,
    stale_discarded: usize,
}

impl BatchOrchestrator {
    pub fn new(
        generator: Arc<dyn ImageGenerator>,
        prompts: PromptTable,
        settings: StudioSettings,
    ) -> Self {
        let state = BatchState::new();
        let (epoch_tx, _) = watch::channel(state.token());
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();
        Self {
            generator,
            prompts: Arc::new(prompts),
            settings,
            state,
            epoch_tx,
            updates_tx,
            updates_rx,
            source: None,
            quality: QualityMode::Standard,
            timer: None,
            retry_queue: None,
            stale_discarded: 0,
        }
    }

    pub fn slots(&self) -> &[ThemeSlot] {
        self.state.slots()
    }

    pub fn current_token(&self) -> BatchToken {
        self.state.token()
    }

    pub fn quality(&self) -> QualityMode {
        self.quality
    }

    /// True when no slot of the current batch is waiting on a remote call.
    pub fn is_settled(&self) -> bool {
        self.state.pending_count() == 0
    }

    /// Completions received but discarded because their batch or slot was superseded.
    pub fn stale_discarded(&self) -> usize {
        self.stale_discarded
    }

    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();
        for slot in self.state.slots() {
            match slot.status() {
                SlotStatus::Pending => summary.pending += 1,
                SlotStatus::Done => summary.done += 1,
                SlotStatus::Failed => {
                    summary.failed += 1;
                    if let Some(err) = slot.error() {
                        summary.failures.push((slot.theme(), err.kind));
                    }
                }
            }
        }
        summary
    }

    /// Starts a fresh batch for `source`, superseding any batch in flight.
    pub fn start_batch(&mut self, source: SourceImage, quality: QualityMode) -> BatchToken {
        self.launch(Arc::new(source), quality)
    }

    /// Validates raw upload bytes, then starts a batch.
    pub fn start_batch_from_bytes(
        &mut self,
        bytes: Vec<u8>,
        mime_type: &str,
        quality: QualityMode,
    ) -> Result<BatchToken, StudioError> {
        let source = SourceImage::from_bytes(bytes, Some(mime_type))?;
        Ok(self.start_batch(source, quality))
    }

    /// Invalidates every in-flight completion and empties the slot list.
    ///
    /// Requests already sent are not aborted; their results are dropped on arrival.
    /// The cached source image is kept so the batch can be re-run.
    pub fn cancel_batch(&mut self) -> BatchToken {
        let pending = self.state.pending_count();
        if let Some(mut timer) = self.timer.take() {
            let summary = self.summary();
            timer.complete("cancelled", summary.done, summary.failed);
        }
        let token = self.state.clear();
        self.epoch_tx.send_replace(token);
        info!(token = %token, abandoned = pending, "Batch cancelled");
        token
    }

    /// Folds in completions that already arrived, then cancels the batch.
    ///
    /// Returns the slots that had settled, so finished renderings survive the
    /// cancellation.
    pub fn interrupt(&mut self) -> Vec<ThemeSlot> {
        self.drain_ready();
        let settled: Vec<ThemeSlot> = self
            .state
            .slots()
            .iter()
            .filter(|slot| !slot.is_pending())
            .cloned()
            .collect();
        self.cancel_batch();
        settled
    }

    /// Re-runs the whole batch or one settled slot using the cached source image.
    ///
    /// `quality` overrides the session's mode; `None` keeps it.
    pub fn retry(
        &mut self,
        target: RetryTarget,
        quality: Option<QualityMode>,
    ) -> Result<BatchToken, StudioError> {
        let source = self.source.clone().ok_or(StudioError::NoSourceImage)?;
        let quality = quality.unwrap_or(self.quality);

        match target {
            RetryTarget::All => Ok(self.launch(source, quality)),
            RetryTarget::Slot(slot_id) => {
                let index = self
                    .state
                    .position(slot_id)
                    .ok_or(StudioError::UnknownSlot(slot_id))?;
                let slot = self
                    .state
                    .renew(index)
                    .ok_or(StudioError::SlotPending(slot_id))?;
                let job = Job {
                    index,
                    slot_id: slot.id(),
                    theme: slot.theme(),
                };
                let token = self.state.token();
                info!(
                    token = %token,
                    theme = %job.theme,
                    quality = %quality,
                    dispatch = %self.settings.dispatch,
                    "Retrying single slot"
                );
                if self.timer.is_none() {
                    self.timer = Some(BatchTimer::start(
                        "retry",
                        token,
                        quality.as_str(),
                        self.settings.dispatch.as_str(),
                    ));
                }
                let dispatch = self.dispatch_for(token, source, quality);
                match self.settings.dispatch {
                    DispatchPolicy::Parallel => {
                        tokio::spawn(async move { dispatch.run(job).await });
                    }
                    DispatchPolicy::Serial => self.enqueue_serial_retry(dispatch, job),
                }
                Ok(token)
            }
        }
    }

    /// The host selected a new credential: re-run everything in high-quality mode.
    pub fn credential_changed(&mut self) -> Result<BatchToken, StudioError> {
        info!("Credential changed; re-running batch in high-quality mode");
        self.retry(RetryTarget::All, Some(QualityMode::HighQuality))
    }

    /// Waits for the next completion of the current batch and applies it.
    ///
    /// Stale completions are skipped. Returns `None` once nothing is pending.
    pub async fn next_event(&mut self) -> Option<SlotEvent> {
        loop {
            if self.is_settled() {
                return None;
            }
            let update = self.updates_rx.recv().await?;
            if let Some(event) = self.apply(update) {
                return Some(event);
            }
        }
    }

    /// Applies every completion that has already arrived, without waiting.
    pub fn drain_ready(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(update) = self.updates_rx.try_recv() {
            if self.apply(update).is_some() {
                applied += 1;
            }
        }
        applied
    }

    #[allow(dead_code)]
    pub async fn wait_for_completion(&mut self) -> Vec<SlotEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    fn launch(&mut self, source: Arc<SourceImage>, quality: QualityMode) -> BatchToken {
        if let Some(mut timer) = self.timer.take() {
            let summary = self.summary();
            timer.complete("superseded", summary.done, summary.failed);
        }

        let token = self.state.begin(&Theme::ALL);
        self.epoch_tx.send_replace(token);
        self.source = Some(Arc::clone(&source));
        self.quality = quality;
        self.timer = Some(BatchTimer::start(
            "batch",
            token,
            quality.as_str(),
            self.settings.dispatch.as_str(),
        ));

        let (width, height) = source.dimensions().unwrap_or_default();
        info!(
            token = %token,
            quality = %quality,
            dispatch = %self.settings.dispatch,
            mime_type = source.mime_type(),
            bytes = source.bytes().len(),
            width,
            height,
            "Batch started"
        );

        let jobs: Vec<Job> = self
            .state
            .slots()
            .iter()
            .enumerate()
            .map(|(index, slot)| Job {
                index,
                slot_id: slot.id(),
                theme: slot.theme(),
            })
            .collect();
        let dispatch = self.dispatch_for(token, source, quality);

        match self.settings.dispatch {
            DispatchPolicy::Parallel => {
                for job in jobs {
                    let dispatch = dispatch.clone();
                    tokio::spawn(async move { dispatch.run(job).await });
                }
            }
            DispatchPolicy::Serial => {
                let pacing = self.settings.pacing;
                let mut epoch_rx = self.epoch_tx.subscribe();
                tokio::spawn(async move {
                    for (position, job) in jobs.into_iter().enumerate() {
                        if position > 0 {
                            tokio::time::sleep(pacing).await;
                        }
                        let current = *epoch_rx.borrow_and_update();
                        if current != dispatch.token {
                            debug!(
                                token = %dispatch.token,
                                remaining = Theme::ALL.len() - position,
                                "Batch superseded; serial dispatch stopped"
                            );
                            return;
                        }
                        dispatch.run(job).await;
                    }
                });
            }
        }

        token
    }

    fn enqueue_serial_retry(&mut self, dispatch: Dispatch, job: Job) {
        let queued = match &self.retry_queue {
            Some(queue) => match queue.send((dispatch, job)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(queued)) => queued,
            },
            None => (dispatch, job),
        };

        let (queue, pending) = mpsc::unbounded_channel();
        tokio::spawn(run_serial_retries(
            pending,
            self.epoch_tx.subscribe(),
            self.settings.pacing,
        ));
        if queue.send(queued).is_err() {
            warn!("Retry queue closed before the first job was queued");
        }
        self.retry_queue = Some(queue);
    }

    #[cfg(test)]
    fn timing_scope(&self) -> Option<&'static str> {
        self.timer.as_ref().map(|timer| timer.scope())
    }

    fn dispatch_for(
        &self,
        token: BatchToken,
        source: Arc<SourceImage>,
        quality: QualityMode,
    ) -> Dispatch {
        Dispatch {
            generator: Arc::clone(&self.generator),
            prompts: Arc::clone(&self.prompts),
            source,
            quality,
            token,
            timeout: self.settings.request_timeout,
            updates: self.updates_tx.clone(),
        }
    }

    fn apply(&mut self, update: SlotUpdate) -> Option<SlotEvent> {
        let token = update.token;
        let slot_id = update.slot_id;
        let index = update.index;

        match self.state.apply(update) {
            ApplyOutcome::Applied => {}
            ApplyOutcome::StaleEpoch => {
                self.stale_discarded += 1;
                debug!(
                    token = %token,
                    current = %self.state.token(),
                    index,
                    "Discarded completion from a superseded batch"
                );
                return None;
            }
            ApplyOutcome::StaleSlot => {
                self.stale_discarded += 1;
                debug!(token = %token, index, slot = %slot_id, "Discarded completion for a replaced slot");
                return None;
            }
        }

        let slot = &self.state.slots()[index];
        let error_kind = slot.error().map(|err| err.kind);
        match slot.error() {
            Some(err) => warn!(
                token = %token,
                theme = %slot.theme(),
                kind = %err.kind,
                "Slot failed: {}",
                err.detail
            ),
            None => info!(token = %token, theme = %slot.theme(), "Slot rendered"),
        }
        let event = SlotEvent {
            token,
            index,
            slot_id,
            theme: slot.theme(),
            status: slot.status(),
            error_kind,
        };

        if self.is_settled() {
            if let Some(mut timer) = self.timer.take() {
                let summary = self.summary();
                let status = if summary.failed == 0 { "success" } else { "partial" };
                timer.complete(status, summary.done, summary.failed);
            }
        }

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::media::{sample_jpeg, GeneratedImage};
    use crate::studio::export::export_all;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::Semaphore;
    use tokio::time::Instant;

    enum Scripted {
        Succeed,
        Fail(GenerationErrorKind),
        Hang,
    }

    type Script = Box<dyn Fn(&GenerationRequest) -> Scripted + Send + Sync>;

    #[derive(Debug, Clone)]
    struct Call {
        theme: Theme,
        quality: QualityMode,
        source_len: usize,
        at: Instant,
    }

    struct ScriptedGenerator {
        script: Script,
        gate: Option<Arc<Semaphore>>,
        calls: Mutex<Vec<Call>>,
    }

    impl ScriptedGenerator {
        fn new(script: impl Fn(&GenerationRequest) -> Scripted + Send + Sync + 'static) -> Self {
            Self {
                script: Box::new(script),
                gate: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn succeeding() -> Self {
            Self::new(|_| Scripted::Succeed)
        }

        fn gated(gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::succeeding()
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    /// Payload identifies theme and quality so cross-assignment is detectable.
    fn payload_for(theme: Theme, quality: QualityMode) -> Vec<u8> {
        vec![theme.index() as u8, quality as u8, 0xAB]
    }

    #[async_trait]
    impl ImageGenerator for ScriptedGenerator {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GeneratedImage, GenerationError> {
            self.calls.lock().push(Call {
                theme: request.theme,
                quality: request.quality,
                source_len: request.source.bytes().len(),
                at: Instant::now(),
            });
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate open").forget();
            }
            match (self.script)(&request) {
                Scripted::Succeed => Ok(GeneratedImage::new(
                    payload_for(request.theme, request.quality),
                    "image/png",
                )),
                Scripted::Fail(kind) => Err(GenerationError::new(kind, "scripted failure")),
                Scripted::Hang => std::future::pending().await,
            }
        }
    }

    fn source() -> SourceImage {
        SourceImage::from_bytes(sample_jpeg(128, 96), Some("image/jpeg")).expect("sample jpeg")
    }

    fn settings(dispatch: DispatchPolicy) -> StudioSettings {
        StudioSettings {
            dispatch,
            pacing: Duration::from_millis(4500),
            request_timeout: Duration::from_secs(120),
        }
    }

    fn orchestrator(
        generator: Arc<ScriptedGenerator>,
        dispatch: DispatchPolicy,
    ) -> BatchOrchestrator {
        BatchOrchestrator::new(generator, PromptTable::builtin(), settings(dispatch))
    }

    #[tokio::test]
    async fn start_batch_lays_out_six_pending_slots_in_theme_order() {
        let generator = Arc::new(ScriptedGenerator::gated(Arc::new(Semaphore::new(0))));
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);

        let token = orchestrator.start_batch(source(), QualityMode::Standard);

        assert_eq!(orchestrator.current_token(), token);
        let themes: Vec<Theme> = orchestrator.slots().iter().map(|slot| slot.theme()).collect();
        assert_eq!(themes, Theme::ALL.to_vec());
        assert!(orchestrator
            .slots()
            .iter()
            .all(|slot| slot.status() == SlotStatus::Pending));
    }

    #[tokio::test]
    async fn start_batch_from_bytes_rejects_bad_uploads_without_touching_state() {
        let generator = Arc::new(ScriptedGenerator::succeeding());
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);
        let before = orchestrator.current_token();

        let err = orchestrator
            .start_batch_from_bytes(Vec::new(), "image/jpeg", QualityMode::Standard)
            .unwrap_err();
        assert!(matches!(err, StudioError::EmptyImage));

        let err = orchestrator
            .start_batch_from_bytes(b"GIF89a".to_vec(), "image/gif", QualityMode::Standard)
            .unwrap_err();
        assert!(matches!(err, StudioError::UnsupportedMimeType(_)));

        assert_eq!(orchestrator.current_token(), before);
        assert!(orchestrator.slots().is_empty());
        assert!(matches!(
            orchestrator.retry(RetryTarget::All, None),
            Err(StudioError::NoSourceImage)
        ));
    }

    #[tokio::test]
    async fn every_theme_receives_its_own_image() {
        let generator = Arc::new(ScriptedGenerator::succeeding());
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Parallel);

        let jpeg = sample_jpeg(128, 96);
        let jpeg_len = jpeg.len();
        orchestrator
            .start_batch_from_bytes(jpeg, "image/jpeg", QualityMode::Standard)
            .expect("valid upload");
        let events = orchestrator.wait_for_completion().await;

        assert_eq!(events.len(), 6);
        for slot in orchestrator.slots() {
            assert_eq!(slot.status(), SlotStatus::Done);
            let image = slot.image().expect("image present");
            assert_eq!(image.bytes(), payload_for(slot.theme(), QualityMode::Standard));
        }
        assert!(generator.calls().iter().all(|call| call.source_len == jpeg_len));
        assert_eq!(orchestrator.summary().done, 6);
    }

    #[tokio::test]
    async fn one_failure_leaves_siblings_untouched() {
        let generator = Arc::new(ScriptedGenerator::new(|request| {
            if request.theme == Theme::BlackWhite {
                Scripted::Fail(GenerationErrorKind::ContentSafetyBlocked)
            } else {
                Scripted::Succeed
            }
        }));
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);

        orchestrator.start_batch(source(), QualityMode::Standard);
        orchestrator.wait_for_completion().await;

        let summary = orchestrator.summary();
        assert_eq!(summary.done, 5);
        assert_eq!(summary.failed, 1);
        assert_eq!(
            summary.failures,
            vec![(Theme::BlackWhite, GenerationErrorKind::ContentSafetyBlocked)]
        );
        assert!(!summary.suggests_upgrade());
    }

    #[tokio::test]
    async fn quota_failure_then_upgrade_reruns_with_cached_image_in_high_quality() {
        let generator = Arc::new(ScriptedGenerator::new(|request| {
            match (request.theme, request.quality) {
                (Theme::Magazine, QualityMode::Standard) => {
                    Scripted::Fail(GenerationErrorKind::QuotaExhausted)
                }
                _ => Scripted::Succeed,
            }
        }));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Parallel);

        let first = orchestrator.start_batch(source(), QualityMode::Standard);
        orchestrator.wait_for_completion().await;

        let summary = orchestrator.summary();
        assert_eq!(summary.done, 5);
        assert_eq!(
            summary.failures,
            vec![(Theme::Magazine, GenerationErrorKind::QuotaExhausted)]
        );
        assert!(summary.suggests_upgrade());

        let first_ids: Vec<SlotId> = orchestrator.slots().iter().map(|slot| slot.id()).collect();
        let second = orchestrator.credential_changed().expect("cached source");

        assert!(second > first);
        assert_eq!(orchestrator.quality(), QualityMode::HighQuality);
        assert_eq!(orchestrator.slots().len(), 6);
        for (slot, old_id) in orchestrator.slots().iter().zip(&first_ids) {
            assert_eq!(slot.status(), SlotStatus::Pending);
            assert_ne!(slot.id(), *old_id);
        }

        orchestrator.wait_for_completion().await;
        assert_eq!(orchestrator.summary().done, 6);

        let calls = generator.calls();
        assert_eq!(calls.len(), 12);
        let source_len = calls[0].source_len;
        assert!(calls.iter().all(|call| call.source_len == source_len));
        assert_eq!(
            calls
                .iter()
                .filter(|call| call.quality == QualityMode::HighQuality)
                .count(),
            6
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_batch_results_never_reach_the_slot_list() {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Arc::new(ScriptedGenerator::gated(gate.clone()));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Parallel);

        let first = orchestrator.start_batch(source(), QualityMode::Standard);
        while generator.calls().len() < 6 {
            tokio::task::yield_now().await;
        }

        let after_cancel = orchestrator.cancel_batch();
        assert!(after_cancel > first);
        assert!(orchestrator.slots().is_empty());

        gate.add_permits(6);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(orchestrator.drain_ready(), 0);
        assert_eq!(orchestrator.stale_discarded(), 6);
        assert!(orchestrator.slots().is_empty());
        assert!(orchestrator.next_event().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn late_results_of_old_batch_do_not_leak_into_new_batch() {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Arc::new(ScriptedGenerator::gated(gate.clone()));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Parallel);

        orchestrator.start_batch(source(), QualityMode::Standard);
        while generator.calls().len() < 6 {
            tokio::task::yield_now().await;
        }
        orchestrator.start_batch(source(), QualityMode::HighQuality);
        while generator.calls().len() < 12 {
            tokio::task::yield_now().await;
        }

        gate.add_permits(12);
        orchestrator.wait_for_completion().await;

        for slot in orchestrator.slots() {
            let image = slot.image().expect("rendered");
            assert_eq!(image.bytes(), payload_for(slot.theme(), QualityMode::HighQuality));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        orchestrator.drain_ready();
        assert_eq!(orchestrator.stale_discarded(), 6);
    }

    #[tokio::test]
    async fn cancel_without_batch_only_moves_the_token() {
        let generator = Arc::new(ScriptedGenerator::succeeding());
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Parallel);

        let before = orchestrator.current_token();
        let first = orchestrator.cancel_batch();
        let second = orchestrator.cancel_batch();

        assert_eq!(first.value(), before.value() + 1);
        assert_eq!(second.value(), first.value() + 1);
        assert!(orchestrator.slots().is_empty());
        assert!(generator.calls().is_empty());
        assert!(matches!(
            orchestrator.retry(RetryTarget::All, None),
            Err(StudioError::NoSourceImage)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn serial_dispatch_paces_requests_in_theme_order() {
        let generator = Arc::new(ScriptedGenerator::succeeding());
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Serial);

        orchestrator.start_batch(source(), QualityMode::Standard);
        let events = orchestrator.wait_for_completion().await;

        let order: Vec<Theme> = events.iter().map(|event| event.theme).collect();
        assert_eq!(order, Theme::ALL.to_vec());

        let calls = generator.calls();
        assert_eq!(calls.len(), 6);
        for pair in calls.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= Duration::from_millis(4500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serial_dispatch_stops_issuing_after_cancel() {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Arc::new(ScriptedGenerator::gated(gate.clone()));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Serial);

        orchestrator.start_batch(source(), QualityMode::Standard);
        while generator.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        orchestrator.cancel_batch();
        gate.add_permits(6);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(generator.calls().len(), 1);
        assert_eq!(orchestrator.drain_ready(), 0);
        assert_eq!(orchestrator.stale_discarded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_requests_fail_with_timeout() {
        let generator = Arc::new(ScriptedGenerator::new(|request| {
            if request.theme == Theme::Gallery {
                Scripted::Hang
            } else {
                Scripted::Succeed
            }
        }));
        let mut orchestrator = BatchOrchestrator::new(
            generator,
            PromptTable::builtin(),
            StudioSettings {
                dispatch: DispatchPolicy::Parallel,
                pacing: Duration::ZERO,
                request_timeout: Duration::from_secs(5),
            },
        );

        orchestrator.start_batch(source(), QualityMode::Standard);
        orchestrator.wait_for_completion().await;

        let gallery = &orchestrator.slots()[Theme::Gallery.index()];
        assert_eq!(gallery.status(), SlotStatus::Failed);
        assert_eq!(
            gallery.error().map(|err| err.kind),
            Some(GenerationErrorKind::TimedOut)
        );
        assert_eq!(orchestrator.summary().done, 5);
    }

    #[tokio::test]
    async fn single_slot_retry_renews_only_that_slot() {
        let attempts = Arc::new(Mutex::new(0usize));
        let counter = attempts.clone();
        let generator = Arc::new(ScriptedGenerator::new(move |request| {
            if request.theme != Theme::Cinematic {
                return Scripted::Succeed;
            }
            let mut attempts = counter.lock();
            *attempts += 1;
            if *attempts == 1 {
                Scripted::Fail(GenerationErrorKind::EmptyResponse)
            } else {
                Scripted::Succeed
            }
        }));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Parallel);

        let token = orchestrator.start_batch(source(), QualityMode::Standard);
        orchestrator.wait_for_completion().await;

        let before: Vec<SlotId> = orchestrator.slots().iter().map(|slot| slot.id()).collect();
        let failed = orchestrator.slots()[Theme::Cinematic.index()].id();
        let retry_token = orchestrator
            .retry(RetryTarget::Slot(failed), None)
            .expect("retry failed slot");
        assert_eq!(retry_token, token);

        let retried = &orchestrator.slots()[Theme::Cinematic.index()];
        assert_eq!(retried.status(), SlotStatus::Pending);
        assert_ne!(retried.id(), failed);

        let events = orchestrator.wait_for_completion().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].theme, Theme::Cinematic);
        assert_eq!(orchestrator.summary().done, 6);
        for (index, slot) in orchestrator.slots().iter().enumerate() {
            if index != Theme::Cinematic.index() {
                assert_eq!(slot.id(), before[index]);
            }
        }
        assert_eq!(generator.calls().len(), 7);
    }

    #[tokio::test]
    async fn retry_rejects_unknown_and_pending_slots() {
        let gate = Arc::new(Semaphore::new(0));
        let generator = Arc::new(ScriptedGenerator::gated(gate));
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);

        orchestrator.start_batch(source(), QualityMode::Standard);
        let pending = orchestrator.slots()[0].id();

        assert!(matches!(
            orchestrator.retry(RetryTarget::Slot(pending), None),
            Err(StudioError::SlotPending(id)) if id == pending
        ));
        let stranger = SlotId::new();
        assert!(matches!(
            orchestrator.retry(RetryTarget::Slot(stranger), None),
            Err(StudioError::UnknownSlot(id)) if id == stranger
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_keeps_finished_renderings_for_export() {
        let generator = Arc::new(ScriptedGenerator::new(|request| {
            if request.theme == Theme::Professional {
                Scripted::Succeed
            } else {
                Scripted::Hang
            }
        }));
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);

        orchestrator.start_batch(source(), QualityMode::Standard);
        let event = orchestrator.next_event().await.expect("one slot settles");
        assert_eq!(event.theme, Theme::Professional);

        let finished = orchestrator.interrupt();
        assert!(orchestrator.slots().is_empty());
        assert_eq!(finished.len(), 1);

        let dir = tempfile::tempdir().expect("temp dir");
        let written = export_all(&finished, dir.path(), Duration::ZERO)
            .await
            .expect("export succeeds");
        assert_eq!(written, vec![dir.path().join("professional.png")]);
    }

    #[tokio::test(start_paused = true)]
    async fn interrupt_folds_in_results_that_already_arrived() {
        let generator = Arc::new(ScriptedGenerator::new(|request| {
            match request.theme {
                Theme::Fashion | Theme::Gallery => Scripted::Succeed,
                _ => Scripted::Hang,
            }
        }));
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);

        orchestrator.start_batch(source(), QualityMode::Standard);
        tokio::time::sleep(Duration::from_millis(10)).await;

        let finished: Vec<Theme> = orchestrator
            .interrupt()
            .iter()
            .map(|slot| slot.theme())
            .collect();
        assert_eq!(finished, vec![Theme::Fashion, Theme::Gallery]);
        assert_eq!(orchestrator.stale_discarded(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn serial_single_slot_retries_keep_their_pacing() {
        let attempted = Arc::new(Mutex::new(Vec::<Theme>::new()));
        let seen = attempted.clone();
        let generator = Arc::new(ScriptedGenerator::new(move |request| {
            let mut seen = seen.lock();
            let first_attempt = !seen.contains(&request.theme);
            seen.push(request.theme);
            match request.theme {
                Theme::Fashion | Theme::Gallery if first_attempt => {
                    Scripted::Fail(GenerationErrorKind::QuotaExhausted)
                }
                _ => Scripted::Succeed,
            }
        }));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Serial);

        orchestrator.start_batch(source(), QualityMode::Standard);
        orchestrator.wait_for_completion().await;
        assert_eq!(orchestrator.summary().failed, 2);

        let failed: Vec<SlotId> = orchestrator
            .slots()
            .iter()
            .filter(|slot| slot.status() == SlotStatus::Failed)
            .map(|slot| slot.id())
            .collect();
        for slot_id in failed {
            orchestrator
                .retry(RetryTarget::Slot(slot_id), None)
                .expect("retry failed slot");
        }
        orchestrator.wait_for_completion().await;

        assert_eq!(orchestrator.summary().done, 6);
        let calls = generator.calls();
        assert_eq!(calls.len(), 8);
        assert_eq!(calls[6].theme, Theme::Fashion);
        assert_eq!(calls[7].theme, Theme::Gallery);
        assert!(calls[7].at.duration_since(calls[6].at) >= Duration::from_millis(4500));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_retries_of_a_cancelled_batch_are_never_sent() {
        let generator = Arc::new(ScriptedGenerator::new(|request| {
            if request.quality == QualityMode::Standard && request.theme != Theme::Professional {
                Scripted::Fail(GenerationErrorKind::TransportError)
            } else {
                Scripted::Succeed
            }
        }));
        let mut orchestrator = orchestrator(generator.clone(), DispatchPolicy::Serial);

        orchestrator.start_batch(source(), QualityMode::Standard);
        orchestrator.wait_for_completion().await;
        let failed: Vec<SlotId> = orchestrator.slots()[1..].iter().map(|slot| slot.id()).collect();
        for slot_id in failed {
            orchestrator
                .retry(RetryTarget::Slot(slot_id), None)
                .expect("retry failed slot");
        }
        orchestrator.cancel_batch();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(generator.calls().len(), 6);
    }

    #[tokio::test]
    async fn single_slot_retry_after_settling_is_timed() {
        let attempts = Arc::new(Mutex::new(0usize));
        let counter = attempts.clone();
        let generator = Arc::new(ScriptedGenerator::new(move |request| {
            if request.theme != Theme::Gallery {
                return Scripted::Succeed;
            }
            let mut attempts = counter.lock();
            *attempts += 1;
            if *attempts == 1 {
                Scripted::Fail(GenerationErrorKind::ContentSafetyBlocked)
            } else {
                Scripted::Succeed
            }
        }));
        let mut orchestrator = orchestrator(generator, DispatchPolicy::Parallel);

        orchestrator.start_batch(source(), QualityMode::Standard);
        assert_eq!(orchestrator.timing_scope(), Some("batch"));
        orchestrator.wait_for_completion().await;
        assert_eq!(orchestrator.timing_scope(), None);

        let failed = orchestrator.slots()[Theme::Gallery.index()].id();
        orchestrator
            .retry(RetryTarget::Slot(failed), None)
            .expect("retry failed slot");
        assert_eq!(orchestrator.timing_scope(), Some("retry"));

        orchestrator.wait_for_completion().await;
        assert_eq!(orchestrator.timing_scope(), None);
        assert_eq!(orchestrator.summary().done, 6);
    }

    #[test]
    fn dispatch_policy_parses_aliases() {
        assert_eq!("Parallel".parse::<DispatchPolicy>(), Ok(DispatchPolicy::Parallel));
        assert_eq!("sequential".parse::<DispatchPolicy>(), Ok(DispatchPolicy::Serial));
        assert!("batch".parse::<DispatchPolicy>().is_err());
    }
}
