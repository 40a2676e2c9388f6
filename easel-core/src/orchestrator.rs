//! The generation orchestrator: a one-job-at-a-time state machine driving a single worker
//! thread that either loads a model or runs a batch.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::engine::{StepControl, StepProgress};
use crate::error::{GenerationError, LoadError, OrchestratorError};
use crate::events::{Event, EventSender, ProgressEvent, Severity};
use crate::history::{PromptEntry, PromptHistoryStore};
use crate::model_manager::{LoadOptions, ModelInfo, ModelManager};
use crate::persist::{ImageMetadata, ImageStore};
use crate::scheduler;
use crate::GenerationRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrchestratorState {
    Idle,
    ModelLoading,
    Ready,
    Generating,
}

impl OrchestratorState {
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::ModelLoading | Self::Generating)
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageStatus {
    Success,
    Cancelled,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ImageResult {
    pub index: usize,
    pub status: ImageStatus,
    pub image: Option<Arc<DynamicImage>>,
    pub seed_used: u64,
    pub duration: Duration,
    pub error: Option<GenerationError>,
    pub saved_path: Option<PathBuf>,
}

/// State of the batch currently running.
#[derive(Debug)]
pub struct BatchSession {
    pub image_count: usize,
    pub cancel: CancellationToken,
    current_index: AtomicUsize,
    results: Mutex<Vec<ImageResult>>,
}

impl BatchSession {
    pub fn new(image_count: usize) -> Self {
        Self {
            image_count,
            cancel: CancellationToken::default(),
            current_index: AtomicUsize::new(0),
            results: Mutex::new(Vec::with_capacity(image_count)),
        }
    }

    pub fn current_index(&self) -> usize {
        self.current_index.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        lock(&self.results)
            .iter()
            .filter(|result| result.status == ImageStatus::Success)
            .count()
    }

    fn record(&self, result: ImageResult) {
        lock(&self.results).push(result);
    }

    fn take_results(&self) -> Vec<ImageResult> {
        std::mem::take(&mut *lock(&self.results))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchStatus {
    pub image_count: usize,
    pub current_index: usize,
    pub completed: usize,
    pub cancel_requested: bool,
}

#[derive(Debug, Clone)]
pub struct BatchOutcome {
    pub results: Vec<ImageResult>,
    pub cancelled: bool,
}

impl BatchOutcome {
    pub fn completed(&self) -> usize {
        self.count(ImageStatus::Success)
    }

    pub fn failed(&self) -> usize {
        self.count(ImageStatus::Failed)
    }

    fn count(&self, status: ImageStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Where a batch sends its images, prompts and notifications.
pub struct Collaborators<'a> {
    pub store: &'a dyn ImageStore,
    pub history: &'a Mutex<PromptHistoryStore>,
    pub events: &'a EventSender,
}

/// The seed a batch starts from. `-1` draws a fresh 32-bit value.
pub fn resolve_base_seed(seed: i64, rng: &mut impl Rng) -> u64 {
    if seed == -1 {
        u64::from(rng.gen::<u32>())
    } else {
        seed as u64
    }
}

/// Seed of image `index` within a batch. Distinct per image so a batch yields distinct outputs.
/// Seeds are 32-bit; the sum wraps at `u32::MAX`.
pub fn derive_image_seed(base_seed: u64, index: usize) -> u64 {
    u64::from((base_seed as u32).wrapping_add(index as u32))
}

fn batch_fraction(image_index: usize, step_index: usize, total_steps: usize, total_images: usize) -> f64 {
    let within = if total_steps == 0 {
        0.0
    } else {
        (step_index.min(total_steps)) as f64 / total_steps as f64
    };
    ((image_index as f64 + within) / total_images as f64).clamp(0.0, 1.0)
}

/// Runs one batch against the loaded model. Does not emit `BatchFinished`; the caller does once
/// the session is torn down.
pub fn run_batch(
    manager: &mut ModelManager,
    request: &GenerationRequest,
    base_seed: u64,
    session: &BatchSession,
    sinks: &Collaborators<'_>,
) -> BatchOutcome {
    let events = sinks.events;
    let loader = manager.loader().clone();
    let Some(handle) = manager.current_mut() else {
        events.status("No model loaded", Severity::Error);
        return BatchOutcome {
            results: Vec::new(),
            cancelled: false,
        };
    };

    let current = handle.model.scheduler_config();
    match scheduler::reconfigure(&current, &request.scheduler) {
        Ok(config) => {
            debug!("scheduler {} -> {config:?}", request.scheduler);
            handle.model.reconfigure_scheduler(&config);
        }
        Err(err) => {
            warn!("{err}, keeping the current scheduler");
            events.status(
                format!("Unknown scheduler '{}', using the current one", request.scheduler),
                Severity::Warning,
            );
        }
    }

    let total_images = request.image_count;
    let params = request.image_params();
    let mut cancelled = false;

    for index in 0..total_images {
        if session.cancel.is_cancelled() {
            cancelled = true;
            events.status(
                format!("Generation of image {}/{total_images} cancelled", index + 1),
                Severity::Warning,
            );
            break;
        }
        session.current_index.store(index, Ordering::SeqCst);

        let start_fraction = batch_fraction(index, 0, params.steps, total_images);
        events.progress(ProgressEvent {
            fraction: start_fraction,
            image_index: index,
            total_images,
            step_index: 0,
            total_steps: params.steps,
            label: format!("{}%", (start_fraction * 100.0) as u32),
        });

        let seed_used = derive_image_seed(base_seed, index);
        let mut rng = StdRng::seed_from_u64(seed_used);
        let last_fraction = Cell::new(start_fraction);
        let mut on_step = |step: StepProgress| {
            let fraction =
                batch_fraction(index, step.step_index, step.total_steps, total_images).max(last_fraction.get());
            last_fraction.set(fraction);
            events.progress(ProgressEvent {
                fraction,
                image_index: index,
                total_images,
                step_index: step.step_index,
                total_steps: step.total_steps,
                label: format!(
                    "Image {}/{total_images}, step {}/{}",
                    index + 1,
                    step.step_index,
                    step.total_steps
                ),
            });
            if session.cancel.is_cancelled() {
                StepControl::Abort
            } else {
                StepControl::Continue
            }
        };

        info!("Generating image {}/{total_images} with seed {seed_used}", index + 1);
        let started = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            handle.model.generate(&params, &mut rng, &mut on_step)
        }))
        .unwrap_or_else(|payload| {
            Err(GenerationError::Unknown(format!(
                "engine panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
        let duration = started.elapsed();

        // Per-image buffers go back to the device regardless of how the image ended.
        handle.model.release_transient();
        loader.reclaim_memory();

        match result {
            Ok(image) => {
                let end_fraction = batch_fraction(index + 1, 0, params.steps, total_images);
                if last_fraction.get() < end_fraction {
                    events.progress(ProgressEvent {
                        fraction: end_fraction,
                        image_index: index,
                        total_images,
                        step_index: params.steps,
                        total_steps: params.steps,
                        label: format!("{}%", (end_fraction * 100.0) as u32),
                    });
                }

                let image = Arc::new(image);
                let duration_ms = duration.as_millis() as u64;
                events.emit(Event::ImageReady {
                    image_index: index,
                    image: image.clone(),
                    seed_used,
                    duration_ms,
                });
                events.status(
                    format!(
                        "Image {}/{total_images} generated in {:.1}s",
                        index + 1,
                        duration.as_secs_f64()
                    ),
                    Severity::Success,
                );

                let saved_path = save_image(sinks, &image, request, seed_used);
                remember_prompt(sinks, request);

                session.record(ImageResult {
                    index,
                    status: ImageStatus::Success,
                    image: Some(image),
                    seed_used,
                    duration,
                    error: None,
                    saved_path,
                });
            }
            Err(err) => {
                let (status, severity, message) = match &err {
                    GenerationError::Cancelled => (
                        ImageStatus::Cancelled,
                        Severity::Warning,
                        format!("Generation of image {}/{total_images} cancelled", index + 1),
                    ),
                    GenerationError::InsufficientMemory(_) => (
                        ImageStatus::Failed,
                        Severity::Error,
                        format!(
                            "Image {}/{total_images} failed: not enough memory, try a smaller size or fewer steps",
                            index + 1
                        ),
                    ),
                    other => (
                        ImageStatus::Failed,
                        Severity::Error,
                        format!("Image {}/{total_images} failed: {other}", index + 1),
                    ),
                };
                if status == ImageStatus::Cancelled {
                    cancelled = true;
                    info!("image {} cancelled after {duration:?}", index + 1);
                } else {
                    error!("image {} failed: {err}", index + 1);
                }
                events.status(message, severity);
                session.record(ImageResult {
                    index,
                    status,
                    image: None,
                    seed_used,
                    duration,
                    error: Some(err),
                    saved_path: None,
                });
                break;
            }
        }
    }

    if !cancelled {
        events.progress(ProgressEvent {
            fraction: 1.0,
            image_index: total_images.saturating_sub(1),
            total_images,
            step_index: params.steps,
            total_steps: params.steps,
            label: "100% (done)".to_string(),
        });
    }

    BatchOutcome {
        results: session.take_results(),
        cancelled,
    }
}

fn save_image(
    sinks: &Collaborators<'_>,
    image: &DynamicImage,
    request: &GenerationRequest,
    seed: u64,
) -> Option<PathBuf> {
    let metadata = ImageMetadata {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone(),
        seed,
        scheduler: request.scheduler.clone(),
        width: request.width,
        height: request.height,
        steps: request.steps,
        guidance_scale: request.guidance_scale,
    };
    match sinks.store.save(image, &metadata) {
        Ok(path) => {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            sinks
                .events
                .status(format!("Image saved: {name}"), Severity::Success);
            Some(path)
        }
        Err(err) => {
            warn!("saving image failed: {err}");
            sinks
                .events
                .status(format!("Could not save image: {err}"), Severity::Warning);
            None
        }
    }
}

fn remember_prompt(sinks: &Collaborators<'_>, request: &GenerationRequest) {
    let entry = PromptEntry::new(request.prompt.clone(), request.negative_prompt.clone());
    if let Err(err) = lock(sinks.history).add(entry) {
        warn!("saving prompt history failed: {err}");
        sinks
            .events
            .status(format!("Could not save prompt history: {err}"), Severity::Warning);
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Control {
    state: OrchestratorState,
    model: Option<ModelInfo>,
    session: Option<Arc<BatchSession>>,
}

struct Shared {
    control: Mutex<Control>,
    models: Mutex<ModelManager>,
    store: Arc<dyn ImageStore>,
    history: Mutex<PromptHistoryStore>,
    events: EventSender,
}

impl Shared {
    fn run_load(&self, path: PathBuf, options: LoadOptions) {
        self.events
            .status(format!("Loading model {}...", path.display()), Severity::Info);
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            lock(&self.models).load(&path, &options).cloned()
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!("model loader panicked: {message}");
            Err(LoadError::Unknown(format!("loader panicked: {message}")))
        });

        let mut control = lock(&self.control);
        match result {
            Ok(info) => {
                control.state = OrchestratorState::Ready;
                control.model = Some(info.clone());
                drop(control);
                self.events.emit(Event::ModelLoaded(info.clone()));
                self.events.status(
                    format!("Model {} loaded on {}", info.name, info.device),
                    Severity::Success,
                );
            }
            Err(err) => {
                control.state = OrchestratorState::Idle;
                control.model = None;
                drop(control);
                let message = match &err {
                    LoadError::InsufficientMemory(_) => format!(
                        "Not enough memory for this model, try a smaller model or close other applications ({err})"
                    ),
                    _ => format!("Loading the model failed: {err}"),
                };
                self.events.status(message, Severity::Error);
            }
        }
    }

    fn run_generation(&self, request: GenerationRequest, base_seed: u64, session: Arc<BatchSession>) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let mut models = lock(&self.models);
            let sinks = Collaborators {
                store: self.store.as_ref(),
                history: &self.history,
                events: &self.events,
            };
            run_batch(&mut models, &request, base_seed, &session, &sinks)
        }))
        .unwrap_or_else(|payload| {
            let message = panic_message(payload.as_ref());
            error!("batch worker panicked: {message}");
            self.events
                .status(format!("Generation failed: {message}"), Severity::Error);
            let index = session.current_index();
            session.record(ImageResult {
                index,
                status: ImageStatus::Failed,
                image: None,
                seed_used: derive_image_seed(base_seed, index),
                duration: Duration::ZERO,
                error: Some(GenerationError::Unknown(message)),
                saved_path: None,
            });
            BatchOutcome {
                results: session.take_results(),
                cancelled: session.cancel.is_cancelled(),
            }
        });

        {
            let mut control = lock(&self.control);
            control.session = None;
            control.state = if control.model.is_some() {
                OrchestratorState::Ready
            } else {
                OrchestratorState::Idle
            };
        }

        info!(
            "Batch finished: {} of {} images, cancelled: {}",
            outcome.completed(),
            request.image_count,
            outcome.cancelled
        );
        self.events.emit(Event::BatchFinished {
            cancelled: outcome.cancelled,
            completed: outcome.completed(),
            failed: outcome.failed(),
        });
    }
}

/// Accepts commands from the control surface. All methods return immediately; work happens on a
/// single worker thread and is reported through the event channel.
pub struct Orchestrator {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        loader: Arc<dyn crate::engine::ModelLoader>,
        store: Arc<dyn ImageStore>,
        history: PromptHistoryStore,
        events: EventSender,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                control: Mutex::new(Control {
                    state: OrchestratorState::Idle,
                    model: None,
                    session: None,
                }),
                models: Mutex::new(ModelManager::new(loader)),
                store,
                history: Mutex::new(history),
                events,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        lock(&self.shared.control).state
    }

    pub fn model_info(&self) -> Option<ModelInfo> {
        lock(&self.shared.control).model.clone()
    }

    pub fn batch_status(&self) -> Option<BatchStatus> {
        lock(&self.shared.control)
            .session
            .as_ref()
            .map(|session| BatchStatus {
                image_count: session.image_count,
                current_index: session.current_index(),
                completed: session.completed(),
                cancel_requested: session.cancel.is_cancelled(),
            })
    }

    pub fn history(&self) -> Vec<PromptEntry> {
        lock(&self.shared.history).history().entries().cloned().collect()
    }

    /// Deletes saved images and the prompt history. Refused while a job runs, and no job can
    /// start until the clear is done.
    pub fn clear_gallery(&self) -> Result<usize, OrchestratorError> {
        let control = lock(&self.shared.control);
        if control.state.is_busy() {
            return Err(OrchestratorError::Busy);
        }
        let removed = self.shared.store.clear()?;
        lock(&self.shared.history).clear()?;
        drop(control);
        info!("Gallery cleared, {removed} images deleted");
        Ok(removed)
    }

    pub fn load_model(
        &self,
        path: impl Into<PathBuf>,
        options: LoadOptions,
    ) -> Result<(), OrchestratorError> {
        let path = path.into();
        let previous = {
            let mut control = lock(&self.shared.control);
            if control.state.is_busy() {
                return Err(OrchestratorError::Busy);
            }
            if !path.exists() {
                let err = LoadError::NotFound(path);
                self.shared
                    .events
                    .status(format!("Loading the model failed: {err}"), Severity::Error);
                return Err(err.into());
            }
            let previous = control.state;
            control.state = OrchestratorState::ModelLoading;
            control.model = None;
            previous
        };

        let shared = self.shared.clone();
        self.spawn_worker(move || shared.run_load(path, options))
            .inspect_err(|_| lock(&self.shared.control).state = previous)
    }

    /// Validates `request`, resolves its base seed and dispatches the batch. Returns the base
    /// seed so the caller can show or persist it.
    pub fn start_generation(&self, request: GenerationRequest) -> Result<u64, OrchestratorError> {
        let (base_seed, session) = {
            let mut control = lock(&self.shared.control);
            match control.state {
                OrchestratorState::ModelLoading | OrchestratorState::Generating => {
                    return Err(OrchestratorError::Busy)
                }
                OrchestratorState::Idle => return Err(OrchestratorError::NoModel),
                OrchestratorState::Ready => {}
            }
            request.validate()?;

            let base_seed = resolve_base_seed(request.seed, &mut rand::thread_rng());
            let session = Arc::new(BatchSession::new(request.image_count));
            control.state = OrchestratorState::Generating;
            control.session = Some(session.clone());
            (base_seed, session)
        };
        self.shared.events.emit(Event::SeedResolved { seed: base_seed });
        info!(
            "Starting batch of {} with base seed {base_seed}",
            request.image_count
        );

        let shared = self.shared.clone();
        self.spawn_worker(move || shared.run_generation(request, base_seed, session))
            .inspect_err(|_| {
                let mut control = lock(&self.shared.control);
                control.state = OrchestratorState::Ready;
                control.session = None;
            })?;
        Ok(base_seed)
    }

    /// Requests a cooperative stop of the running batch. Returns whether a batch was running.
    pub fn cancel_generation(&self) -> bool {
        match &lock(&self.shared.control).session {
            Some(session) => {
                session.cancel.cancel();
                self.shared
                    .events
                    .status("Cancelling generation...", Severity::Warning);
                true
            }
            None => false,
        }
    }

    pub fn unload_model(&self) -> Result<(), OrchestratorError> {
        let mut control = lock(&self.shared.control);
        if control.state.is_busy() {
            return Err(OrchestratorError::Busy);
        }
        let had_model = control.model.take().is_some();
        lock(&self.shared.models).unload();
        control.state = OrchestratorState::Idle;
        drop(control);
        if had_model {
            self.shared.events.emit(Event::ModelUnloaded);
            self.shared.events.status("Model unloaded", Severity::Info);
        }
        Ok(())
    }

    /// Waits up to `timeout` for the worker to exit. Returns `true` when no worker is left.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut worker = lock(&self.worker);
        let Some(handle) = worker.as_ref() else {
            return true;
        };
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if let Some(handle) = worker.take() {
            if handle.join().is_err() {
                error!("worker thread panicked");
            }
        }
        true
    }

    /// Cancels any running batch, waits up to `grace` for the worker, then releases the model.
    /// Returns `false` if the worker was still running when the grace period ran out.
    pub fn shutdown(&self, grace: Duration) -> bool {
        self.cancel_generation();
        let stopped = self.wait_idle(grace);
        if stopped {
            lock(&self.shared.models).unload();
            let mut control = lock(&self.shared.control);
            control.model = None;
            control.state = OrchestratorState::Idle;
        } else {
            warn!("worker did not stop within {grace:?}, leaving it to process teardown");
        }
        stopped
    }

    fn spawn_worker<F>(&self, work: F) -> Result<(), OrchestratorError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut worker = lock(&self.worker);
        // The previous worker has already released the state machine; reap it.
        if let Some(previous) = worker.take() {
            if previous.join().is_err() {
                error!("previous worker thread panicked");
            }
        }
        let handle = std::thread::Builder::new()
            .name("easel-worker".to_string())
            .spawn(work)
            .map_err(OrchestratorError::Spawn)?;
        *worker = Some(handle);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{event_channel, EventReceiver};
    use crate::testing::{FakeLoader, MemoryStore, ModelScript};
    use crate::DeviceMap;

    const WAIT: Duration = Duration::from_secs(10);

    fn request(image_count: usize) -> GenerationRequest {
        GenerationRequest {
            prompt: "a cat".to_string(),
            negative_prompt: String::new(),
            width: 512,
            height: 512,
            steps: 20,
            guidance_scale: 7.5,
            seed: 42,
            scheduler: "Euler".to_string(),
            image_count,
        }
    }

    fn cpu() -> LoadOptions {
        LoadOptions {
            device: DeviceMap::ForceCpu,
            ..Default::default()
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        model_path: PathBuf,
        loader: Arc<FakeLoader>,
        store: Arc<MemoryStore>,
        orchestrator: Orchestrator,
        events: EventReceiver,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let model_path = dir.path().join("tiny.safetensors");
            std::fs::write(&model_path, b"weights").unwrap();
            let loader = FakeLoader::new();
            let store = Arc::new(MemoryStore::default());
            let history = PromptHistoryStore::load(dir.path().join("history.json"), 10);
            let (tx, events) = event_channel();
            let orchestrator = Orchestrator::new(loader.clone(), store.clone(), history, tx);
            Self {
                _dir: dir,
                model_path,
                loader,
                store,
                orchestrator,
                events,
            }
        }

        fn loaded() -> Self {
            let mut fixture = Self::new();
            fixture
                .orchestrator
                .load_model(&fixture.model_path, cpu())
                .unwrap();
            assert!(fixture.orchestrator.wait_idle(WAIT));
            assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
            fixture.events.drain();
            fixture
        }

        fn finish(&mut self) -> Vec<Event> {
            assert!(self.orchestrator.wait_idle(WAIT));
            self.events.drain()
        }
    }

    fn image_ready(events: &[Event]) -> Vec<(usize, u64)> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::ImageReady {
                    image_index,
                    seed_used,
                    ..
                } => Some((*image_index, *seed_used)),
                _ => None,
            })
            .collect()
    }

    fn batch_finished(events: &[Event]) -> Vec<bool> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::BatchFinished { cancelled, .. } => Some(*cancelled),
                _ => None,
            })
            .collect()
    }

    fn progress(events: &[Event]) -> Vec<ProgressEvent> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::Progress(progress) => Some(progress.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn base_seed_resolution() {
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(resolve_base_seed(42, &mut rng), 42);
        let drawn = resolve_base_seed(-1, &mut rng);
        assert!(drawn <= u64::from(u32::MAX));
        assert_eq!(derive_image_seed(42, 0), 42);
        assert_eq!(derive_image_seed(42, 1), 43);
        assert_eq!(derive_image_seed(u64::from(u32::MAX), 1), 0);
        assert_eq!(derive_image_seed(u64::from(u32::MAX) - 1, 3), 1);
    }

    #[test]
    fn two_image_batch_uses_distinct_seeds() {
        let mut fixture = Fixture::loaded();
        let seed = fixture.orchestrator.start_generation(request(2)).unwrap();
        assert_eq!(seed, 42);

        let events = fixture.finish();
        assert_eq!(image_ready(&events), [(0, 42), (1, 43)]);
        assert_eq!(batch_finished(&events), [false]);
        assert!(matches!(events.last(), Some(Event::BatchFinished { completed: 2, .. })));
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);

        let draws = fixture.loader.first_draws();
        assert_eq!(draws.len(), 2);
        assert_ne!(draws[0], draws[1]);
        assert_eq!(fixture.store.saved().len(), 2);
        assert_eq!(fixture.orchestrator.history().len(), 1);
    }

    #[test]
    fn n_images_arrive_in_order() {
        let mut fixture = Fixture::loaded();
        fixture.orchestrator.start_generation(request(4)).unwrap();
        let events = fixture.finish();
        let indices: Vec<_> = image_ready(&events).into_iter().map(|(i, _)| i).collect();
        assert_eq!(indices, [0, 1, 2, 3]);
    }

    #[test]
    fn same_seed_reproduces_draws() {
        let mut fixture = Fixture::loaded();
        fixture.orchestrator.start_generation(request(1)).unwrap();
        fixture.finish();
        fixture.orchestrator.start_generation(request(1)).unwrap();
        fixture.finish();
        let draws = fixture.loader.first_draws();
        assert_eq!(draws[0], draws[1]);
    }

    #[test]
    fn random_seed_is_reported() {
        let mut fixture = Fixture::loaded();
        let seed = fixture
            .orchestrator
            .start_generation(GenerationRequest {
                seed: -1,
                ..request(1)
            })
            .unwrap();
        let events = fixture.finish();
        assert!(matches!(events[0], Event::SeedResolved { seed: s } if s == seed));
        assert_eq!(image_ready(&events), [(0, seed)]);
    }

    #[test]
    fn progress_is_monotonic_and_ends_each_image_at_its_share() {
        let mut fixture = Fixture::loaded();
        fixture.orchestrator.start_generation(request(2)).unwrap();
        let events = fixture.finish();
        let progress = progress(&events);

        for image in 0..2 {
            let fractions: Vec<f64> = progress
                .iter()
                .filter(|p| p.image_index == image && p.label != "100% (done)")
                .map(|p| p.fraction)
                .collect();
            assert!(fractions.windows(2).all(|w| w[0] <= w[1]));
            assert_eq!(fractions[0], image as f64 / 2.0);
            assert_eq!(*fractions.last().unwrap(), (image + 1) as f64 / 2.0);
        }
        assert_eq!(progress.last().unwrap().fraction, 1.0);

        // Every event of image 0 comes before any event of image 1.
        let first_of_second = events
            .iter()
            .position(|e| matches!(e, Event::Progress(p) if p.image_index == 1))
            .unwrap();
        let ready_of_first = events
            .iter()
            .position(|e| matches!(e, Event::ImageReady { image_index: 0, .. }))
            .unwrap();
        assert!(ready_of_first < first_of_second);
    }

    #[test]
    fn cancel_between_images_stops_before_next_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let model_path = dir.path().join("tiny.safetensors");
        std::fs::write(&model_path, b"weights").unwrap();
        let loader = FakeLoader::new();
        let mut manager = ModelManager::new(loader.clone());
        manager.load(&model_path, &cpu()).unwrap();

        let session = BatchSession::new(5);
        let token = session.cancel.clone();
        loader.set_script(ModelScript {
            after_image: Some(Arc::new(move |index: usize| {
                if index == 1 {
                    token.cancel();
                }
            })),
            ..Default::default()
        });

        let store = MemoryStore::default();
        let history = Mutex::new(PromptHistoryStore::load(dir.path().join("h.json"), 10));
        let (tx, mut rx) = event_channel();
        let sinks = Collaborators {
            store: &store,
            history: &history,
            events: &tx,
        };
        let outcome = run_batch(&mut manager, &request(5), 7, &session, &sinks);

        assert!(outcome.cancelled);
        assert_eq!(outcome.completed(), 2);
        assert_eq!(loader.generate_calls(), 2);
        let events = rx.drain();
        assert_eq!(image_ready(&events).len(), 2);
        // No 100% finalisation for a cancelled batch.
        assert!(progress(&events).iter().all(|p| p.label != "100% (done)"));
        assert_eq!(loader.transient_releases(), 2);
    }

    #[test]
    fn cancel_mid_image_aborts_at_step_boundary() {
        let mut fixture = Fixture::loaded();
        fixture.loader.set_script(ModelScript {
            gated: true,
            ..Default::default()
        });
        fixture.orchestrator.start_generation(request(3)).unwrap();
        assert!(fixture.loader.wait_for_gate(WAIT));
        assert!(fixture.orchestrator.cancel_generation());
        fixture.loader.open_gate();

        let events = fixture.finish();
        assert!(image_ready(&events).is_empty());
        assert_eq!(batch_finished(&events), [true]);
        assert_eq!(fixture.loader.generate_calls(), 1);
        // The engine saw exactly one step before honouring the abort.
        let steps: Vec<_> = progress(&events).iter().map(|p| p.step_index).collect();
        assert_eq!(steps, [0, 1]);
        assert!(fixture.store.saved().is_empty());
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
    }

    #[test]
    fn second_start_while_generating_is_busy() {
        let mut fixture = Fixture::loaded();
        fixture.loader.set_script(ModelScript {
            gated: true,
            ..Default::default()
        });
        fixture.orchestrator.start_generation(request(2)).unwrap();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Generating);

        assert!(matches!(
            fixture.orchestrator.start_generation(request(1)),
            Err(OrchestratorError::Busy)
        ));
        assert!(matches!(
            fixture.orchestrator.load_model(&fixture.model_path, cpu()),
            Err(OrchestratorError::Busy)
        ));
        assert!(matches!(
            fixture.orchestrator.unload_model(),
            Err(OrchestratorError::Busy)
        ));
        let status = fixture.orchestrator.batch_status().unwrap();
        assert_eq!(status.image_count, 2);
        assert!(!status.cancel_requested);

        fixture.loader.open_gate();
        let events = fixture.finish();
        assert_eq!(image_ready(&events).len(), 2);
        assert_eq!(batch_finished(&events), [false]);
    }

    #[test]
    fn commands_while_loading_are_busy() {
        let mut fixture = Fixture::new();
        fixture.loader.gate_loads();
        fixture
            .orchestrator
            .load_model(&fixture.model_path, cpu())
            .unwrap();
        assert!(fixture.loader.wait_for_load_gate(WAIT));
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::ModelLoading);

        assert!(matches!(
            fixture.orchestrator.start_generation(request(1)),
            Err(OrchestratorError::Busy)
        ));
        assert!(matches!(
            fixture.orchestrator.load_model(&fixture.model_path, cpu()),
            Err(OrchestratorError::Busy)
        ));
        assert!(matches!(
            fixture.orchestrator.unload_model(),
            Err(OrchestratorError::Busy)
        ));
        assert!(!fixture.orchestrator.cancel_generation());

        fixture.loader.open_load_gate();
        let events = fixture.finish();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
        assert!(events.iter().any(|e| matches!(e, Event::ModelLoaded(_))));
        assert_eq!(fixture.loader.load_calls(), 1);
    }

    #[test]
    fn engine_panic_fails_the_image_and_releases_the_session() {
        let mut fixture = Fixture::loaded();
        fixture.loader.set_script(ModelScript {
            panic_on: Some(1),
            ..Default::default()
        });
        fixture.orchestrator.start_generation(request(3)).unwrap();
        let events = fixture.finish();

        assert_eq!(image_ready(&events).len(), 1);
        assert_eq!(fixture.loader.generate_calls(), 2);
        assert_eq!(fixture.loader.transient_releases(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StatusChanged { severity: Severity::Error, message } if message.contains("panicked")
        )));
        assert!(matches!(
            events.last(),
            Some(Event::BatchFinished { cancelled: false, completed: 1, failed: 1 })
        ));
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
        assert!(fixture.orchestrator.batch_status().is_none());

        fixture.loader.set_script(ModelScript::default());
        fixture.orchestrator.start_generation(request(1)).unwrap();
        let events = fixture.finish();
        assert_eq!(image_ready(&events).len(), 1);
        fixture.orchestrator.unload_model().unwrap();
        assert_eq!(fixture.loader.live_models(), 0);
    }

    #[test]
    fn panic_outside_the_engine_still_finishes_the_batch() {
        let mut fixture = Fixture::loaded();
        fixture.store.panic_on_save();
        fixture.orchestrator.start_generation(request(2)).unwrap();
        let events = fixture.finish();

        assert_eq!(image_ready(&events).len(), 1);
        assert!(matches!(
            events.last(),
            Some(Event::BatchFinished { cancelled: false, completed: 0, failed: 1 })
        ));
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
        assert!(fixture.orchestrator.batch_status().is_none());
        fixture.orchestrator.unload_model().unwrap();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Idle);
    }

    #[test]
    fn loader_panic_returns_to_idle() {
        let mut fixture = Fixture::new();
        fixture
            .loader
            .set_behavior(crate::testing::LoadBehavior::Panic);
        fixture
            .orchestrator
            .load_model(&fixture.model_path, cpu())
            .unwrap();
        let events = fixture.finish();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Idle);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StatusChanged { severity: Severity::Error, message } if message.contains("panicked")
        )));

        fixture
            .loader
            .set_behavior(crate::testing::LoadBehavior::Succeed);
        fixture
            .orchestrator
            .load_model(&fixture.model_path, cpu())
            .unwrap();
        fixture.finish();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
    }

    #[test]
    fn clear_gallery_is_refused_while_generating() {
        let mut fixture = Fixture::loaded();
        fixture.orchestrator.start_generation(request(1)).unwrap();
        fixture.finish();
        assert_eq!(fixture.store.saved().len(), 1);
        assert_eq!(fixture.orchestrator.history().len(), 1);

        fixture.loader.set_script(ModelScript {
            gated: true,
            ..Default::default()
        });
        fixture.orchestrator.start_generation(request(1)).unwrap();
        assert!(matches!(
            fixture.orchestrator.clear_gallery(),
            Err(OrchestratorError::Busy)
        ));
        fixture.loader.open_gate();
        fixture.finish();
        assert_eq!(fixture.store.saved().len(), 2);

        assert_eq!(fixture.orchestrator.clear_gallery().unwrap(), 2);
        assert!(fixture.store.saved().is_empty());
        assert!(fixture.orchestrator.history().is_empty());
    }

    #[test]
    fn failure_breaks_the_batch() {
        let mut fixture = Fixture::loaded();
        fixture.loader.set_script(ModelScript {
            fail_on: Some((1, GenerationError::InsufficientMemory("oom".to_string()))),
            ..Default::default()
        });
        fixture.orchestrator.start_generation(request(4)).unwrap();
        let events = fixture.finish();

        assert_eq!(image_ready(&events).len(), 1);
        assert_eq!(fixture.loader.generate_calls(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StatusChanged { severity: Severity::Error, message } if message.contains("not enough memory")
        )));
        assert!(matches!(
            events.last(),
            Some(Event::BatchFinished { cancelled: false, completed: 1, failed: 1 })
        ));
        // Transient buffers were released after both attempts.
        assert_eq!(fixture.loader.transient_releases(), 2);
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
    }

    #[test]
    fn persistence_failure_does_not_abort() {
        let mut fixture = Fixture::loaded();
        fixture.store.fail_saves();
        fixture.orchestrator.start_generation(request(2)).unwrap();
        let events = fixture.finish();
        assert_eq!(image_ready(&events).len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StatusChanged { severity: Severity::Warning, message } if message.starts_with("Could not save image")
        )));
    }

    #[test]
    fn unknown_scheduler_keeps_current_config() {
        let mut fixture = Fixture::loaded();
        fixture
            .orchestrator
            .start_generation(GenerationRequest {
                scheduler: "Mystery Sampler".to_string(),
                ..request(1)
            })
            .unwrap();
        let events = fixture.finish();
        assert_eq!(image_ready(&events).len(), 1);
        assert!(fixture.loader.scheduler_configs().is_empty());

        fixture
            .orchestrator
            .start_generation(GenerationRequest {
                scheduler: "DPM++ 2M Karras".to_string(),
                ..request(1)
            })
            .unwrap();
        fixture.finish();
        let configs = fixture.loader.scheduler_configs();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].use_karras_variant);
    }

    #[test]
    fn start_without_model_or_with_bad_request_is_rejected_synchronously() {
        let fixture = Fixture::new();
        assert!(matches!(
            fixture.orchestrator.start_generation(request(1)),
            Err(OrchestratorError::NoModel)
        ));

        let fixture = Fixture::loaded();
        let err = fixture
            .orchestrator
            .start_generation(GenerationRequest {
                prompt: "  ".to_string(),
                ..request(1)
            })
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidRequest(GenerationError::InvalidInput(_))
        ));
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Ready);
        assert_eq!(fixture.loader.generate_calls(), 0);
    }

    #[test]
    fn failed_load_returns_to_idle() {
        let mut fixture = Fixture::new();
        fixture
            .loader
            .set_behavior(crate::testing::LoadBehavior::Incompatible);
        fixture
            .orchestrator
            .load_model(&fixture.model_path, cpu())
            .unwrap();
        let events = fixture.finish();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Idle);
        assert!(fixture.orchestrator.model_info().is_none());
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StatusChanged { severity: Severity::Error, .. }
        )));
    }

    #[test]
    fn missing_model_path_is_rejected_before_dispatch() {
        let fixture = Fixture::new();
        let err = fixture
            .orchestrator
            .load_model("/no/such/model.safetensors", cpu())
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Load(LoadError::NotFound(_))));
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Idle);
    }

    #[test]
    fn shutdown_cancels_and_releases() {
        let fixture = Fixture::loaded();
        fixture.loader.set_script(ModelScript {
            gated: true,
            ..Default::default()
        });
        fixture.orchestrator.start_generation(request(2)).unwrap();
        fixture.loader.open_gate();
        assert!(fixture.orchestrator.shutdown(WAIT));
        assert_eq!(fixture.loader.live_models(), 0);
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Idle);
    }

    #[test]
    fn unload_returns_to_idle() {
        let mut fixture = Fixture::loaded();
        fixture.orchestrator.unload_model().unwrap();
        assert_eq!(fixture.orchestrator.state(), OrchestratorState::Idle);
        assert_eq!(fixture.loader.live_models(), 0);
        assert!(matches!(fixture.events.drain()[0], Event::ModelUnloaded));
    }
}
