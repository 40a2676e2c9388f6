//! Scripted engine and store doubles for unit tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use image::{DynamicImage, Rgb, RgbImage};
use rand::rngs::StdRng;
use rand::RngCore;

use crate::engine::{
    Capabilities, ImageParams, MemorySaver, ModelLike, ModelLoader, StepCallback, StepControl,
    StepProgress,
};
use crate::error::{EngineError, GenerationError, LoadError, PersistError};
use crate::model_manager::ResolvedLoadOptions;
use crate::persist::{ImageMetadata, ImageStore};
use crate::scheduler::SchedulerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum LoadBehavior {
    #[default]
    Succeed,
    OutOfMemory,
    Incompatible,
    Panic,
}

/// How models handed out by a `FakeLoader` behave during `generate`.
#[derive(Clone, Default)]
pub(crate) struct ModelScript {
    /// Fail the n-th `generate` call (0-based) with the given error.
    pub fail_on: Option<(usize, GenerationError)>,
    /// Panic inside the n-th `generate` call.
    pub panic_on: Option<usize>,
    /// Runs after the n-th image finished all of its steps.
    pub after_image: Option<Arc<dyn Fn(usize) + Send + Sync>>,
    /// Block every `generate` call until `FakeLoader::open_gate`.
    pub gated: bool,
}

#[derive(Default)]
struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

#[derive(Default)]
struct GateState {
    open: bool,
    waiting: usize,
}

impl Gate {
    fn pass(&self) {
        let mut state = self.state.lock().unwrap();
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).unwrap();
        }
    }

    fn open(&self) {
        self.state.lock().unwrap().open = true;
        self.changed.notify_all();
    }

    fn wait_for_waiter(&self, timeout: Duration) -> bool {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |state| state.waiting == 0)
            .unwrap();
        state.waiting > 0
    }
}

#[derive(Default)]
struct Shared {
    live: AtomicUsize,
    max_live: AtomicUsize,
    reclaims: AtomicUsize,
    load_calls: AtomicUsize,
    generate_calls: AtomicUsize,
    transient_releases: AtomicUsize,
    behavior: Mutex<LoadBehavior>,
    last_options: Mutex<Option<ResolvedLoadOptions>>,
    script: Mutex<ModelScript>,
    first_draws: Mutex<Vec<u64>>,
    scheduler_configs: Mutex<Vec<SchedulerConfig>>,
    gate: Gate,
    load_gated: AtomicBool,
    load_gate: Gate,
}

pub(crate) struct FakeLoader {
    shared: Arc<Shared>,
}

impl FakeLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::default(),
        })
    }

    pub fn set_behavior(&self, behavior: LoadBehavior) {
        *self.shared.behavior.lock().unwrap() = behavior;
    }

    pub fn set_script(&self, script: ModelScript) {
        *self.shared.script.lock().unwrap() = script;
    }

    pub fn open_gate(&self) {
        self.shared.gate.open();
    }

    /// Waits until a gated `generate` call is parked at the gate.
    pub fn wait_for_gate(&self, timeout: Duration) -> bool {
        self.shared.gate.wait_for_waiter(timeout)
    }

    /// Blocks every `load` call until `open_load_gate`.
    pub fn gate_loads(&self) {
        self.shared.load_gated.store(true, Ordering::SeqCst);
    }

    pub fn open_load_gate(&self) {
        self.shared.load_gate.open();
    }

    pub fn wait_for_load_gate(&self, timeout: Duration) -> bool {
        self.shared.load_gate.wait_for_waiter(timeout)
    }

    pub fn live_models(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn max_live_models(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    pub fn reclaims(&self) -> usize {
        self.shared.reclaims.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.shared.load_calls.load(Ordering::SeqCst)
    }

    pub fn generate_calls(&self) -> usize {
        self.shared.generate_calls.load(Ordering::SeqCst)
    }

    pub fn transient_releases(&self) -> usize {
        self.shared.transient_releases.load(Ordering::SeqCst)
    }

    pub fn last_options(&self) -> Option<ResolvedLoadOptions> {
        *self.shared.last_options.lock().unwrap()
    }

    /// First value each `generate` call drew from its rng, in call order.
    pub fn first_draws(&self) -> Vec<u64> {
        self.shared.first_draws.lock().unwrap().clone()
    }

    /// Every scheduler configuration applied through `reconfigure_scheduler`.
    pub fn scheduler_configs(&self) -> Vec<SchedulerConfig> {
        self.shared.scheduler_configs.lock().unwrap().clone()
    }
}

impl ModelLoader for FakeLoader {
    fn load(
        &self,
        path: &Path,
        options: &ResolvedLoadOptions,
    ) -> Result<Box<dyn ModelLike>, LoadError> {
        self.shared.load_calls.fetch_add(1, Ordering::SeqCst);
        *self.shared.last_options.lock().unwrap() = Some(*options);
        if self.shared.load_gated.load(Ordering::SeqCst) {
            self.shared.load_gate.pass();
        }
        let behavior = *self.shared.behavior.lock().unwrap();
        match behavior {
            LoadBehavior::Succeed => {}
            LoadBehavior::OutOfMemory => {
                return Err(LoadError::InsufficientMemory(format!(
                    "{} does not fit",
                    path.display()
                )))
            }
            LoadBehavior::Incompatible => {
                return Err(LoadError::IncompatibleFormat(format!(
                    "{} is not a model",
                    path.display()
                )))
            }
            LoadBehavior::Panic => panic!("{} blew up the loader", path.display()),
        }
        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);
        Ok(Box::new(FakeModel {
            shared: self.shared.clone(),
            scheduler: SchedulerConfig::default(),
            calls: 0,
        }))
    }

    fn reclaim_memory(&self) {
        self.shared.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

struct FakeModel {
    shared: Arc<Shared>,
    scheduler: SchedulerConfig,
    calls: usize,
}

impl ModelLike for FakeModel {
    fn generate(
        &mut self,
        params: &ImageParams,
        rng: &mut StdRng,
        on_step: &mut StepCallback<'_>,
    ) -> Result<DynamicImage, GenerationError> {
        let index = self.calls;
        self.calls += 1;
        self.shared.generate_calls.fetch_add(1, Ordering::SeqCst);
        let script = self.shared.script.lock().unwrap().clone();

        if script.gated {
            self.shared.gate.pass();
        }
        let draw = rng.next_u64();
        self.shared.first_draws.lock().unwrap().push(draw);

        if script.panic_on == Some(index) {
            panic!("image {index} blew up the engine");
        }
        if let Some((fail_index, err)) = script.fail_on {
            if fail_index == index {
                return Err(err);
            }
        }
        for step in 1..=params.steps {
            let progress = StepProgress {
                step_index: step,
                total_steps: params.steps,
            };
            if on_step(progress) == StepControl::Abort {
                return Err(GenerationError::Cancelled);
            }
        }
        if let Some(hook) = &script.after_image {
            hook(index);
        }

        let [r, g, b, ..] = draw.to_le_bytes();
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
            2,
            2,
            Rgb([r, g, b]),
        )))
    }

    fn scheduler_config(&self) -> SchedulerConfig {
        self.scheduler
    }

    fn reconfigure_scheduler(&mut self, config: &SchedulerConfig) {
        self.scheduler = *config;
        self.shared.scheduler_configs.lock().unwrap().push(*config);
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_memory_offload: true,
            supports_sliced_decoding: true,
            supports_tiled_decoding: false,
            supports_quantization: false,
        }
    }

    fn enable_memory_saver(&mut self, saver: MemorySaver) -> Result<(), EngineError> {
        match saver {
            MemorySaver::TiledDecoding => Err(EngineError::Unsupported("tiled decoding")),
            _ => Ok(()),
        }
    }

    fn release_transient(&mut self) {
        self.shared.transient_releases.fetch_add(1, Ordering::SeqCst);
    }
}

impl Drop for FakeModel {
    fn drop(&mut self) {
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keeps saved metadata in memory; can be told to fail or panic on every save.
#[derive(Default)]
pub(crate) struct MemoryStore {
    saved: Mutex<Vec<ImageMetadata>>,
    failing: AtomicBool,
    panicking: AtomicBool,
}

impl MemoryStore {
    pub fn fail_saves(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn panic_on_save(&self) {
        self.panicking.store(true, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<ImageMetadata> {
        self.saved.lock().unwrap().clone()
    }
}

impl ImageStore for MemoryStore {
    fn save(&self, _image: &DynamicImage, metadata: &ImageMetadata) -> Result<PathBuf, PersistError> {
        if self.panicking.load(Ordering::SeqCst) {
            panic!("store blew up while saving");
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "output directory is read-only",
            )));
        }
        let mut saved = self.saved.lock().unwrap();
        saved.push(metadata.clone());
        Ok(PathBuf::from(format!("memory/image_{}.png", saved.len())))
    }

    fn clear(&self) -> Result<usize, PersistError> {
        let mut saved = self.saved.lock().unwrap();
        let removed = saved.len();
        saved.clear();
        Ok(removed)
    }
}
