use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use base64::{prelude::BASE64_STANDARD, Engine};
use easel_core::{
    event_channel,
    history::PromptHistoryStore,
    persist::DiskImageStore,
    EngineConfig, Event, EventReceiver, ModelInfo, Orchestrator, ProgressEvent, Severity,
    StableDiffusionLoader,
};
use image::DynamicImage;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Event as sent to HTTP clients. Images travel as base64 PNG.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Status {
        message: String,
        severity: Severity,
    },
    Progress(ProgressEvent),
    SeedResolved {
        seed: u64,
    },
    ModelLoaded {
        model: ModelInfo,
    },
    ModelUnloaded,
    ImageReady {
        image_index: usize,
        seed_used: u64,
        duration_ms: u64,
        png_base64: String,
    },
    BatchFinished {
        cancelled: bool,
        completed: usize,
        failed: usize,
    },
}

impl WireEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status { .. } => "status",
            Self::Progress(_) => "progress",
            Self::SeedResolved { .. } => "seed_resolved",
            Self::ModelLoaded { .. } => "model_loaded",
            Self::ModelUnloaded => "model_unloaded",
            Self::ImageReady { .. } => "image_ready",
            Self::BatchFinished { .. } => "batch_finished",
        }
    }

    fn from_event(event: Event) -> Result<Self> {
        Ok(match event {
            Event::StatusChanged { message, severity } => Self::Status { message, severity },
            Event::Progress(progress) => Self::Progress(progress),
            Event::SeedResolved { seed } => Self::SeedResolved { seed },
            Event::ModelLoaded(model) => Self::ModelLoaded { model },
            Event::ModelUnloaded => Self::ModelUnloaded,
            Event::ImageReady {
                image_index,
                image,
                seed_used,
                duration_ms,
            } => Self::ImageReady {
                image_index,
                seed_used,
                duration_ms,
                png_base64: image_to_base64_png(&image)?,
            },
            Event::BatchFinished {
                cancelled,
                completed,
                failed,
            } => Self::BatchFinished {
                cancelled,
                completed,
                failed,
            },
        })
    }
}

fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
        .context("failed to encode PNG")?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub last_status: Option<StatusLine>,
    pub last_progress: Option<ProgressEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusLine {
    pub message: String,
    pub severity: Severity,
}

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub gallery: Arc<DiskImageStore>,
    pub config: Arc<EngineConfig>,
    events: broadcast::Sender<WireEvent>,
    snapshot: Arc<Mutex<Snapshot>>,
    shutdown: watch::Sender<bool>,
}

impl AppState {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .ensure_dirs()
            .context("failed to create output and models directories")?;
        let gallery = Arc::new(DiskImageStore::new(&config.output_dir, config.metadata_file()));
        let history = PromptHistoryStore::load(config.history_file(), config.history_capacity);
        let (tx, rx) = event_channel();
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::new(StableDiffusionLoader),
            gallery.clone(),
            history,
            tx,
        ));
        let (events, _) = broadcast::channel(256);
        let (shutdown, _) = watch::channel(false);

        let state = Self {
            orchestrator,
            gallery,
            config: Arc::new(config),
            events,
            snapshot: Arc::default(),
            shutdown,
        };
        state.spawn_forwarder(rx)?;
        Ok(state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WireEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shutdown_requested(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ends open event streams so graceful shutdown does not wait on them.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Relative model paths are looked up in the models directory.
    pub fn resolve_model_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() || path.exists() {
            path.to_path_buf()
        } else {
            self.config.models_dir.join(path)
        }
    }

    /// Moves events from the orchestrator onto the broadcast channel. Runs on its own thread so
    /// PNG encoding stays off the async runtime.
    fn spawn_forwarder(&self, mut rx: EventReceiver) -> Result<()> {
        let events = self.events.clone();
        let snapshot = self.snapshot.clone();
        std::thread::Builder::new()
            .name("easel-events".to_string())
            .spawn(move || {
                while let Some(event) = rx.blocking_recv() {
                    let wire = match WireEvent::from_event(event) {
                        Ok(wire) => wire,
                        Err(err) => {
                            warn!("dropping event: {err:#}");
                            continue;
                        }
                    };
                    {
                        let mut snapshot = snapshot.lock().unwrap_or_else(PoisonError::into_inner);
                        match &wire {
                            WireEvent::Status { message, severity } => {
                                snapshot.last_status = Some(StatusLine {
                                    message: message.clone(),
                                    severity: *severity,
                                })
                            }
                            WireEvent::Progress(progress) => {
                                snapshot.last_progress = Some(progress.clone())
                            }
                            _ => {}
                        }
                    }
                    // No subscribers is not an error.
                    let _ = events.send(wire);
                }
                debug!("event channel closed");
            })
            .context("failed to spawn event forwarder")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn image_events_carry_png_payload() {
        let image = Arc::new(DynamicImage::ImageRgb8(RgbImage::new(2, 2)));
        let wire = WireEvent::from_event(Event::ImageReady {
            image_index: 0,
            image,
            seed_used: 42,
            duration_ms: 10,
        })
        .unwrap();
        let WireEvent::ImageReady { png_base64, .. } = &wire else {
            panic!("expected image_ready, got {wire:?}");
        };
        let bytes = BASE64_STANDARD.decode(png_base64).unwrap();
        assert_eq!(&bytes[1..4], b"PNG");

        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["type"], "image_ready");
        assert_eq!(json["seed_used"], 42);
    }

    #[test]
    fn progress_events_flatten_into_tagged_json() {
        let wire = WireEvent::from_event(Event::Progress(ProgressEvent {
            fraction: 0.5,
            image_index: 1,
            total_images: 2,
            step_index: 0,
            total_steps: 20,
            label: "50%".to_string(),
        }))
        .unwrap();
        assert_eq!(wire.name(), "progress");
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["fraction"], 0.5);
    }
}
