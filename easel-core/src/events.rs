//! Worker → control surface notifications.

use std::sync::Arc;

use image::DynamicImage;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::trace;

use crate::model_manager::ModelInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEvent {
    /// Progress over the whole batch, in `[0, 1]`.
    pub fraction: f64,
    pub image_index: usize,
    pub total_images: usize,
    pub step_index: usize,
    pub total_steps: usize,
    pub label: String,
}

impl ProgressEvent {
    pub fn percent(&self) -> u32 {
        (self.fraction * 100.0).round() as u32
    }
}

#[derive(Debug, Clone)]
pub enum Event {
    StatusChanged {
        message: String,
        severity: Severity,
    },
    Progress(ProgressEvent),
    /// The base seed actually used by a batch; differs from the request when it asked for a
    /// random seed.
    SeedResolved {
        seed: u64,
    },
    ModelLoaded(ModelInfo),
    ModelUnloaded,
    ImageReady {
        image_index: usize,
        image: Arc<DynamicImage>,
        seed_used: u64,
        duration_ms: u64,
    },
    BatchFinished {
        cancelled: bool,
        completed: usize,
        failed: usize,
    },
}

/// Producer half. Sending never blocks and never fails from the worker's point of view.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<Event>,
}

impl EventSender {
    pub fn emit(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event receiver dropped, discarding event");
        }
    }

    pub fn status(&self, message: impl Into<String>, severity: Severity) {
        self.emit(Event::StatusChanged {
            message: message.into(),
            severity,
        });
    }

    pub fn progress(&self, progress: ProgressEvent) {
        self.emit(Event::Progress(progress));
    }
}

#[derive(Debug)]
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Blocking receive for non-async consumers. Must not be called from inside a runtime.
    pub fn blocking_recv(&mut self) -> Option<Event> {
        self.rx.blocking_recv()
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Event> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}

pub fn event_channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSender { tx }, EventReceiver { rx })
}
