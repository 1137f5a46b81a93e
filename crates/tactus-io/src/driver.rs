//! Runs a [`Scheduler`] on a backend and keeps it running when the backend dies.
//!
//! The driver owns the scheduler behind a mutex that the audio callback only
//! ever `try_lock`s; if the edit side holds it, that callback outputs silence.
//! A supervisor thread receives backend events. On
//! [`BackendError::DeviceLost`] it drops the dead stream and reopens the same
//! negotiated configuration on a [`NullBackend`], so the transport keeps moving
//! and the project stays responsive, just muted.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tactus_core::Scheduler;

use crate::backend::{AudioBackend, BlockCallback, ErrorCallback, NegotiatedConfig, StreamHandle};
use crate::null_backend::NullBackend;
use crate::stats::{BackendStats, StatsSnapshot};
use crate::{BackendError, Result};

const EVENT_QUEUE: usize = 64;

struct Active {
    backend: String,
    handle: Option<StreamHandle>,
    failed_over: bool,
}

/// Everything the callbacks and the supervisor share.
#[derive(Clone)]
struct Shared {
    scheduler: Arc<Mutex<Scheduler>>,
    stats: Arc<BackendStats>,
    active: Arc<Mutex<Active>>,
    events: Sender<BackendError>,
    config: NegotiatedConfig,
}

impl Shared {
    fn block_callback(&self) -> BlockCallback {
        let scheduler = Arc::clone(&self.scheduler);
        let stats = Arc::clone(&self.stats);
        let period = self.config.period();
        Box::new(move |io| {
            let start = Instant::now();
            match scheduler.try_lock() {
                Some(mut scheduler) => scheduler.process(io),
                None => io.output.fill(0.0),
            }
            stats.record_callback(start.elapsed(), period);
        })
    }

    fn error_callback(&self) -> ErrorCallback {
        let stats = Arc::clone(&self.stats);
        let events = self.events.clone();
        Box::new(move |error| match error {
            BackendError::Xrun => stats.record_xrun(),
            other => {
                let _ = events.try_send(other);
            }
        })
    }

    fn open_null(&self) -> Result<StreamHandle> {
        NullBackend::new().open(&self.config, self.block_callback(), self.error_callback())
    }

    fn fail_over(&self, reason: &str) {
        let mut active = self.active.lock();
        if active.failed_over {
            return;
        }
        tracing::warn!(backend = %active.backend, "device lost ({reason}), failing over to null backend");
        active.handle = None;
        match self.open_null() {
            Ok(handle) => {
                active.handle = Some(handle);
                active.backend = "null".to_string();
                active.failed_over = true;
                self.stats.record_failover();
            }
            Err(e) => tracing::warn!("null backend failed to start: {e}"),
        }
    }
}

fn supervise(shared: &Shared, events: &Receiver<BackendError>, stop: &Receiver<()>) {
    loop {
        crossbeam_channel::select! {
            recv(events) -> event => match event {
                Ok(BackendError::DeviceLost(reason)) => {
                    shared.stats.record_device_loss();
                    shared.fail_over(&reason);
                }
                Ok(BackendError::Stream(message)) => tracing::warn!("backend stream error: {message}"),
                Ok(BackendError::Xrun) => {}
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

/// Owns a scheduler and the stream driving it.
pub struct AudioDriver {
    shared: Shared,
    stop: Option<Sender<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl AudioDriver {
    /// Opens `config` on `backend` and starts calling `scheduler` for every block.
    ///
    /// `config` must come from `backend.negotiate()`, and the engine should
    /// already run at its sample rate and block size. If the backend refuses
    /// to open, the driver starts on the null backend instead.
    ///
    /// # Errors
    ///
    /// Only if neither the backend nor the null fallback can start.
    pub fn start(
        backend: Box<dyn AudioBackend>,
        config: NegotiatedConfig,
        scheduler: Scheduler,
    ) -> Result<Self> {
        let (events_tx, events_rx) = crossbeam_channel::bounded(EVENT_QUEUE);
        let shared = Shared {
            scheduler: Arc::new(Mutex::new(scheduler)),
            stats: Arc::new(BackendStats::new()),
            active: Arc::new(Mutex::new(Active {
                backend: backend.name().to_string(),
                handle: None,
                failed_over: false,
            })),
            events: events_tx,
            config,
        };

        match backend.open(&shared.config, shared.block_callback(), shared.error_callback()) {
            Ok(handle) => shared.active.lock().handle = Some(handle),
            Err(e) => {
                tracing::warn!(backend = backend.name(), "stream failed to open: {e}");
                let handle = shared.open_null()?;
                let mut active = shared.active.lock();
                active.handle = Some(handle);
                active.backend = "null".to_string();
                active.failed_over = true;
                shared.stats.record_failover();
            }
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
        let supervisor_shared = shared.clone();
        let supervisor = std::thread::Builder::new()
            .name("tactus-driver".into())
            .spawn(move || supervise(&supervisor_shared, &events_rx, &stop_rx))?;

        tracing::info!(
            backend = %shared.active.lock().backend,
            sample_rate = shared.config.sample_rate,
            block_size = shared.config.block_size,
            "audio driver started"
        );
        Ok(Self {
            shared,
            stop: Some(stop_tx),
            supervisor: Some(supervisor),
        })
    }

    /// Negotiated stream configuration.
    pub fn config(&self) -> &NegotiatedConfig {
        &self.shared.config
    }

    /// Name of the backend currently producing callbacks.
    pub fn backend_name(&self) -> String {
        self.shared.active.lock().backend.clone()
    }

    /// True once the driver has switched to the null backend.
    pub fn is_failed_over(&self) -> bool {
        self.shared.active.lock().failed_over
    }

    /// Backend counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Nominal callback period.
    pub fn period(&self) -> Duration {
        self.shared.config.period()
    }

    /// Runs `f` with the scheduler locked.
    ///
    /// A callback arriving meanwhile outputs silence, so keep `f` short.
    pub fn with_scheduler<R>(&self, f: impl FnOnce(&mut Scheduler) -> R) -> R {
        f(&mut self.shared.scheduler.lock())
    }

    /// Stops the stream and returns the scheduler.
    ///
    /// Returns `None` if a backend thread still holds a callback.
    pub fn stop(mut self) -> Option<Scheduler> {
        self.shutdown();
        let scheduler = Arc::clone(&self.shared.scheduler);
        drop(self);
        Arc::try_unwrap(scheduler).ok().map(Mutex::into_inner)
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(supervisor) = self.supervisor.take() {
            let _ = supervisor.join();
        }
        if self.shared.active.lock().handle.take().is_some() {
            tracing::info!("audio driver stopped");
        }
    }
}

impl Drop for AudioDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for AudioDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioDriver")
            .field("backend", &self.backend_name())
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
