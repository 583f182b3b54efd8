//! Temperature acquisition and fan-out.
//!
//! Two background tasks share the monitor:
//!
//! * sampling, once a second: read the sensor, smooth over the last ten raw
//!   readings, append to history and deliver to every subscriber;
//! * pruning, once a minute: drop history older than thirty minutes.
//!
//! History and the subscriber registry sit behind separate locks so that
//! subscription churn never waits on history readers and vice versa.
//!
//! Subscriber channels are bounded. A subscriber that has not made room
//! within [`DELIVERY_TIMEOUT`], or whose receiver is gone, is dropped from the
//! registry so one stuck consumer cannot stall the others or the sampler.

use chrono::Duration as ChronoDuration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::SendTimeoutError};
use tokio::task::{self, JoinHandle};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::fifo::Fifo;
use crate::sensor::{Sample, Sampler};

const SAMPLE_PERIOD: Duration = Duration::from_secs(1);
const FAULT_BACKOFF: Duration = Duration::from_secs(1);
const PRUNE_PERIOD: Duration = Duration::from_secs(60);
const SMOOTHING_WINDOW: usize = 10;

pub const HISTORY_MINUTES: i64 = 30;
pub const SUBSCRIBER_CAPACITY: usize = 32;
pub const DELIVERY_TIMEOUT: Duration = Duration::from_millis(500);

pub struct Monitor<S> {
    sampler: Arc<Mutex<S>>,
    clock: Arc<dyn Clock>,
    history: RwLock<Vec<Sample>>,
    subscriptions: Mutex<HashMap<Uuid, mpsc::Sender<Sample>>>,
    smoothing: Mutex<Fifo>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: Sampler + 'static> Monitor<S> {
    pub fn new(sampler: S, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            sampler: Arc::new(Mutex::new(sampler)),
            clock,
            history: RwLock::new(Vec::new()),
            subscriptions: Mutex::new(HashMap::new()),
            smoothing: Mutex::new(Fifo::new(SMOOTHING_WINDOW)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Starts the sampling and pruning tasks.
    pub fn run(self: &Arc<Self>) {
        let sampling = tokio::spawn(Arc::clone(self).sampling_loop());
        let pruning = tokio::spawn(Arc::clone(self).pruning_loop());
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(sampling);
        tasks.push(pruning);
    }

    async fn sampling_loop(self: Arc<Self>) {
        loop {
            let sampler = Arc::clone(&self.sampler);
            let result = task::spawn_blocking(move || {
                sampler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .sample()
            })
            .await;

            match result {
                Ok(Ok(sample)) => {
                    self.ingest(sample).await;
                    sleep(SAMPLE_PERIOD).await;
                }
                Ok(Err(fault)) => {
                    warn!(%fault, "failed to sample temperature");
                    sleep(FAULT_BACKOFF).await;
                }
                Err(e) => {
                    error!(error = %e, "temperature sampler panicked");
                    sleep(FAULT_BACKOFF).await;
                }
            }
        }
    }

    async fn pruning_loop(self: Arc<Self>) {
        loop {
            self.prune();
            sleep(PRUNE_PERIOD).await;
        }
    }
}

impl<S> Monitor<S> {
    /// Smooths a raw reading, records it and fans it out. The sample is
    /// stamped with the monitor's clock so history and pruning agree.
    pub async fn ingest(&self, raw: Sample) -> Sample {
        let value = {
            let mut smoothing = self.smoothing.lock().unwrap_or_else(PoisonError::into_inner);
            smoothing.push(raw.value);
            round_tenth(smoothing.average())
        };
        let sample = Sample {
            value,
            observed_at: self.clock.now(),
        };

        self.history
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sample);
        self.publish(sample).await;
        sample
    }

    async fn publish(&self, sample: Sample) {
        let subscribers: Vec<(Uuid, mpsc::Sender<Sample>)> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut dropped = Vec::new();
        for (id, tx) in subscribers {
            match tx.send_timeout(sample, DELIVERY_TIMEOUT).await {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!(%id, "temperature subscriber stalled, removing it");
                    dropped.push(id);
                }
                Err(SendTimeoutError::Closed(_)) => {
                    debug!(%id, "temperature subscriber went away");
                    dropped.push(id);
                }
            }
        }

        if !dropped.is_empty() {
            let mut subscriptions = self.subscriptions.lock().unwrap_or_else(PoisonError::into_inner);
            for id in dropped {
                subscriptions.remove(&id);
            }
        }
    }

    /// Removes every sample observed more than thirty minutes ago. Returns the
    /// number removed.
    pub fn prune(&self) -> usize {
        let cutoff = self.clock.now() - ChronoDuration::minutes(HISTORY_MINUTES);
        let mut history = self.history.write().unwrap_or_else(PoisonError::into_inner);
        let before = history.len();
        history.retain(|s| s.observed_at >= cutoff);
        let pruned = before - history.len();
        if pruned > 0 {
            debug!(pruned, remaining = history.len(), "pruned temperature history");
        }
        pruned
    }

    pub fn subscribe(&self) -> (Uuid, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = Uuid::new_v4();
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        debug!(%id, "temperature subscriber added");
        (id, rx)
    }

    pub fn unsubscribe(&self, id: Uuid) {
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            debug!(%id, "temperature subscriber removed");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn history(&self) -> Vec<Sample> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn latest(&self) -> Option<Sample> {
        self.history
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .copied()
    }

    /// Stops both tasks and drops every subscriber, which ends their
    /// receive loops.
    pub fn shutdown(&self) {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        if !tasks.is_empty() {
            info!("stopping temperature monitor");
        }
        for t in tasks {
            t.abort();
        }
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

fn round_tenth(v: f32) -> f32 {
    (v * 10.0).round() / 10.0
}
