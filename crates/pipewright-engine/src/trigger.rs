use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use pipewright_core::config::ScheduleConfig;
use pipewright_core::error::{PipewrightError, Result};
use pipewright_core::traits::TriggerSource;
use pipewright_core::types::{TriggerEvent, TriggerInfo};

use crate::orchestrator::Orchestrator;

// ── Schedule ────────────────────────────────────────────────────

struct ScheduledJob {
    name: String,
    pipeline_id: String,
    schedule: Schedule,
    data: Option<Value>,
}

/// Fires pipelines on cron expressions (with seconds field).
pub struct ScheduleTrigger {
    jobs: Vec<ScheduledJob>,
}

impl ScheduleTrigger {
    pub fn new(configs: &[ScheduleConfig]) -> Self {
        let mut jobs = Vec::new();

        for config in configs {
            match Schedule::from_str(&config.schedule) {
                Ok(schedule) => {
                    jobs.push(ScheduledJob {
                        name: config.name.clone(),
                        pipeline_id: config.pipeline_id.clone(),
                        schedule,
                        data: config.data.clone(),
                    });
                    info!(name = %config.name, schedule = %config.schedule, "Schedule registered");
                }
                Err(e) => {
                    warn!(
                        name = %config.name,
                        schedule = %config.schedule,
                        error = %e,
                        "Invalid cron expression, skipping schedule"
                    );
                }
            }
        }

        Self { jobs }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Earliest upcoming fire time across all jobs, never at or before a job's last fire.
    fn next_fire(&self, last_fired: &[Option<DateTime<Utc>>]) -> Option<(DateTime<Utc>, usize)> {
        let now = Utc::now();
        self.jobs
            .iter()
            .enumerate()
            .filter_map(|(i, job)| {
                let after = match last_fired[i] {
                    Some(last) if last > now => last,
                    _ => now,
                };
                job.schedule.after(&after).next().map(|at| (at, i))
            })
            .min_by_key(|(at, _)| *at)
    }
}

impl TriggerSource for ScheduleTrigger {
    fn name(&self) -> &str {
        "schedule"
    }

    fn start(
        &self,
        tx: mpsc::Sender<TriggerEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.jobs.is_empty() {
                info!("No schedules configured, schedule trigger idle");
                cancel.cancelled().await;
                return Ok(());
            }

            info!(count = self.jobs.len(), "Schedule trigger started");
            let mut last_fired: Vec<Option<DateTime<Utc>>> = vec![None; self.jobs.len()];

            while let Some((fire_at, index)) = self.next_fire(&last_fired) {
                let job = &self.jobs[index];
                let delay = (fire_at - Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_millis(0));

                debug!(
                    job = %job.name,
                    fire_at = %fire_at.format("%H:%M:%S"),
                    delay_ms = delay.as_millis() as u64,
                    "Next schedule queued"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        last_fired[index] = Some(fire_at);
                        info!(job = %job.name, pipeline_id = %job.pipeline_id, "Schedule fired");
                        let event = TriggerEvent {
                            pipeline_id: job.pipeline_id.clone(),
                            trigger: TriggerInfo::schedule(job.name.clone(), job.data.clone()),
                        };
                        if tx.send(event).await.is_err() {
                            debug!("Trigger channel closed, schedule trigger stopping");
                            break;
                        }
                    }
                    _ = cancel.cancelled() => {
                        info!("Schedule trigger shutting down");
                        break;
                    }
                }
            }
            Ok(())
        })
    }
}

// ── Manual ──────────────────────────────────────────────────────

/// Trigger source fed by a [`ManualSender`].
pub struct ManualTrigger {
    rx: Mutex<mpsc::Receiver<TriggerEvent>>,
}

/// Sending half of a [`ManualTrigger`].
#[derive(Clone)]
pub struct ManualSender {
    tx: mpsc::Sender<TriggerEvent>,
}

impl ManualTrigger {
    pub fn channel(buffer: usize) -> (Self, ManualSender) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { rx: Mutex::new(rx) }, ManualSender { tx })
    }
}

impl ManualSender {
    /// Queue a manual run of `pipeline_id`.
    pub async fn fire(&self, pipeline_id: impl Into<String>, data: Option<Value>) -> Result<()> {
        let event = TriggerEvent {
            pipeline_id: pipeline_id.into(),
            trigger: TriggerInfo::manual(data),
        };
        self.tx
            .send(event)
            .await
            .map_err(|_| PipewrightError::Config("manual trigger is not running".to_string()))
    }
}

impl TriggerSource for ManualTrigger {
    fn name(&self) -> &str {
        "manual"
    }

    fn start(
        &self,
        tx: mpsc::Sender<TriggerEvent>,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let mut rx = self.rx.lock().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
            Ok(())
        })
    }
}

// ── Dispatcher ──────────────────────────────────────────────────

/// Feeds trigger events from every source to the orchestrator, one run at a time.
pub struct TriggerDispatcher {
    orchestrator: Arc<Orchestrator>,
    sources: Vec<Arc<dyn TriggerSource>>,
}

impl TriggerDispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            sources: Vec::new(),
        }
    }

    pub fn add_source(&mut self, source: Arc<dyn TriggerSource>) {
        self.sources.push(source);
    }

    /// Run until cancelled or every source has stopped. Returns how many runs were dispatched.
    pub async fn run(&self, cancel: CancellationToken) -> Result<usize> {
        let (tx, mut rx) = mpsc::channel(64);
        let sources_cancel = cancel.child_token();

        let mut handles = Vec::new();
        for source in &self.sources {
            let source = source.clone();
            let tx = tx.clone();
            let cancel = sources_cancel.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = source.start(tx, cancel).await {
                    error!(source = %source.name(), error = %e, "Trigger source failed");
                }
            }));
        }
        drop(tx);

        info!(sources = self.sources.len(), "Trigger dispatcher started");
        let mut dispatched = 0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Trigger dispatcher shutting down");
                    break;
                }
                event = rx.recv() => {
                    let Some(event) = event else {
                        debug!("All trigger sources stopped");
                        break;
                    };
                    dispatched += 1;
                    match self.orchestrator.run(&event.pipeline_id, event.trigger).await {
                        Ok(record) => info!(
                            pipeline_id = %event.pipeline_id,
                            execution_id = %record.id,
                            "Triggered run completed"
                        ),
                        Err(e) => error!(
                            pipeline_id = %event.pipeline_id,
                            error = %e,
                            "Triggered run failed"
                        ),
                    }
                }
            }
        }

        sources_cancel.cancel();
        for handle in handles {
            handle.await.ok();
        }
        Ok(dispatched)
    }
}
