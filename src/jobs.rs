//! Generation jobs: dispatch, progress tracking and guaranteed finalization.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sqlx::SqlitePool;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::article::assemble;
use crate::backend::{ModelManager, TextGenerator};
use crate::models::{Backend, Job, JobStatus, Style, Topic};
use crate::orchestrator::{GenerationRequest, Orchestrator, ProgressSink};
use crate::scheduler::local_day_bounds;
use crate::store;

/// Writes orchestrator checkpoints to the job record.
pub struct JobTracker {
    pool: SqlitePool,
    job_id: String,
}

impl JobTracker {
    pub fn new(pool: SqlitePool, job_id: impl Into<String>) -> Self {
        Self {
            pool,
            job_id: job_id.into(),
        }
    }
}

impl ProgressSink for JobTracker {
    async fn report(&self, progress: u8) {
        match store::record_progress(&self.pool, &self.job_id, progress).await {
            Ok(true) => debug!(job = %self.job_id, progress, "progress"),
            Ok(false) => debug!(job = %self.job_id, progress, "progress ignored, job not generating"),
            Err(e) => warn!(job = %self.job_id, error = %e, "failed to record progress"),
        }
    }
}

/// Per-request knobs; unset fields fall back to the topic's defaults.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub style: Option<Style>,
    pub backend: Option<Backend>,
    pub priority: Option<i64>,
}

/// Removes a topic from the in-flight set on drop, including on panic.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    topic_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.topic_id);
    }
}

/// Drive one job from `draft` to `ready` or `failed`. Never returns an error:
/// every failure, including a panic inside the generation, ends in `failed`.
pub async fn run_job<R, L>(
    pool: SqlitePool,
    engine: Arc<Orchestrator<R, L>>,
    job: Job,
    topic: Topic,
    backend: Option<Backend>,
) -> JobStatus
where
    R: TextGenerator + 'static,
    L: TextGenerator + ModelManager + 'static,
{
    let job_id = job.id.clone();
    let work = tokio::spawn(execute(pool.clone(), engine, job, topic, backend));

    let failure = match work.await {
        Ok(Ok(())) => return JobStatus::Ready,
        Ok(Err(e)) => format!("{e:#}"),
        Err(join_err) if join_err.is_panic() => "generation task panicked".to_string(),
        Err(join_err) => format!("generation task aborted: {join_err}"),
    };

    error!(job = %job_id, error = %failure, "generation job failed");
    match store::fail_job(&pool, &job_id, &failure).await {
        Ok(true) => {}
        Ok(false) => warn!(job = %job_id, "job was already terminal when marking failed"),
        Err(e) => error!(job = %job_id, error = %e, "could not mark job failed"),
    }
    JobStatus::Failed
}

async fn execute<R, L>(
    pool: SqlitePool,
    engine: Arc<Orchestrator<R, L>>,
    job: Job,
    topic: Topic,
    backend: Option<Backend>,
) -> Result<()>
where
    R: TextGenerator,
    L: TextGenerator + ModelManager,
{
    store::start_job(&pool, &job.id).await?;
    info!(job = %job.id, topic = %topic.name, "generation started");

    let request = GenerationRequest {
        topic: &topic.name,
        description: &topic.description,
        language: &job.language,
        style: job.style,
        backend_override: backend,
    };
    let tracker = JobTracker::new(pool.clone(), job.id.clone());
    let generated = engine.generate(&request, &tracker).await?;

    let article = assemble(&topic.name, &generated.text);
    store::complete_job(
        &pool,
        &job.id,
        &article.title,
        &article.content,
        generated.backend,
        &generated.model,
    )
    .await?;

    info!(
        job = %job.id,
        title = %article.title,
        backend = %generated.backend,
        cached = generated.cached,
        "generation complete"
    );
    Ok(())
}

/// A job accepted by the dispatcher. Awaiting `handle` yields its final status.
pub struct Dispatched {
    pub job: Job,
    pub handle: JoinHandle<JobStatus>,
}

/// Starts generation jobs, at most one per topic, bounded by a semaphore.
pub struct Dispatcher<R, L> {
    pool: SqlitePool,
    engine: Arc<Orchestrator<R, L>>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    cancel: CancellationToken,
}

impl<R, L> Clone for Dispatcher<R, L> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            engine: self.engine.clone(),
            semaphore: self.semaphore.clone(),
            in_flight: self.in_flight.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl<R, L> Dispatcher<R, L>
where
    R: TextGenerator + 'static,
    L: TextGenerator + ModelManager + 'static,
{
    pub fn new(
        pool: SqlitePool,
        engine: Arc<Orchestrator<R, L>>,
        max_concurrent: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            engine,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            cancel,
        }
    }

    pub fn engine(&self) -> &Arc<Orchestrator<R, L>> {
        &self.engine
    }

    /// Create a job for `topic` and start it in the background.
    /// Returns `None` if the topic already has a generation running.
    pub async fn dispatch(&self, topic: &Topic, options: JobOptions) -> Result<Option<Dispatched>> {
        let inserted = self
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(topic.id.clone());
        if !inserted {
            debug!(topic = %topic.name, "generation already in flight");
            return Ok(None);
        }
        let guard = InFlightGuard {
            set: self.in_flight.clone(),
            topic_id: topic.id.clone(),
        };

        // Another process may own a generating job for this topic.
        if store::count_topic_jobs(&self.pool, &topic.id, JobStatus::Generating).await? > 0 {
            debug!(topic = %topic.name, "topic already has a generating job");
            return Ok(None);
        }

        let style = options.style.unwrap_or(topic.style);
        let priority = options.priority.unwrap_or(topic.priority);
        let job = store::create_job(&self.pool, topic, style, priority)
            .await
            .context("creating generation job")?;
        info!(job = %job.id, topic = %topic.name, style = %style, priority, "job dispatched");

        let pool = self.pool.clone();
        let engine = self.engine.clone();
        let semaphore = self.semaphore.clone();
        let cancel = self.cancel.clone();
        let task_job = job.clone();
        let topic = topic.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;

            let permit = tokio::select! {
                permit = semaphore.acquire_owned() => permit.ok(),
                _ = cancel.cancelled() => None,
            };
            if permit.is_none() || cancel.is_cancelled() {
                warn!(job = %task_job.id, "shutting down before generation started");
                if let Err(e) = store::fail_job(&pool, &task_job.id, "cancelled: shutting down").await {
                    error!(job = %task_job.id, error = %e, "could not mark job failed");
                }
                return JobStatus::Failed;
            }

            let status = run_job(pool, engine, task_job, topic, options.backend).await;
            drop(permit);
            status
        });

        Ok(Some(Dispatched { job, handle }))
    }

    /// Start a job for every active topic that is idle at `now`: nothing
    /// generating, nothing ready from the current local day, and a latest job
    /// that did not fail. A failed topic waits for an explicit dispatch.
    /// Returns the number of jobs started.
    pub async fn dispatch_idle_topics(&self, now: DateTime<Utc>, tz: Tz) -> Result<usize> {
        let (day_start, day_end) = local_day_bounds(now, tz);
        let topics = store::get_active_topics(&self.pool).await?;
        let mut started = 0;
        for topic in &topics {
            match store::latest_topic_job_status(&self.pool, &topic.id).await? {
                Some(JobStatus::Generating) => continue,
                Some(JobStatus::Failed) => {
                    debug!(topic = %topic.name, "last generation failed, waiting for a manual run");
                    continue;
                }
                _ => {}
            }
            let ready_today =
                store::count_topic_jobs_created_between(&self.pool, &topic.id, JobStatus::Ready, day_start, day_end)
                    .await?;
            if ready_today > 0 {
                continue;
            }
            if self.dispatch(topic, JobOptions::default()).await?.is_some() {
                started += 1;
            }
        }
        Ok(started)
    }
}
