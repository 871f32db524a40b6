use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

use crate::{
    context::ServiceContext,
    status::StatusWriter,
    sync::{SyncMode, SyncOutcome},
};

/// Wall-clock source used to compute cron fire times.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Wall clock that advances with the tokio timer, so paused-time tests see
/// cron schedules fire deterministically.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin_wall: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    pub fn starting_at(origin_wall: DateTime<Utc>) -> Self {
        Self {
            origin_wall,
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.origin_wall + elapsed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Scheduled,
    CycleRunning,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum SchedulerError {
    #[error("scheduler is already running")]
    AlreadyRunning,
    #[error("status writer was lost when the collection task panicked")]
    WriterLost,
}

struct Running {
    cancel: CancellationToken,
    collection: JoinHandle<StatusWriter>,
    jobs: Vec<JoinHandle<()>>,
}

/// Interval collection plus cron upload and sync triggers. `stop` cancels
/// pending triggers but lets a running cycle finish.
pub struct Scheduler {
    ctx: Arc<ServiceContext>,
    clock: Arc<dyn Clock>,
    writer: Option<StatusWriter>,
    state: Arc<watch::Sender<SchedulerState>>,
    running: Option<Running>,
}

impl Scheduler {
    pub fn new(ctx: Arc<ServiceContext>, writer: StatusWriter, clock: Arc<dyn Clock>) -> Self {
        let (state, _) = watch::channel(SchedulerState::Stopped);
        Self {
            ctx,
            clock,
            writer: Some(writer),
            state: Arc::new(state),
            running: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerState> {
        self.state.subscribe()
    }

    /// Arm all triggers. The first collection cycle starts immediately.
    pub fn start(&mut self) -> Result<(), SchedulerError> {
        if self.running.is_some() {
            return Err(SchedulerError::AlreadyRunning);
        }
        let writer = self.writer.take().ok_or(SchedulerError::WriterLost)?;
        let schedule = &self.ctx.config.schedule;
        self.ctx.config.log_sources();

        let cancel = CancellationToken::new();
        let collection = tokio::spawn(collection_loop(
            self.ctx.clone(),
            writer,
            schedule.collection_interval.value,
            self.state.clone(),
            cancel.clone(),
        ));

        let upload = {
            let ctx = self.ctx.clone();
            tokio::spawn(cron_loop(
                "upload",
                schedule.upload.schedule.value.schedule.clone(),
                self.clock.clone(),
                cancel.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        if let Err(e) = ctx.uploader.upload().await {
                            tracing::warn!(error = %e, "upload failed");
                        }
                    }
                },
            ))
        };
        let remote_sync = {
            let ctx = self.ctx.clone();
            tokio::spawn(cron_loop(
                "remote_sync",
                schedule.remote_sync.schedule.value.schedule.clone(),
                self.clock.clone(),
                cancel.clone(),
                move || {
                    let ctx = ctx.clone();
                    async move {
                        if let SyncOutcome::Failed { error, .. } =
                            ctx.sync.trigger(SyncMode::Scheduled).await
                        {
                            tracing::warn!(error = %error, "scheduled remote sync failed");
                        }
                    }
                },
            ))
        };

        self.state.send_replace(SchedulerState::Scheduled);
        self.running = Some(Running {
            cancel,
            collection,
            jobs: vec![upload, remote_sync],
        });
        tracing::info!("scheduler started");
        Ok(())
    }

    /// Cancel every trigger and wait for in-flight work to finish.
    pub async fn stop(&mut self) {
        let Some(running) = self.running.take() else {
            return;
        };
        running.cancel.cancel();
        if self.state() == SchedulerState::CycleRunning {
            tracing::info!("waiting for the running collection cycle to finish");
        }

        match running.collection.await {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => tracing::error!(error = %e, "collection task ended abnormally"),
        }
        for job in running.jobs {
            if let Err(e) = job.await {
                tracing::error!(error = %e, "scheduled job ended abnormally");
            }
        }

        self.state.send_replace(SchedulerState::Stopped);
        tracing::info!("scheduler stopped");
    }
}

async fn collection_loop(
    ctx: Arc<ServiceContext>,
    writer: StatusWriter,
    every: Duration,
    state: Arc<watch::Sender<SchedulerState>>,
    cancel: CancellationToken,
) -> StatusWriter {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // not raced against `cancel`: a started cycle always completes
        state.send_replace(SchedulerState::CycleRunning);
        match ctx.collector.run_cycle(&writer).await {
            Ok(report) => {
                if report.status.meters_failed > 0 {
                    tracing::warn!(
                        cycle_id = report.status.cycle_id,
                        failed = report.status.meters_failed,
                        "collection cycle finished with failed meters"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "collection cycle not started"),
        }
        let closed = ctx.client.evict_idle().await;
        if closed > 0 {
            tracing::debug!(closed, "idle device connections closed");
        }
        metrics::gauge!("device_connections_open").set(ctx.client.open_connections() as f64);
        state.send_replace(SchedulerState::Scheduled);
    }

    writer
}

async fn cron_loop<F, Fut>(
    name: &'static str,
    schedule: cron::Schedule,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    mut job: F,
) where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    loop {
        let now = clock.now();
        let Some(next) = schedule.after(&now).next() else {
            tracing::warn!(job = name, "schedule has no future fire times");
            break;
        };
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(job = name, next = %next, "next run scheduled");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }
        job().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    use chrono::TimeZone;

    use crate::{
        catalog::tests::{meter, MemoryCatalogStore},
        config::{resolve, CronSchedule, EnvOverrides, FileConfig},
        context::Collaborators,
        protocol::sim::{registers, SimDevice, SimTransport},
        sinks::{memory::MemoryReadingStore, upload::tests::CountingUploader},
        sync::{tests::ScriptedSync, COLLECTION_IN_PROGRESS},
    };

    struct Harness {
        scheduler: Scheduler,
        ctx: Arc<ServiceContext>,
        uploader: Arc<CountingUploader>,
        remote: Arc<ScriptedSync>,
    }

    /// One meter with four registers behind a device answering after
    /// `latency`; collection every `interval_secs`.
    async fn harness(latency: Duration, interval_secs: u64, upload_cron: &str, sync_cron: &str) -> Harness {
        let (mut config, _) = resolve(&FileConfig::default(), &EnvOverrides::default());
        config.collector.batch_timeout_ms = 10_000;
        config.schedule.collection_interval.value = Duration::from_secs(interval_secs);
        config.schedule.upload.schedule.value = CronSchedule::parse(upload_cron).unwrap();
        config.schedule.remote_sync.schedule.value = CronSchedule::parse(sync_cron).unwrap();

        let transport = SimTransport::new();
        let dev = transport.add(SimDevice::new("10.2.0.1").with_latency(latency));
        let catalog_store = Arc::new(MemoryCatalogStore::default());
        catalog_store.meters.lock().unwrap().push(meter(1, 1, &dev));
        catalog_store
            .mappings
            .lock()
            .unwrap()
            .extend(registers(4).into_iter().map(|r| (dev.clone(), r)));

        let uploader = Arc::new(CountingUploader::default());
        let remote = Arc::new(ScriptedSync::default());
        let (ctx, writer) = ServiceContext::new(
            config,
            Collaborators {
                catalog_store,
                transport,
                store: Arc::new(MemoryReadingStore::default()),
                uploader: uploader.clone(),
                remote: remote.clone(),
            },
        );
        ctx.catalog.load().await.unwrap();

        let ctx = Arc::new(ctx);
        let clock = Arc::new(TokioClock::starting_at(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        Harness {
            scheduler: Scheduler::new(ctx.clone(), writer, clock),
            ctx,
            uploader,
            remote,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_fire_on_their_schedules_until_stopped() {
        let mut h = harness(Duration::from_millis(10), 60, "*/30 * * * * *", "0 0 * * * *").await;
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);

        h.scheduler.start().unwrap();
        assert_eq!(h.scheduler.state(), SchedulerState::Scheduled);
        tokio::time::sleep(Duration::from_secs(125)).await;

        // cycles at 0, 60 and 120 s; uploads at 30, 60, 90 and 120 s
        assert_eq!(h.ctx.status.current().cycle_id, 3);
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 4);

        h.scheduler.stop().await;
        assert_eq!(h.scheduler.state(), SchedulerState::Stopped);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.ctx.status.current().cycle_id, 3);
        assert_eq!(h.uploader.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_lets_the_running_cycle_finish() {
        let mut h = harness(Duration::from_secs(8), 300, "0 */15 * * * *", "0 0 * * * *").await;
        let started = Instant::now();
        h.scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(h.scheduler.state(), SchedulerState::CycleRunning);
        assert!(h.ctx.status.is_collecting());

        h.scheduler.stop().await;

        assert!(started.elapsed() >= Duration::from_secs(8));
        let status = h.ctx.status.current();
        assert!(!status.in_progress);
        assert_eq!(status.cycle_id, 1);
        assert_eq!(status.meters_failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_during_cycle_is_skipped_and_next_trigger_runs() {
        // cycle runs from 0 to 8 s; sync fires at 2 s and 12 s
        let mut h = harness(Duration::from_secs(8), 300, "0 */15 * * * *", "2/10 * * * * *").await;
        h.scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;
        let skips = h.ctx.sync.skip_history();
        assert_eq!(skips.len(), 1);
        assert_eq!(skips[0].reason, COLLECTION_IN_PROGRESS);
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.remote.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.ctx.sync.skip_history().len(), 1);

        h.scheduler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_reuses_the_status_writer() {
        let mut h = harness(Duration::from_millis(10), 60, "0 */15 * * * *", "0 0 * * * *").await;
        h.scheduler.start().unwrap();
        assert_eq!(h.scheduler.start(), Err(SchedulerError::AlreadyRunning));
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.scheduler.stop().await;

        h.scheduler.start().unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        h.scheduler.stop().await;

        assert_eq!(h.ctx.status.current().cycle_id, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_clock_follows_the_paused_timer() {
        let origin = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let clock = TokioClock::starting_at(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::seconds(90));
    }
}
