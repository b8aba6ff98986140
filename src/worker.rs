//! Camera workers and alert delivery.
//!
//! One thread per camera owns that camera's [`CameraPipeline`] and frame
//! source; nothing mutable crosses between camera threads. Alerts flow over
//! a channel to a single delivery thread that owns the sink.
//!
//! Stopping a camera joins its thread, which drops its `CameraState` in one
//! piece. Queued alerts are then drained or abandoned per `drain_on_stop`.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::event::Alert;
use crate::ingest::FrameSource;
use crate::pipeline::CameraPipeline;
use crate::transport::EventSink;

/// Consecutive source errors tolerated before a worker gives up.
const MAX_CONSECUTIVE_SOURCE_ERRORS: u32 = 10;
const SOURCE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    pub frames: u64,
    pub ignored_frames: u64,
    pub failed_frames: u64,
    pub skipped_stages: u64,
    pub alerts: u64,
    pub source_errors: u64,
}

pub struct WorkerHandle {
    camera_id: String,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<WorkerStats>,
}

impl WorkerHandle {
    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Ask the worker to stop after its current frame and wait for it.
    pub fn stop(self) -> Result<WorkerStats> {
        self.stop.store(true, Ordering::SeqCst);
        self.join()
    }

    /// Wait for the worker to run out of frames.
    pub fn join(self) -> Result<WorkerStats> {
        self.handle
            .join()
            .map_err(|_| anyhow!("camera {} worker panicked", self.camera_id))
    }
}

pub fn spawn_camera_worker(
    mut pipeline: CameraPipeline,
    mut source: Box<dyn FrameSource>,
    alerts: Sender<Alert>,
) -> Result<WorkerHandle> {
    let camera_id = pipeline.camera_id().to_string();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let thread_camera = camera_id.clone();

    let handle = std::thread::Builder::new()
        .name(format!("camera-{}", camera_id))
        .spawn(move || {
            let mut stats = WorkerStats::default();
            if let Err(e) = source.connect() {
                log::error!("camera {}: source {} failed to connect: {:#}", thread_camera, source.name(), e);
                return stats;
            }
            log::info!("camera {}: worker started ({})", thread_camera, source.name());
            let mut consecutive_errors = 0;

            while !stop_flag.load(Ordering::SeqCst) {
                let next = match source.next_frame() {
                    Ok(Some(next)) => next,
                    Ok(None) => {
                        log::info!("camera {}: source exhausted", thread_camera);
                        break;
                    }
                    Err(e) => {
                        stats.source_errors += 1;
                        consecutive_errors += 1;
                        log::warn!("camera {}: frame source error: {:#}", thread_camera, e);
                        if consecutive_errors >= MAX_CONSECUTIVE_SOURCE_ERRORS {
                            log::error!(
                                "camera {}: giving up after {} consecutive source errors",
                                thread_camera,
                                consecutive_errors
                            );
                            break;
                        }
                        std::thread::sleep(SOURCE_RETRY_DELAY);
                        continue;
                    }
                };
                consecutive_errors = 0;
                if let Some(zones) = next.zones {
                    pipeline.set_zones(zones);
                }

                stats.frames += 1;
                let outcome = match pipeline.process_frame(&next.frame) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        stats.failed_frames += 1;
                        log::error!("frame {} abandoned: {}", next.frame.sequence, e);
                        continue;
                    }
                };
                if outcome.ignored {
                    stats.ignored_frames += 1;
                }
                stats.skipped_stages += outcome.skipped_stages.len() as u64;
                for alert in outcome.alerts {
                    stats.alerts += 1;
                    if alerts.send(alert).is_err() {
                        log::warn!("camera {}: delivery channel closed, stopping", thread_camera);
                        return stats;
                    }
                }
            }
            log::info!(
                "camera {}: worker stopped after {} frame(s), {} alert(s)",
                thread_camera,
                stats.frames,
                stats.alerts
            );
            stats
        })?;

    Ok(WorkerHandle {
        camera_id,
        stop,
        handle,
    })
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    pub abandoned: u64,
}

pub struct DeliveryHandle {
    abandon: Arc<AtomicBool>,
    handle: JoinHandle<DeliveryStats>,
}

impl DeliveryHandle {
    /// Wait for the delivery thread. It exits once every sender is gone;
    /// with `drain = false`, alerts still queued at that point are dropped.
    pub fn finish(self, drain: bool) -> Result<DeliveryStats> {
        if !drain {
            self.abandon.store(true, Ordering::SeqCst);
        }
        self.handle
            .join()
            .map_err(|_| anyhow!("delivery thread panicked"))
    }
}

pub fn spawn_delivery(mut sink: Box<dyn EventSink>, alerts: Receiver<Alert>) -> Result<DeliveryHandle> {
    let abandon = Arc::new(AtomicBool::new(false));
    let abandon_flag = abandon.clone();
    let handle = std::thread::Builder::new()
        .name("alert-delivery".to_string())
        .spawn(move || {
            let mut stats = DeliveryStats::default();
            while let Ok(alert) = alerts.recv() {
                if abandon_flag.load(Ordering::SeqCst) {
                    stats.abandoned += 1 + alerts.try_iter().count() as u64;
                    break;
                }
                match sink.deliver(&alert).and_then(|_| sink.flush()) {
                    Ok(()) => stats.delivered += 1,
                    Err(e) => {
                        stats.failed += 1;
                        log::error!(
                            "{} sink failed to deliver alert for camera {}: {:#}",
                            sink.name(),
                            alert.camera_id,
                            e
                        );
                    }
                }
            }
            if let Err(e) = sink.close() {
                log::error!("{} sink failed to close: {:#}", sink.name(), e);
            }
            if stats.abandoned > 0 {
                log::warn!("abandoned {} queued alert(s) at shutdown", stats.abandoned);
            }
            stats
        })?;
    Ok(DeliveryHandle { abandon, handle })
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SupervisorReport {
    pub cameras: BTreeMap<String, WorkerStats>,
    pub delivery: DeliveryStats,
}

/// Owns every camera worker and the delivery thread.
pub struct Supervisor {
    workers: BTreeMap<String, WorkerHandle>,
    alerts: Sender<Alert>,
    delivery: DeliveryHandle,
    drain_on_stop: bool,
}

impl Supervisor {
    pub fn new(sink: Box<dyn EventSink>, drain_on_stop: bool) -> Result<Self> {
        let (alerts, rx) = mpsc::channel();
        let delivery = spawn_delivery(sink, rx)?;
        Ok(Self {
            workers: BTreeMap::new(),
            alerts,
            delivery,
            drain_on_stop,
        })
    }

    pub fn add_camera(
        &mut self,
        pipeline: CameraPipeline,
        source: Box<dyn FrameSource>,
    ) -> Result<()> {
        let camera_id = pipeline.camera_id().to_string();
        if self.workers.contains_key(&camera_id) {
            return Err(anyhow!("camera {} already running", camera_id));
        }
        let handle = spawn_camera_worker(pipeline, source, self.alerts.clone())?;
        self.workers.insert(camera_id, handle);
        Ok(())
    }

    /// Stop one camera and release its state.
    pub fn stop_camera(&mut self, camera_id: &str) -> Result<WorkerStats> {
        let handle = self
            .workers
            .remove(camera_id)
            .ok_or_else(|| anyhow!("unknown camera {}", camera_id))?;
        handle.stop()
    }

    pub fn camera_ids(&self) -> Vec<String> {
        self.workers.keys().cloned().collect()
    }

    /// True once every worker has run out of frames or given up.
    pub fn all_finished(&self) -> bool {
        self.workers.values().all(WorkerHandle::is_finished)
    }

    /// Let every source run to its end, then deliver everything queued.
    pub fn wait(self) -> Result<SupervisorReport> {
        self.finish(false, true)
    }

    /// Stop all cameras now; queued alerts drain or are abandoned per
    /// configuration.
    pub fn shutdown(self) -> Result<SupervisorReport> {
        let drain = self.drain_on_stop;
        self.finish(true, drain)
    }

    fn finish(self, stop: bool, drain: bool) -> Result<SupervisorReport> {
        let Supervisor {
            workers,
            alerts,
            delivery,
            ..
        } = self;
        drop(alerts);

        let mut report = SupervisorReport::default();
        for (camera_id, handle) in workers {
            let stats = if stop { handle.stop() } else { handle.join() };
            match stats {
                Ok(stats) => {
                    report.cameras.insert(camera_id, stats);
                }
                Err(e) => log::error!("{:#}", e),
            }
        }
        report.delivery = delivery.finish(drain)?;
        Ok(report)
    }
}
