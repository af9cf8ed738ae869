//! Background compaction and retention
//!
//! One task per measurement, driven by two tokio intervals. The task holds a
//! weak reference so it never keeps a dropped measurement alive, and runs the
//! blocking work on tokio's blocking pool.

use crate::storage::Measurement;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// Handle to a running compaction task
pub struct CompactionService {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl CompactionService {
    /// Spawn the periodic compaction / garbage collection task on `runtime`
    pub fn start(
        measurement: &Arc<Measurement>,
        runtime: &Handle,
        compaction_frequency: Duration,
        gc_frequency: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();
        let weak = Arc::downgrade(measurement);
        let task = runtime.spawn(run(weak, cancel.clone(), compaction_frequency, gc_frequency));
        Self { cancel, task }
    }

    /// Ask the task to stop after its current pass
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            error!("Compaction task ended abnormally: {}", e);
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Compaction,
    Garbage,
}

async fn run(
    measurement: Weak<Measurement>,
    cancel: CancellationToken,
    compaction_frequency: Duration,
    gc_frequency: Duration,
) {
    let mut compaction = interval(compaction_frequency);
    let mut gc = interval(gc_frequency);
    compaction.set_missed_tick_behavior(MissedTickBehavior::Delay);
    gc.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both intervals fire immediately; nothing is due right after open
    compaction.tick().await;
    gc.tick().await;

    loop {
        let pass = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = compaction.tick() => Pass::Compaction,
            _ = gc.tick() => Pass::Garbage,
        };

        let Some(target) = measurement.upgrade() else {
            break;
        };
        if target.is_closed() {
            break;
        }
        let name = target.name().to_string();
        let outcome = tokio::task::spawn_blocking(move || match pass {
            Pass::Compaction => target.compact().map(|cleaned| cleaned.len()),
            Pass::Garbage => target.collect_garbage(),
        })
        .await;

        match outcome {
            Ok(Ok(cleaned)) => debug!("{:?} pass on {} released {} buffers", pass, name, cleaned),
            Ok(Err(e)) => error!("{:?} pass on {} failed: {}", pass, name, e),
            Err(e) => error!("{:?} pass on {} panicked: {}", pass, name, e),
        }
    }
    debug!("Compaction task stopped");
}
