use super::clock::Clock;
use super::task::ScheduledTask;
use crate::config::ConfigHandle;
use crate::lock::{OperationGuard, OperationLock};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use uuid::Uuid;

const TICK: Duration = Duration::from_secs(1);

/// One occurrence of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub task_id: Uuid,
    pub at: NaiveDateTime,
}

/// A due slot that won the operation lock.
#[derive(Debug)]
pub struct Dispatch {
    pub slot: Slot,
    pub task: ScheduledTask,
    pub guard: OperationGuard,
}

/// Carries out a dispatched task while holding its guard.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run_task(&self, task: ScheduledTask, guard: OperationGuard);
}

/// Fires calendar tasks at their configured local times.
///
/// Each tick arms the soonest upcoming slot across the configured tasks, so
/// edits to the task list take effect on the next tick. A due slot is
/// dispatched at most once. When the operation lock is held the slot is
/// retried on later ticks until the dispatch grace runs out, then dropped.
pub struct CalendarDispatcher {
    config: ConfigHandle,
    lock: OperationLock,
    clock: Arc<dyn Clock>,
    pending: Mutex<Option<Slot>>,
    dispatched: Mutex<HashMap<Uuid, NaiveDateTime>>,
}

impl CalendarDispatcher {
    pub fn new(config: ConfigHandle, lock: OperationLock, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            lock,
            clock,
            pending: Mutex::new(None),
            dispatched: Mutex::new(HashMap::new()),
        }
    }

    /// The slot currently armed, if any.
    pub fn pending(&self) -> Option<Slot> {
        *self.pending.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Soonest upcoming slot across all tasks, with its task.
    pub fn next_scheduled(&self) -> Option<(ScheduledTask, NaiveDateTime)> {
        let now = self.clock.now();
        soonest(&self.config.read().scheduler.tasks, now)
    }

    /// Evaluates the calendar once.
    ///
    /// Returns the task to run when a due slot acquired the operation lock.
    pub fn tick(&self) -> Option<Dispatch> {
        let now = self.clock.now();
        let (tasks, grace) = {
            let config = self.config.read();
            (config.scheduler.tasks.clone(), config.scheduler.dispatch_grace())
        };

        let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
        let mut dispatched = self.dispatched.lock().unwrap_or_else(|p| p.into_inner());

        let mut from = now;
        let mut outcome = None;
        if let Some(slot) = pending.take() {
            if slot.at <= now {
                // Slots sharing this instant must still be armed after it is consumed.
                from = slot.at - chrono::Duration::nanoseconds(1);
                let task = tasks.iter().find(|t| t.id == slot.task_id && t.enabled);
                match task {
                    None => {
                        tracing::debug!(task = %slot.task_id, "Armed task no longer scheduled");
                    }
                    Some(_) if dispatched.get(&slot.task_id) == Some(&slot.at) => {
                        tracing::debug!(task = %slot.task_id, at = %slot.at, "Slot already dispatched");
                    }
                    Some(task) => match self.lock.try_acquire(task.kind.operation_name()) {
                        Some(guard) => {
                            tracing::info!(task = %task.name, kind = %task.kind, at = %slot.at, "Dispatching scheduled task");
                            dispatched.insert(slot.task_id, slot.at);
                            outcome = Some(Dispatch {
                                slot,
                                task: task.clone(),
                                guard,
                            });
                        }
                        None if now - slot.at > grace => {
                            tracing::warn!(
                                task = %task.name,
                                at = %slot.at,
                                holder = ?self.lock.holder(),
                                "Operation still running past dispatch grace, skipping slot"
                            );
                            dispatched.insert(slot.task_id, slot.at);
                        }
                        None => {
                            tracing::debug!(task = %task.name, holder = ?self.lock.holder(), "Slot due but an operation is running");
                            *pending = Some(slot);
                            return None;
                        }
                    },
                }
            }
        }

        *pending = arm(&tasks, from, &dispatched);
        outcome
    }

    /// Ticks every second and hands dispatched tasks to `runner`.
    pub fn spawn(self: Arc<Self>, runner: Arc<dyn TaskRunner>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(TICK);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Some(dispatch) = self.tick() {
                    let runner = Arc::clone(&runner);
                    tokio::spawn(async move {
                        runner.run_task(dispatch.task, dispatch.guard).await;
                    });
                }
            }
        })
    }
}

/// Soonest slot after `from` that has not been dispatched yet.
fn arm(
    tasks: &[ScheduledTask],
    from: NaiveDateTime,
    dispatched: &HashMap<Uuid, NaiveDateTime>,
) -> Option<Slot> {
    tasks
        .iter()
        .filter_map(|task| {
            let at = task.next_run(from)?;
            let at = if dispatched.get(&task.id) == Some(&at) {
                task.next_run(at)?
            } else {
                at
            };
            Some(Slot {
                task_id: task.id,
                at,
            })
        })
        .min_by_key(|slot| slot.at)
}

fn soonest(tasks: &[ScheduledTask], now: NaiveDateTime) -> Option<(ScheduledTask, NaiveDateTime)> {
    tasks
        .iter()
        .filter_map(|task| task.next_run(now).map(|at| (task, at)))
        .min_by_key(|(_, at)| *at)
        .map(|(task, at)| (task.clone(), at))
}
