//! Cooperative scheduler for media processing and heartbeats.
//!
//! Tasks are plain closures polled once per tick of their queue. Socket I/O
//! happens on tokio tasks elsewhere and is only drained here, so connection
//! and jitter buffer state change in step with the tick.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Default media tick.
pub const DEFAULT_MEDIA_PERIOD: Duration = Duration::from_millis(20);

/// Default heartbeat ticks per second.
pub const DEFAULT_HEARTBEAT_RESOLUTION: u32 = 10;

/// Which tick a task runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Media,
    Heartbeat,
}

/// Returned by a task after each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Reschedule,
    Cancel,
}

type Task = Box<dyn FnMut() -> TaskStatus + Send>;

#[derive(Default)]
struct TaskQueue {
    tasks: Mutex<Vec<Task>>,
}

impl TaskQueue {
    // ---
    /// Runs every task once. Tasks submitted while running wait for the
    /// next tick.
    fn tick(&self) -> usize {
        // ---
        let mut running = std::mem::take(&mut *self.tasks.lock());
        let count = running.len();
        running.retain_mut(|task| task() == TaskStatus::Reschedule);

        let mut tasks = self.tasks.lock();
        let submitted = std::mem::replace(&mut *tasks, running);
        tasks.extend(submitted);
        count
    }
}

/// Drives periodic media and heartbeat tasks.
pub struct Scheduler {
    // ---
    media: TaskQueue,
    heartbeat: TaskQueue,
    media_period: Duration,
    heartbeat_resolution: u32,
}

impl Scheduler {
    // ---
    /// Creates a scheduler ticking media every `media_period` and heartbeats
    /// `heartbeat_resolution` times per second.
    pub fn new(media_period: Duration, heartbeat_resolution: u32) -> Self {
        // ---
        Self {
            media: TaskQueue::default(),
            heartbeat: TaskQueue::default(),
            media_period,
            heartbeat_resolution: heartbeat_resolution.max(1),
        }
    }

    pub fn heartbeat_resolution(&self) -> u32 {
        // ---
        self.heartbeat_resolution
    }

    fn queue(&self, queue: Queue) -> &TaskQueue {
        // ---
        match queue {
            Queue::Media => &self.media,
            Queue::Heartbeat => &self.heartbeat,
        }
    }

    /// Adds a task; it first runs on the queue's next tick.
    pub fn submit<F>(&self, queue: Queue, task: F)
    where
        F: FnMut() -> TaskStatus + Send + 'static,
    {
        // ---
        self.queue(queue).tasks.lock().push(Box::new(task));
    }

    /// Runs one tick of `queue`, returning how many tasks ran.
    pub fn tick(&self, queue: Queue) -> usize {
        // ---
        let ran = self.queue(queue).tick();
        trace!("{:?} tick ran {} tasks", queue, ran);
        ran
    }

    /// Tasks currently scheduled on `queue`.
    pub fn pending(&self, queue: Queue) -> usize {
        // ---
        self.queue(queue).tasks.lock().len()
    }

    /// Ticks both queues on their periods until the handle is aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        // ---
        let heartbeat_period = Duration::from_secs(1) / self.heartbeat_resolution;
        debug!(
            "Scheduler started: media every {:?}, heartbeat every {:?}",
            self.media_period, heartbeat_period
        );

        tokio::spawn(async move {
            // ---
            let mut media = interval(self.media_period);
            media.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut heartbeat = interval(heartbeat_period);
            heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = media.tick() => {
                        self.tick(Queue::Media);
                    }
                    _ = heartbeat.tick() => {
                        self.tick(Queue::Heartbeat);
                    }
                }
            }
        })
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_PERIOD, DEFAULT_HEARTBEAT_RESOLUTION)
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("media_tasks", &self.pending(Queue::Media))
            .field("heartbeat_tasks", &self.pending(Queue::Heartbeat))
            .field("media_period", &self.media_period)
            .field("heartbeat_resolution", &self.heartbeat_resolution)
            .finish()
    }
}
