//! Management surface: read-only snapshots and the named-task runner.
//!
//! Snapshots are plain serializable records stamped with their acquisition
//! time; the delivery channel (RMI, HTTP, whatever) is someone else's
//! problem. Tasks are registered as named constructors and launched from a
//! command line, queried and stopped by id (`-1` means all).

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{PersistitError, Result};

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Buffer pool statistics sample.
#[derive(Clone, Debug, Serialize)]
pub struct BufferPoolInfo {
    pub acquisition_time: u64,
    pub page_size: usize,
    pub frame_count: usize,
    pub hit_count: u64,
    pub miss_count: u64,
    pub new_count: u64,
    pub evict_count: u64,
    pub write_count: u64,
    pub forced_write_count: u64,
    pub forced_checkpoint_write_count: u64,
    pub get_count: u64,
    pub hit_ratio: f64,
    pub valid_page_count: usize,
    pub dirty_page_count: usize,
    pub reader_claimed_page_count: i64,
    pub writer_claimed_page_count: i64,
    pub earliest_dirty_timestamp: Option<u64>,
}

/// One frame's status sample.
#[derive(Clone, Debug, Serialize)]
pub struct BufferInfo {
    pub acquisition_time: u64,
    pub index: usize,
    pub valid: bool,
    pub dirty: bool,
    pub volume_id: u64,
    pub page_address: u64,
    pub timestamp: u64,
}

/// Volume status sample.
#[derive(Clone, Debug, Serialize)]
pub struct VolumeInfo {
    pub acquisition_time: u64,
    pub id: u64,
    pub name: String,
    pub path: String,
    pub page_size: usize,
    pub page_count: u64,
    pub highest_page_used: u64,
    pub garbage_root: u64,
    pub read_only: bool,
    pub temporary: bool,
    pub fetch_counter: u64,
    pub traverse_counter: u64,
    pub store_counter: u64,
    pub remove_counter: u64,
    pub last_error: Option<String>,
}

/// Tree status sample.
#[derive(Clone, Debug, Serialize)]
pub struct TreeInfo {
    pub acquisition_time: u64,
    pub name: String,
    pub volume_id: u64,
    pub index: u32,
    pub root_page: u64,
    pub depth: u8,
    pub fetch_counter: u64,
    pub traverse_counter: u64,
    pub store_counter: u64,
    pub remove_counter: u64,
}

/// Journal status sample.
#[derive(Clone, Debug, Serialize)]
pub struct JournalSnapshot {
    pub acquisition_time: u64,
    pub current_address: u64,
    pub base_address: u64,
    pub flushed_address: u64,
    pub page_map_size: usize,
    pub tx_map_size: usize,
    pub current_generation: u64,
    pub append_only: bool,
    pub fast_copying: bool,
    pub last_checkpoint_timestamp: Option<u64>,
}

/// Transaction engine sample.
#[derive(Clone, Debug, Serialize)]
pub struct TransactionInfo {
    pub acquisition_time: u64,
    pub current_timestamp: u64,
    pub active_transaction_count: usize,
}

/// Task lifecycle states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum TaskStatus {
    NotStarted,
    Running,
    Suspended,
    Done,
    Failed,
    Ended,
    Expired,
}

/// Status sample for one task.
#[derive(Clone, Debug, Serialize)]
pub struct TaskInfo {
    pub acquisition_time: u64,
    pub id: i64,
    pub command_line: String,
    pub status: TaskStatus,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
    pub message: Option<String>,
}

/// Control handle given to a running task; poll points observe stop and
/// suspend requests.
pub struct TaskContext {
    stop: Arc<std::sync::atomic::AtomicBool>,
    suspended: Arc<std::sync::atomic::AtomicBool>,
    message: Arc<Mutex<Option<String>>>,
}

impl TaskContext {
    /// Returns `true` when the task should terminate; blocks while
    /// suspended.
    pub fn poll(&self) -> bool {
        while self.suspended.load(Ordering::Acquire) {
            if self.stop.load(Ordering::Acquire) {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        self.stop.load(Ordering::Acquire)
    }

    pub fn post_message(&self, message: &str) {
        *self.message.lock() = Some(message.to_string());
    }
}

/// A long-running administrative task body.
pub type TaskBody = Box<dyn FnOnce(&TaskContext) -> Result<()> + Send>;
/// Builds a task body from the arguments following the task name.
pub type TaskConstructor = Box<dyn Fn(&str) -> Result<TaskBody> + Send + Sync>;

struct TaskSlot {
    command_line: String,
    status: TaskStatus,
    started_at: Option<u64>,
    finished_at: Option<u64>,
    stop: Arc<std::sync::atomic::AtomicBool>,
    suspended: Arc<std::sync::atomic::AtomicBool>,
    message: Arc<Mutex<Option<String>>>,
    handle: Option<JoinHandle<()>>,
}

/// Registry of named task constructors plus the runner.
///
/// Launching takes the `commandLine` form: the first token names the
/// registered constructor, the rest is passed through as its arguments.
pub struct TaskRegistry {
    constructors: Mutex<HashMap<String, TaskConstructor>>,
    tasks: Arc<Mutex<HashMap<i64, TaskSlot>>>,
    next_id: AtomicI64,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            constructors: Mutex::new(HashMap::new()),
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicI64::new(1),
        }
    }

    /// Registers a constructor under `name`. Configured at build time.
    pub fn register(&self, name: &str, constructor: TaskConstructor) {
        self.constructors
            .lock()
            .insert(name.to_string(), constructor);
    }

    /// Launches a task from its command line; returns the task id.
    pub fn launch(&self, command_line: &str) -> Result<i64> {
        let trimmed = command_line.trim();
        let (name, args) = match trimmed.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (trimmed, ""),
        };
        if name.is_empty() {
            return Err(PersistitError::IllegalState("empty task command line"));
        }
        let body = {
            let constructors = self.constructors.lock();
            let constructor = constructors
                .get(name)
                .ok_or(PersistitError::IllegalState("unknown task name"))?;
            constructor(args)?
        };
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let suspended = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let message = Arc::new(Mutex::new(None));
        let context = TaskContext {
            stop: stop.clone(),
            suspended: suspended.clone(),
            message: message.clone(),
        };
        let tasks = self.tasks.clone();
        let handle = std::thread::Builder::new()
            .name(format!("persistit-task-{id}"))
            .spawn(move || {
                let outcome = body(&context);
                let mut tasks = tasks.lock();
                if let Some(slot) = tasks.get_mut(&id) {
                    slot.finished_at = Some(now_millis());
                    slot.status = match outcome {
                        Ok(()) if slot.stop.load(Ordering::Acquire) => TaskStatus::Ended,
                        Ok(()) => TaskStatus::Done,
                        Err(e) => {
                            *slot.message.lock() = Some(e.to_string());
                            TaskStatus::Failed
                        }
                    };
                }
            })?;
        self.tasks.lock().insert(
            id,
            TaskSlot {
                command_line: trimmed.to_string(),
                status: TaskStatus::Running,
                started_at: Some(now_millis()),
                finished_at: None,
                stop,
                suspended,
                message,
                handle: Some(handle),
            },
        );
        Ok(id)
    }

    fn for_each(&self, id: i64, mut f: impl FnMut(&mut TaskSlot)) -> Result<()> {
        let mut tasks = self.tasks.lock();
        if id == -1 {
            for slot in tasks.values_mut() {
                f(slot);
            }
            return Ok(());
        }
        match tasks.get_mut(&id) {
            Some(slot) => {
                f(slot);
                Ok(())
            }
            None => Err(PersistitError::IllegalState("unknown task id")),
        }
    }

    /// Requests stop for one task (`-1` == all).
    pub fn stop(&self, id: i64) -> Result<()> {
        self.for_each(id, |slot| {
            slot.stop.store(true, Ordering::Release);
            slot.suspended.store(false, Ordering::Release);
        })
    }

    /// Suspends or resumes (`-1` == all).
    pub fn suspend(&self, id: i64, suspended: bool) -> Result<()> {
        self.for_each(id, |slot| {
            slot.suspended.store(suspended, Ordering::Release);
            if suspended && slot.status == TaskStatus::Running {
                slot.status = TaskStatus::Suspended;
            } else if !suspended && slot.status == TaskStatus::Suspended {
                slot.status = TaskStatus::Running;
            }
        })
    }

    /// Samples task status (`-1` == all).
    pub fn query(&self, id: i64) -> Result<Vec<TaskInfo>> {
        let time = now_millis();
        let sample = |task_id: i64, slot: &TaskSlot| TaskInfo {
            acquisition_time: time,
            id: task_id,
            command_line: slot.command_line.clone(),
            status: slot.status,
            started_at: slot.started_at,
            finished_at: slot.finished_at,
            message: slot.message.lock().clone(),
        };
        let tasks = self.tasks.lock();
        let mut out = Vec::new();
        if id == -1 {
            for (&task_id, slot) in tasks.iter() {
                out.push(sample(task_id, slot));
            }
        } else {
            let slot = tasks
                .get(&id)
                .ok_or(PersistitError::IllegalState("unknown task id"))?;
            out.push(sample(id, slot));
        }
        out.sort_by_key(|info| info.id);
        Ok(out)
    }

    /// Joins finished task threads and expires completed entries older
    /// than `max_age_millis`.
    pub fn reap(&self, max_age_millis: u64) {
        let now = now_millis();
        let mut tasks = self.tasks.lock();
        for slot in tasks.values_mut() {
            if slot.finished_at.is_some() {
                if let Some(handle) = slot.handle.take() {
                    let _ = handle.join();
                }
            }
        }
        tasks.retain(|_, slot| match slot.finished_at {
            Some(finished) if now.saturating_sub(finished) > max_age_millis => false,
            _ => true,
        });
        for slot in tasks.values_mut() {
            if let (Some(finished), TaskStatus::Done) = (slot.finished_at, slot.status) {
                if now.saturating_sub(finished) > max_age_millis / 2 {
                    slot.status = TaskStatus::Expired;
                }
            }
        }
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Stamps a snapshot time; shared by the collectors in `db`.
pub fn acquisition_time() -> u64 {
    now_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_registry() -> (TaskRegistry, Arc<AtomicUsize>) {
        let registry = TaskRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let task_counter = counter.clone();
        registry.register(
            "count",
            Box::new(move |args: &str| {
                let limit: usize = args.trim().parse().unwrap_or(1);
                let counter = task_counter.clone();
                Ok(Box::new(move |ctx: &TaskContext| {
                    for _ in 0..limit {
                        if ctx.poll() {
                            return Ok(());
                        }
                        counter.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(5));
                    }
                    Ok(())
                }) as TaskBody)
            }),
        );
        (registry, counter)
    }

    #[test]
    fn launch_runs_to_done() -> Result<()> {
        let (registry, counter) = counting_registry();
        let id = registry.launch("count 3")?;
        for _ in 0..200 {
            let info = registry.query(id)?;
            if info[0].status == TaskStatus::Done {
                assert_eq!(counter.load(Ordering::SeqCst), 3);
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("task never finished");
    }

    #[test]
    fn stop_interrupts_long_task() -> Result<()> {
        let (registry, _counter) = counting_registry();
        let id = registry.launch("count 100000")?;
        std::thread::sleep(Duration::from_millis(20));
        registry.stop(id)?;
        for _ in 0..200 {
            let info = registry.query(id)?;
            if matches!(info[0].status, TaskStatus::Ended | TaskStatus::Done) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("task never stopped");
    }

    #[test]
    fn unknown_task_name_is_rejected() {
        let (registry, _) = counting_registry();
        assert!(registry.launch("no-such-task").is_err());
    }

    #[test]
    fn query_all_lists_every_task() -> Result<()> {
        let (registry, _) = counting_registry();
        registry.launch("count 1")?;
        registry.launch("count 1")?;
        let info = registry.query(-1)?;
        assert_eq!(info.len(), 2);
        Ok(())
    }
}
