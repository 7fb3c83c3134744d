//! Off-thread codec workers with a bounded pool and FIFO queueing
//!
//! Heavy codec stages can run on their own OS threads. A worker is bound to
//! one stage session at a time and speaks a `init → append* → flush`
//! message protocol; payload buffers move across the channel by ownership
//! transfer. At most `max_workers` workers are alive at once: an `acquire`
//! beyond that enqueues and is served FIFO when a stage flushes. A released
//! worker is rebound to the queue head or torn down. Errors poison the
//! stage handle; a poisoned worker is destroyed, never reused.

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;

use crate::codec::{build_stage, is_passthrough, CodecPolicy, Direction, FlushOutput, Stage};
use crate::config::ZipConfig;
use crate::error::{Result, ZipError};

enum WorkerRequest {
    Init {
        direction: Direction,
        policy: CodecPolicy,
    },
    Append {
        data: Vec<u8>,
        reply: Sender<Result<Vec<u8>>>,
    },
    Flush {
        reply: Sender<Result<FlushOutput>>,
    },
    Shutdown,
}

struct WorkerSlot {
    id: u64,
    busy: bool,
    tx: Sender<WorkerRequest>,
}

struct PendingAcquire {
    direction: Direction,
    policy: CodecPolicy,
    lease: Sender<Lease>,
}

struct Lease {
    id: u64,
    tx: Sender<WorkerRequest>,
}

struct PoolState {
    workers: Vec<WorkerSlot>,
    pending: VecDeque<PendingAcquire>,
    next_id: u64,
}

struct PoolInner {
    state: Mutex<PoolState>,
    max_workers: usize,
}

/// Bounded pool of codec worker threads.
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                state: Mutex::new(PoolState {
                    workers: Vec::new(),
                    pending: VecDeque::new(),
                    next_id: 0,
                }),
                max_workers,
            }),
        }
    }

    /// Process-wide pool, sized from the configuration at first use.
    pub fn global() -> &'static WorkerPool {
        static POOL: OnceLock<WorkerPool> = OnceLock::new();
        POOL.get_or_init(|| WorkerPool::new(ZipConfig::snapshot().max_workers))
    }

    /// Number of currently alive workers.
    pub fn worker_count(&self) -> usize {
        self.inner.state.lock().unwrap().workers.len()
    }

    /// Obtain a stage handle bound to a worker.
    ///
    /// Spawns below the cap, rebinds an idle worker otherwise, and blocks
    /// FIFO behind in-flight sessions when the pool is saturated.
    pub fn acquire(&self, direction: Direction, policy: CodecPolicy) -> Result<WorkerStage> {
        let mut state = self.inner.state.lock().unwrap();

        if state.workers.len() < self.inner.max_workers {
            let slot = spawn_worker(&mut state.next_id)?;
            let lease = Lease {
                id: slot.id,
                tx: slot.tx.clone(),
            };
            slot.tx
                .send(WorkerRequest::Init { direction, policy })
                .map_err(|_| disconnected())?;
            state.workers.push(slot);
            return Ok(WorkerStage::new(self.inner.clone(), lease));
        }

        if let Some(slot) = state.workers.iter_mut().find(|slot| !slot.busy) {
            slot.busy = true;
            slot.tx
                .send(WorkerRequest::Init { direction, policy })
                .map_err(|_| disconnected())?;
            let lease = Lease {
                id: slot.id,
                tx: slot.tx.clone(),
            };
            return Ok(WorkerStage::new(self.inner.clone(), lease));
        }

        let (lease_tx, lease_rx) = mpsc::channel();
        state.pending.push_back(PendingAcquire {
            direction,
            policy,
            lease: lease_tx,
        });
        drop(state);

        let lease = lease_rx.recv().map_err(|_| disconnected())?;
        Ok(WorkerStage::new(self.inner.clone(), lease))
    }
}

fn disconnected() -> ZipError {
    ZipError::WorkerFailed("codec worker disconnected".to_string())
}

fn spawn_worker(next_id: &mut u64) -> Result<WorkerSlot> {
    let id = *next_id;
    *next_id += 1;
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("zipflow-codec-{}", id))
        .spawn(move || worker_loop(rx))?;
    Ok(WorkerSlot { id, busy: true, tx })
}

fn worker_loop(rx: Receiver<WorkerRequest>) {
    let mut stage: Option<Result<Box<dyn Stage>>> = None;
    for request in rx {
        match request {
            WorkerRequest::Init { direction, policy } => {
                stage = Some(build_stage(direction, &policy));
            }
            WorkerRequest::Append { data, reply } => {
                let result = if matches!(stage, Some(Err(_))) {
                    match stage.take() {
                        Some(Err(e)) => Err(e),
                        _ => unreachable!(),
                    }
                } else {
                    match stage.as_mut() {
                        Some(Ok(stage)) => stage.append(&data),
                        _ => Err(ZipError::WorkerFailed("append before init".to_string())),
                    }
                };
                let _ = reply.send(result);
            }
            WorkerRequest::Flush { reply } => {
                let result = match stage.take() {
                    Some(Ok(mut stage)) => stage.flush(),
                    Some(Err(e)) => Err(e),
                    None => Err(ZipError::WorkerFailed("flush before init".to_string())),
                };
                let _ = reply.send(result);
            }
            WorkerRequest::Shutdown => break,
        }
    }
}

// Rebind the released worker to the queue head, or tear it down. When a
// worker is destroyed while requests are pending, a replacement is spawned
// so queued sessions cannot starve.
fn release(inner: &Arc<PoolInner>, worker_id: u64, destroy: bool) {
    let mut state = inner.state.lock().unwrap();
    let Some(pos) = state.workers.iter().position(|slot| slot.id == worker_id) else {
        return;
    };

    if !destroy {
        while let Some(pending) = state.pending.pop_front() {
            let slot = &state.workers[pos];
            if slot
                .tx
                .send(WorkerRequest::Init {
                    direction: pending.direction,
                    policy: pending.policy,
                })
                .is_err()
            {
                break;
            }
            let lease = Lease {
                id: slot.id,
                tx: slot.tx.clone(),
            };
            if pending.lease.send(lease).is_ok() {
                return;
            }
            // waiter is gone; re-init for the next one
        }
        if state.pending.is_empty() {
            let slot = state.workers.remove(pos);
            let _ = slot.tx.send(WorkerRequest::Shutdown);
            return;
        }
    }

    let slot = state.workers.remove(pos);
    let _ = slot.tx.send(WorkerRequest::Shutdown);

    while let Some(pending) = state.pending.pop_front() {
        let Ok(slot) = spawn_worker(&mut state.next_id) else {
            break;
        };
        if slot
            .tx
            .send(WorkerRequest::Init {
                direction: pending.direction,
                policy: pending.policy,
            })
            .is_err()
        {
            continue;
        }
        let lease = Lease {
            id: slot.id,
            tx: slot.tx.clone(),
        };
        if pending.lease.send(lease).is_ok() {
            state.workers.push(slot);
            return;
        }
        let _ = slot.tx.send(WorkerRequest::Shutdown);
    }
}

enum HandleState {
    Active,
    Poisoned,
    Released,
}

/// Client handle to a worker-bound stage session.
pub struct WorkerStage {
    pool: Arc<PoolInner>,
    worker_id: u64,
    tx: Sender<WorkerRequest>,
    state: HandleState,
}

impl WorkerStage {
    fn new(pool: Arc<PoolInner>, lease: Lease) -> Self {
        Self {
            pool,
            worker_id: lease.id,
            tx: lease.tx,
            state: HandleState::Active,
        }
    }

    fn poison(&mut self) {
        self.state = HandleState::Poisoned;
        release(&self.pool, self.worker_id, true);
    }
}

impl Stage for WorkerStage {
    fn append(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        if !matches!(self.state, HandleState::Active) {
            return Err(ZipError::WorkerFailed("stage is poisoned".to_string()));
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        let sent = self.tx.send(WorkerRequest::Append {
            data: input.to_vec(),
            reply: reply_tx,
        });
        let result = match sent {
            Ok(()) => reply_rx.recv().unwrap_or_else(|_| Err(disconnected())),
            Err(_) => Err(disconnected()),
        };
        if result.is_err() {
            self.poison();
        }
        result
    }

    fn flush(&mut self) -> Result<FlushOutput> {
        if !matches!(self.state, HandleState::Active) {
            return Err(ZipError::WorkerFailed("stage is poisoned".to_string()));
        }
        let (reply_tx, reply_rx) = mpsc::channel();
        let sent = self.tx.send(WorkerRequest::Flush { reply: reply_tx });
        let result = match sent {
            Ok(()) => reply_rx.recv().unwrap_or_else(|_| Err(disconnected())),
            Err(_) => Err(disconnected()),
        };
        match result {
            Ok(output) => {
                self.state = HandleState::Released;
                release(&self.pool, self.worker_id, false);
                Ok(output)
            }
            Err(e) => {
                self.poison();
                Err(e)
            }
        }
    }
}

impl Drop for WorkerStage {
    fn drop(&mut self) {
        if matches!(self.state, HandleState::Active) {
            release(&self.pool, self.worker_id, true);
        }
    }
}

/// Build the stage for one entry, dispatching to the worker pool when it is
/// enabled and the policy actually needs codec work.
pub(crate) fn acquire_stage(
    direction: Direction,
    policy: CodecPolicy,
    config: &ZipConfig,
) -> Result<Box<dyn Stage>> {
    if config.use_workers && !is_passthrough(&policy) {
        Ok(Box::new(WorkerPool::global().acquire(direction, policy)?))
    } else {
        build_stage(direction, &policy)
    }
}
