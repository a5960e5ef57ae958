//! Component C: per-drive asynchronous command substrate. Each drive gets
//! its own fixed-size worker pool (default 4 threads); jobs are submitted
//! with a caller-chosen id and FIFO-delivered to that drive, and results
//! are polled with bounded retry/backoff. Grounded in `thpool.c`'s worker
//! pool and `async_nvme_thread_pool.c`'s per-drive job queue.

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::drive::transport::{DriveCommand, DriveOutcome, DriveTransport};
use crate::error::{Error, ErrorKind, Result};

/// Default worker count per drive pool (spec section 4.C).
pub const DEFAULT_POOL_THREADS: usize = 4;

type JobId = u64;

struct Job {
    id: JobId,
    drive: String,
    cmd: DriveCommand,
}

enum Slot {
    Pending,
    Done(Result<DriveOutcome>),
}

/// A fixed-size worker pool bound to one drive. Jobs submitted through
/// [`submit`](AsyncPool::submit) are delivered to workers in FIFO order;
/// at most one job per `(pool, job_id)` is ever in flight because callers
/// mint a fresh id per submission.
pub struct AsyncPool {
    drive: String,
    tx: Sender<Job>,
    results: Arc<Mutex<HashMap<JobId, Slot>>>,
    workers: Vec<JoinHandle<()>>,
    next_id: Mutex<JobId>,
    shutdown: Arc<Mutex<bool>>,
}

impl AsyncPool {
    /// Spawns `threads` workers, all sharing `transport`, all servicing
    /// commands against `drive`.
    pub fn new(drive: impl Into<String>, transport: Arc<dyn DriveTransport>, threads: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let results: Arc<Mutex<HashMap<JobId, Slot>>> = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(Mutex::new(false));
        let drive = drive.into();

        let mut workers = Vec::with_capacity(threads.max(1));
        for _ in 0..threads.max(1) {
            let rx = Arc::clone(&rx);
            let results = Arc::clone(&results);
            let transport = Arc::clone(&transport);
            workers.push(thread::spawn(move || loop {
                let job = {
                    let rx = rx.lock().unwrap();
                    rx.recv()
                };
                let job = match job {
                    Ok(job) => job,
                    Err(_) => break, // sender dropped: shutting down
                };
                let outcome = transport.execute(&job.drive, &job.cmd);
                results.lock().unwrap().insert(job.id, Slot::Done(outcome));
            }));
        }

        AsyncPool {
            drive,
            tx,
            results,
            workers,
            next_id: Mutex::new(1),
            shutdown,
        }
    }

    /// Enqueues a command and returns its job id. Never blocks on a busy
    /// pool; the job simply waits in the channel. Submissions made after
    /// [`destroy`](AsyncPool::destroy) has been called are rejected with
    /// `ErrorKind::Timeout` instead of being silently dropped.
    pub fn submit(&self, drive: impl Into<String>, cmd: DriveCommand) -> JobId {
        let drive = drive.into();
        debug_assert_eq!(drive, self.drive, "AsyncPool only services the drive it was created for");
        let id = {
            let mut next = self.next_id.lock().unwrap();
            let id = *next;
            *next += 1;
            id
        };
        if *self.shutdown.lock().unwrap() {
            self.results.lock().unwrap().insert(
                id,
                Slot::Done(Err(Error::new(ErrorKind::Timeout, "pool is shutting down"))),
            );
            return id;
        }
        self.results.lock().unwrap().insert(id, Slot::Pending);
        // Ignore send errors: only possible once the pool is shutting
        // down, in which case the caller's subsequent `find_result` polls
        // will time out rather than hang.
        let _ = self.tx.send(Job { id, drive, cmd });
        id
    }

    /// Polls for `job_id`'s result, retrying up to `retry_max` times with
    /// `retry_interval` between attempts. Returns `ErrorKind::Timeout` if
    /// the job hasn't completed by the final attempt.
    pub fn find_result(&self, job_id: JobId, retry_max: u32, retry_interval: Duration) -> Result<DriveOutcome> {
        for attempt in 0..=retry_max {
            {
                let mut results = self.results.lock().unwrap();
                if let Some(slot) = results.get(&job_id) {
                    if let Slot::Done(_) = slot {
                        if let Some(Slot::Done(outcome)) = results.remove(&job_id) {
                            return outcome;
                        }
                    }
                }
            }
            if attempt != retry_max {
                thread::sleep(retry_interval);
            }
        }
        Err(Error::new(
            ErrorKind::Timeout,
            format!("job {job_id} did not complete within {retry_max} retries"),
        ))
    }

    /// Drops the submission channel and joins every worker. Jobs still
    /// queued when this is called are never executed.
    pub fn destroy(self) {
        *self.shutdown.lock().unwrap() = true;
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive::mem::MemDrive;
    use crate::wire::{Class, Opcode, ResVerType};

    fn lock_cmd(host: u8) -> DriveCommand {
        let mut host_id = [0u8; crate::wire::HOST_ID_LEN];
        host_id[0] = host;
        // Each host targets its own resource id so concurrent jobs never
        // contend with each other -- this suite tests pool plumbing, not
        // MemDrive's conflict rules (covered in drive::mem's own tests).
        DriveCommand::write(
            Opcode::Trylock,
            crate::wire::Record {
                state: None,
                time_now: 0,
                modified: 0,
                countdown: 3000,
                class: Class::Exclusive,
                res_ver_type: ResVerType::NoUpdateNoValid,
                lvb: [0; crate::wire::VALUE_LEN],
                resource_id: [host; crate::wire::LOCK_ID_LEN],
                metadata: [0; crate::wire::METADATA_LEN],
                host_id,
            },
        )
    }

    #[test]
    fn submitted_job_completes_and_is_found() {
        let transport: Arc<dyn DriveTransport> = Arc::new(MemDrive::new());
        let pool = AsyncPool::new("/dev/sd0", transport, 2);
        let id = pool.submit("/dev/sd0", lock_cmd(1));
        let outcome = pool
            .find_result(id, 50, Duration::from_millis(5))
            .expect("job should complete");
        assert_eq!(outcome.status, crate::wire::DeviceStatus::Success);
        pool.destroy();
    }

    #[test]
    fn unknown_job_id_times_out() {
        let transport: Arc<dyn DriveTransport> = Arc::new(MemDrive::new());
        let pool = AsyncPool::new("/dev/sd0", transport, 1);
        let err = pool.find_result(9999, 3, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Timeout);
        pool.destroy();
    }

    #[test]
    fn fifo_delivery_processes_all_jobs() {
        let transport: Arc<dyn DriveTransport> = Arc::new(MemDrive::new());
        let pool = AsyncPool::new("/dev/sd0", transport, 1);
        let ids: Vec<_> = (1..=3u8).map(|h| pool.submit("/dev/sd0", lock_cmd(h))).collect();
        for id in ids {
            let outcome = pool.find_result(id, 100, Duration::from_millis(5)).unwrap();
            assert_eq!(outcome.status, crate::wire::DeviceStatus::Success);
        }
        pool.destroy();
    }
}
