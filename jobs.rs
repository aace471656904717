use crate::config::Settings;
use crate::db::{self, DbPool};
use crate::error::{Error, Result};
use crate::scan::{self, ScanContext};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ScanJob {
    user_id: i64,
    force_full: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    completed: AtomicUsize,
    failed: AtomicUsize,
    albums: AtomicUsize,
    errors: AtomicUsize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub completed: usize,
    pub failed: usize,
    pub albums: usize,
    pub errors: usize,
}

/// User scans executed by a fixed set of worker threads, sized by the validated worker count.
pub struct ScanQueue {
    sender: Option<Sender<ScanJob>>,
    workers: Vec<thread::JoinHandle<()>>,
    state: Arc<QueueState>,
    pool: DbPool,
}

impl ScanQueue {
    /// Fails before any worker starts when the settings are invalid for the backend.
    pub fn new(pool: DbPool, ctx: ScanContext, settings: &Settings) -> Result<Self> {
        settings.validate()?;
        let worker_count = settings.scanner.effective_workers(settings.database)?;

        let (sender, receiver) = unbounded::<ScanJob>();
        let state = Arc::new(QueueState::default());
        let workers = (0..worker_count)
            .map(|_| {
                let receiver = receiver.clone();
                let pool = pool.clone();
                let ctx = ctx.clone();
                let state = state.clone();
                thread::spawn(move || run_scan_worker(receiver, pool, ctx, state))
            })
            .collect();
        log::info!("Scan queue started with {} workers", worker_count);

        Ok(Self {
            sender: Some(sender),
            workers,
            state,
            pool,
        })
    }

    pub fn enqueue(&self, user_id: i64, force_full: bool) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| Error::Init("Scan queue is shut down".into()))?;
        sender
            .send(ScanJob {
                user_id,
                force_full,
            })
            .map_err(|_| Error::Init("Scan workers are gone".into()))
    }

    /// Queues a scan for every user. Returns how many were queued.
    pub fn enqueue_all(&self, force_full: bool) -> Result<usize> {
        let conn = self.pool.get()?;
        let users = db::list_users(&conn)?;
        for user in &users {
            self.enqueue(user.id, force_full)?;
        }
        Ok(users.len())
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            completed: self.state.completed.load(Ordering::Relaxed),
            failed: self.state.failed.load(Ordering::Relaxed),
            albums: self.state.albums.load(Ordering::Relaxed),
            errors: self.state.errors.load(Ordering::Relaxed),
        }
    }

    /// Lets queued jobs finish, then joins the workers.
    pub fn shutdown(mut self) -> QueueStats {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Scan worker exited by panic");
            }
        }
        self.stats()
    }
}

fn run_scan_worker(receiver: Receiver<ScanJob>, pool: DbPool, ctx: ScanContext, state: Arc<QueueState>) {
    for job in receiver.iter() {
        let started = Instant::now();
        let outcome = catch_unwind(AssertUnwindSafe(|| run_scan_job(&pool, &ctx, job)));
        match outcome {
            Ok(Ok((albums, errors))) => {
                state.completed.fetch_add(1, Ordering::Relaxed);
                state.albums.fetch_add(albums, Ordering::Relaxed);
                state.errors.fetch_add(errors, Ordering::Relaxed);
                log::info!(
                    "Scan of user {} finished in {:.2?}: {} albums, {} errors",
                    job.user_id,
                    started.elapsed(),
                    albums,
                    errors
                );
            }
            Ok(Err(err)) => {
                state.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Scan of user {} failed: {}", job.user_id, err);
            }
            Err(_) => {
                state.failed.fetch_add(1, Ordering::Relaxed);
                log::error!("Scan of user {} panicked", job.user_id);
            }
        }
    }
}

fn run_scan_job(pool: &DbPool, ctx: &ScanContext, job: ScanJob) -> Result<(usize, usize)> {
    let user = {
        let conn = pool.get()?;
        db::find_user(&conn, job.user_id)?
    };
    let Some(user) = user else {
        return Err(Error::Config(format!("unknown user {}", job.user_id)));
    };

    let report = scan::scan_user(pool, ctx, &user, job.force_full)?;
    for err in &report.errors {
        log::warn!("Scan of {}: {}", user.username, err);
    }
    Ok((report.needs_processing.len(), report.errors.len()))
}
