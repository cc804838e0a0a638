//! Runs `MrTask`s and chunk-wise transforms over the nodes of a `Cloud`.
use crate::cloud::Cloud;
use crate::error::LiquidError;
use crate::frame::chunk::{Chunk, Values};
use crate::frame::column::{Column, ColumnType, Layout};
use crate::kv::{KVStore, Key, Value};
use crate::mr::{Job, JobStatus, MrTask};
use bincode::{deserialize, serialize};
use crossbeam_utils::thread;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Keeps the first failure, unless it is a `Cancelled` that was caused by a
/// later, real failure halting the other workers.
fn keep_first(failure: &mut Option<LiquidError>, e: LiquidError) {
    match failure {
        None => *failure = Some(e),
        Some(LiquidError::Cancelled) if !matches!(e, LiquidError::Cancelled) => {
            *failure = Some(e)
        }
        Some(_) => {}
    }
}

fn partition_failure(partition: usize, e: LiquidError) -> LiquidError {
    match e {
        LiquidError::Cancelled | LiquidError::TaskFailed { .. } => e,
        e => LiquidError::TaskFailed {
            partition,
            source: Box::new(e),
        },
    }
}

fn stopped(job: &Job, halt: &AtomicBool) -> bool {
    job.is_cancelled() || halt.load(Ordering::SeqCst)
}

/// Splits `items` into at most `n_threads` contiguous ranges and calls `f`
/// on each range on its own scoped thread. Returns the results in range
/// order, or the first error. A panicking thread is an `Execution` error.
pub(crate) fn for_each_range<I, R, F>(
    items: &[I],
    n_threads: usize,
    f: F,
) -> Result<Vec<R>, LiquidError>
where
    I: Sync,
    R: Send,
    F: Fn(&[I]) -> Result<R, LiquidError> + Sync,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let n_threads = n_threads.clamp(1, items.len());
    let step = (items.len() + n_threads - 1) / n_threads;
    let f = &f;
    let joined = thread::scope(|s| {
        let threads: Vec<_> = items
            .chunks(step)
            .map(|range| s.spawn(move |_| f(range)))
            .collect();
        threads.into_iter().map(|t| t.join()).collect::<Vec<_>>()
    })
    .map_err(|_| LiquidError::Execution("a worker thread panicked".to_string()))?;

    let mut results = Vec::with_capacity(joined.len());
    let mut failure = None;
    for outcome in joined {
        match outcome {
            Ok(Ok(r)) => results.push(r),
            Ok(Err(e)) => keep_first(&mut failure, e),
            Err(_) => keep_first(
                &mut failure,
                LiquidError::Execution("a worker thread panicked".to_string()),
            ),
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(results),
    }
}

fn fold_partials<T: MrTask>(
    task: &T,
    partials: impl IntoIterator<Item = T::Output>,
) -> Result<Option<T::Output>, LiquidError> {
    let mut acc = None;
    for partial in partials {
        acc = Some(match acc {
            None => partial,
            Some(prev) => task.reduce(prev, partial)?,
        });
    }
    Ok(acc)
}

fn map_range<T: MrTask>(
    task: &T,
    range: &[(usize, Vec<Chunk>)],
    job: &Job,
    halt: &AtomicBool,
) -> Result<Option<T::Output>, LiquidError> {
    let mut acc = None;
    for (idx, chunks) in range {
        if stopped(job, halt) {
            return Err(LiquidError::Cancelled);
        }
        let partial = task.map(chunks).map_err(|e| partition_failure(*idx, e))?;
        acc = Some(match acc {
            None => partial,
            Some(prev) => task
                .reduce(prev, partial)
                .map_err(|e| partition_failure(*idx, e))?,
        });
    }
    Ok(acc)
}

/// Maps the given partition tuples on `n_threads` threads and reduces their
/// results in partition order. `None` if there were no partitions.
pub(crate) fn map_local<T: MrTask>(
    task: &T,
    tuples: &[(usize, Vec<Chunk>)],
    n_threads: usize,
    job: &Job,
    halt: &AtomicBool,
) -> Result<Option<T::Output>, LiquidError> {
    let partials = for_each_range(tuples, n_threads, |range| {
        map_range(task, range, job, halt).map_err(|e| {
            halt.store(true, Ordering::SeqCst);
            e
        })
    })?;
    fold_partials(task, partials.into_iter().flatten())
}

/// Merges `level` pairwise, level by level, until one result is left
pub(crate) fn tree_reduce<T: MrTask>(
    task: &T,
    mut level: Vec<T::Output>,
    job: &Job,
) -> Result<Option<T::Output>, LiquidError> {
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        let mut pairs = level.into_iter();
        while let Some(left) = pairs.next() {
            if job.is_cancelled() {
                return Err(LiquidError::Cancelled);
            }
            next.push(match pairs.next() {
                Some(right) => task.reduce(left, right)?,
                None => left,
            });
        }
        level = next;
    }
    Ok(level.pop())
}

/// The layout shared by every column of `columns`
fn aligned_layout(columns: &[&Column]) -> Result<Layout, LiquidError> {
    let first = columns.first().ok_or_else(|| {
        LiquidError::MissingColumn("a task needs at least one input column".to_string())
    })?;
    if columns.iter().any(|c| c.layout != first.layout) {
        return Err(LiquidError::Misaligned);
    }
    Ok(first.layout.clone())
}

async fn fetch_and_map<T: MrTask>(
    kv: &KVStore,
    task: Arc<T>,
    parts: Vec<(usize, Vec<Key>)>,
    n_threads: usize,
    job: &Job,
    halt: &Arc<AtomicBool>,
) -> Result<Option<Value>, LiquidError> {
    let id = kv.id();
    let mut tuples = Vec::with_capacity(parts.len());
    for (idx, keys) in parts {
        if stopped(job, halt) {
            return Err(LiquidError::Cancelled);
        }
        let mut chunks = Vec::with_capacity(keys.len());
        for key in &keys {
            let chunk = kv
                .fetch::<Chunk>(key)
                .await
                .map_err(|e| partition_failure(idx, e))?;
            chunks.push(chunk);
        }
        tuples.push((idx, chunks));
    }
    debug!("Node {} mapping {} partitions", id, tuples.len());
    let (job, halt) = (job.clone(), halt.clone());
    let partial = tokio::task::spawn_blocking(move || {
        map_local(&*task, &tuples, n_threads, &job, &halt)
    })
    .await
    .map_err(|e| {
        LiquidError::Execution(format!("the map phase on node {} failed: {}", id, e))
    })??;
    match partial {
        Some(p) => Ok(Some(serialize(&p)?)),
        None => Ok(None),
    }
}

/// Runs the map phase of a task on one node and serializes its partial
/// result, halting every other worker of the task on failure.
async fn map_on_node<T: MrTask>(
    kv: Arc<KVStore>,
    task: Arc<T>,
    parts: Vec<(usize, Vec<Key>)>,
    n_threads: usize,
    job: Job,
    halt: Arc<AtomicBool>,
) -> Result<Option<Value>, LiquidError> {
    let result = fetch_and_map(&kv, task, parts, n_threads, &job, &halt).await;
    if let Err(e) = &result {
        if !matches!(e, LiquidError::Cancelled) {
            halt.store(true, Ordering::SeqCst);
        }
    }
    result
}

#[allow(clippy::too_many_arguments)]
async fn transform_on_node<F>(
    kv: Arc<KVStore>,
    f: Arc<F>,
    source: Column,
    target: Column,
    parts: Vec<usize>,
    n_threads: usize,
    job: Job,
    halt: Arc<AtomicBool>,
) -> Result<(), LiquidError>
where
    F: Fn(&Chunk) -> Result<Values, LiquidError> + Send + Sync + 'static,
{
    let mut inputs = Vec::with_capacity(parts.len());
    for idx in parts {
        let chunk = source
            .chunk(&kv, idx)
            .await
            .map_err(|e| partition_failure(idx, e))?;
        inputs.push((idx, chunk));
    }
    let (job_w, halt_w) = (job.clone(), halt.clone());
    let outputs = tokio::task::spawn_blocking(move || {
        for_each_range(&inputs, n_threads, |range| {
            let mut out = Vec::with_capacity(range.len());
            for (idx, chunk) in range {
                if stopped(&job_w, &halt_w) {
                    return Err(LiquidError::Cancelled);
                }
                let values = (*f)(chunk).map_err(|e| partition_failure(*idx, e))?;
                if values.len() != chunk.len() {
                    return Err(partition_failure(
                        *idx,
                        LiquidError::Execution(format!(
                            "a transform produced {} rows from a chunk of {}",
                            values.len(),
                            chunk.len()
                        )),
                    ));
                }
                out.push((*idx, Chunk::from_values(chunk.start(), values)));
            }
            Ok(out)
        })
        .map_err(|e| {
            halt_w.store(true, Ordering::SeqCst);
            e
        })
    })
    .await
    .map_err(|e| {
        LiquidError::Execution(format!("a transform on node {} failed: {}", kv.id(), e))
    })??;
    for (idx, chunk) in outputs.into_iter().flatten() {
        kv.put(&target.chunk_key(idx), &chunk).await?;
    }
    Ok(())
}

async fn align_on_node(
    kv: Arc<KVStore>,
    source: Column,
    target: Column,
    parts: Vec<usize>,
    job: Job,
    halt: Arc<AtomicBool>,
) -> Result<(), LiquidError> {
    for idx in parts {
        if stopped(&job, &halt) {
            return Err(LiquidError::Cancelled);
        }
        let rows = target.layout.chunk_range(idx);
        let values = source
            .slice(&kv, rows.clone())
            .await
            .map_err(|e| partition_failure(idx, e))?;
        let chunk = Chunk::from_values(rows.start, values);
        kv.put(&target.chunk_key(idx), &chunk).await?;
    }
    Ok(())
}

/// Awaits per-node tasks, returning the first failure
async fn join_nodes<R>(
    handles: Vec<tokio::task::JoinHandle<Result<R, LiquidError>>>,
    halt: &AtomicBool,
) -> (Vec<R>, Option<LiquidError>) {
    let mut results = Vec::with_capacity(handles.len());
    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(r)) => results.push(r),
            Ok(Err(e)) => {
                if !matches!(e, LiquidError::Cancelled) {
                    halt.store(true, Ordering::SeqCst);
                }
                keep_first(&mut failure, e)
            }
            Err(e) => {
                halt.store(true, Ordering::SeqCst);
                keep_first(
                    &mut failure,
                    LiquidError::Execution(format!("a node task failed: {}", e)),
                )
            }
        }
    }
    (results, failure)
}

impl Cloud {
    /// Runs `task` over the aligned `columns`, see [`Cloud::run_job`]
    pub async fn run<T: MrTask>(
        &self,
        task: T,
        columns: &[&Column],
    ) -> Result<T::Output, LiquidError> {
        self.run_job(&Job::new(), task, columns).await
    }

    /// Runs `task` over every partition of the aligned `columns` and
    /// returns the merged result. `job` may be used to cancel the task while
    /// it runs.
    ///
    /// ## Errors
    /// - `MissingColumn` if no columns are given and `Misaligned` if their
    ///   layouts differ, before any partition work starts
    /// - `TaskFailed` with the index of the first partition that failed
    /// - `Cancelled` if `job` was cancelled
    pub async fn run_job<T: MrTask>(
        &self,
        job: &Job,
        task: T,
        columns: &[&Column],
    ) -> Result<T::Output, LiquidError> {
        let layout = aligned_layout(columns)?;
        layout.check_homes(self.num_nodes())?;
        job.set_status(JobStatus::Running);
        info!(
            "Running a task over {} columns in {} partitions",
            columns.len(),
            layout.n_chunks()
        );
        let result = self.map_reduce(job, Arc::new(task), columns, &layout).await;
        job.finish(&result);
        result
    }

    async fn map_reduce<T: MrTask>(
        &self,
        job: &Job,
        task: Arc<T>,
        columns: &[&Column],
        layout: &Layout,
    ) -> Result<T::Output, LiquidError> {
        let halt = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for kv in &self.nodes {
            let parts: Vec<(usize, Vec<Key>)> = layout
                .chunks_on(kv.id())
                .into_iter()
                .map(|idx| (idx, columns.iter().map(|c| c.chunk_key(idx)).collect()))
                .collect();
            if parts.is_empty() {
                continue;
            }
            let n_threads = self.config.n_threads;
            let (kv, task, job, halt) =
                (kv.clone(), task.clone(), job.clone(), halt.clone());
            handles.push(tokio::spawn(async move {
                map_on_node(kv, task, parts, n_threads, job, halt).await
            }));
        }
        let (blobs, failure) = join_nodes(handles, &halt).await;
        if let Some(e) = failure {
            return Err(e);
        }
        if job.is_cancelled() {
            return Err(LiquidError::Cancelled);
        }
        let partials = blobs
            .into_iter()
            .flatten()
            .map(|blob| deserialize(&blob[..]))
            .collect::<Result<Vec<T::Output>, _>>()?;
        tree_reduce(&*task, partials, job)?.ok_or_else(|| {
            LiquidError::Execution("the task produced no result".to_string())
        })
    }

    /// Creates a new column under `key` with the layout of `source`, whose
    /// chunk `i` holds the values `f` computes from chunk `i` of `source`.
    /// Output chunks are written on the home node of each partition and the
    /// column metadata is published last.
    ///
    /// If any chunk fails, every chunk already written is removed before the
    /// error is returned.
    pub async fn transform<F>(
        &self,
        job: &Job,
        source: &Column,
        key: Key,
        kind: ColumnType,
        domain: Option<Vec<String>>,
        f: F,
    ) -> Result<Column, LiquidError>
    where
        F: Fn(&Chunk) -> Result<Values, LiquidError> + Send + Sync + 'static,
    {
        source.layout.check_homes(self.num_nodes())?;
        if self.kv().get_raw(&key).await?.is_some() {
            return Err(LiquidError::KeyAlreadyExists(key));
        }
        let target = Column {
            key,
            layout: source.layout.clone(),
            kind,
            domain,
        };
        job.set_status(JobStatus::Running);
        debug!("Transforming {} into {}", source.key, target.key);
        let f = Arc::new(f);
        let halt = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for kv in &self.nodes {
            let parts = source.layout.chunks_on(kv.id());
            if parts.is_empty() {
                continue;
            }
            let n_threads = self.config.n_threads;
            let (kv, f, job, halt) = (kv.clone(), f.clone(), job.clone(), halt.clone());
            let (source, target) = (source.clone(), target.clone());
            handles.push(tokio::spawn(async move {
                transform_on_node(kv, f, source, target, parts, n_threads, job, halt)
                    .await
            }));
        }
        let (_, failure) = join_nodes(handles, &halt).await;
        let result = self.publish_or_discard(job, target, failure).await;
        job.finish(&result);
        result
    }

    /// Re-chunks `source` onto `layout` as a new column under `key`. Each
    /// target chunk is assembled on its home node from whichever source
    /// chunks overlap it.
    pub async fn align(
        &self,
        job: &Job,
        source: &Column,
        layout: &Layout,
        key: Key,
    ) -> Result<Column, LiquidError> {
        if source.len() != layout.row_count() {
            return Err(LiquidError::LengthMismatch {
                left: source.len(),
                right: layout.row_count(),
            });
        }
        layout.check_homes(self.num_nodes())?;
        if self.kv().get_raw(&key).await?.is_some() {
            return Err(LiquidError::KeyAlreadyExists(key));
        }
        let target = Column {
            key,
            layout: layout.clone(),
            kind: source.kind,
            domain: source.domain.clone(),
        };
        job.set_status(JobStatus::Running);
        debug!(
            "Aligning {} onto {} partitions as {}",
            source.key,
            layout.n_chunks(),
            target.key
        );
        let halt = Arc::new(AtomicBool::new(false));
        let mut handles = Vec::new();
        for kv in &self.nodes {
            let parts = layout.chunks_on(kv.id());
            if parts.is_empty() {
                continue;
            }
            let (kv, job, halt) = (kv.clone(), job.clone(), halt.clone());
            let (source, target) = (source.clone(), target.clone());
            handles.push(tokio::spawn(async move {
                align_on_node(kv, source, target, parts, job, halt).await
            }));
        }
        let (_, failure) = join_nodes(handles, &halt).await;
        let result = self.publish_or_discard(job, target, failure).await;
        job.finish(&result);
        result
    }

    /// Publishes the metadata of a column whose chunks were all written, or
    /// removes whatever chunks were written if the work failed
    async fn publish_or_discard(
        &self,
        job: &Job,
        target: Column,
        failure: Option<LiquidError>,
    ) -> Result<Column, LiquidError> {
        let failure = match failure {
            None if job.is_cancelled() => Some(LiquidError::Cancelled),
            other => other,
        };
        if let Some(e) = failure {
            self.remove_chunks(&target).await;
            return Err(e);
        }
        if let Err(e) = self.kv().put(&target.key, &target).await {
            self.remove_chunks(&target).await;
            return Err(e);
        }
        Ok(target)
    }
}
