//! The map-reduce execution model.
//!
//! A computation over one or more aligned columns is expressed as an
//! [`MrTask`]: a `map` that turns the chunks of one partition into a partial
//! result, and a `reduce` that merges two partial results. A task is run with
//! [`Cloud::run`](crate::Cloud::run):
//!
//! 1. Every node fetches the chunk tuples of the partitions it is home to.
//! 2. Each node splits its partitions into contiguous ranges and maps them
//!    on a pool of scoped threads. Every thread reduces the results of its
//!    range as it goes, then the node reduces its threads' results in order.
//! 3. Node results are serialized, shipped back to the caller and merged in
//!    a binary fan-in tree.
//!
//! Since partitions may be processed in any order, on any node, and merged
//! at any point of the tree, `reduce` must be associative and commutative:
//! a task must produce the same result whatever the partition count or the
//! node that runs each partition.
use crate::error::LiquidError;
use crate::frame::chunk::Chunk;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

mod engine;

/// A per-partition function paired with an associative, commutative merge.
///
/// `map` receives one chunk per input column, in the order the columns were
/// given to the task, all covering the same row range. `map` must only look
/// at the chunks it is given and must be free of side effects, a failed task
/// is never partially applied.
pub trait MrTask: Send + Sync + 'static {
    /// The partial and final result of this task
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Computes the partial result of one partition
    fn map(&self, chunks: &[Chunk]) -> Result<Self::Output, LiquidError>;

    /// Merges two partial results
    fn reduce(
        &self,
        left: Self::Output,
        right: Self::Output,
    ) -> Result<Self::Output, LiquidError>;
}

/// The state of a `Job`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum JobStatus {
    Created = 0,
    Running = 1,
    Done = 2,
    Failed = 3,
    Cancelled = 4,
}

#[derive(Debug, Default)]
struct JobState {
    cancelled: AtomicBool,
    status: AtomicU8,
}

/// A handle to control a running task. Clones share the same state, so one
/// clone can cancel a task another clone was given to.
#[derive(Clone, Debug, Default)]
pub struct Job {
    state: Arc<JobState>,
}

impl Job {
    pub fn new() -> Self {
        Job::default()
    }

    /// Requests cancellation. Workers stop at their next partition boundary,
    /// no further merges happen and the task returns
    /// `LiquidError::Cancelled`.
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// Whether the last task run under this job is done, failed or was
    /// cancelled
    pub fn status(&self) -> JobStatus {
        match self.state.status.load(Ordering::SeqCst) {
            1 => JobStatus::Running,
            2 => JobStatus::Done,
            3 => JobStatus::Failed,
            4 => JobStatus::Cancelled,
            _ => JobStatus::Created,
        }
    }

    pub(crate) fn set_status(&self, status: JobStatus) {
        self.state.status.store(status as u8, Ordering::SeqCst);
    }

    /// Records how a task run under this job ended
    pub(crate) fn finish<T>(&self, result: &Result<T, LiquidError>) {
        self.set_status(match result {
            Ok(_) => JobStatus::Done,
            Err(LiquidError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_cancel_is_shared_by_clones() {
        let job = Job::new();
        let other = job.clone();
        assert_eq!(job.status(), JobStatus::Created);
        other.cancel();
        assert!(job.is_cancelled());
        job.finish::<()>(&Err(LiquidError::Cancelled));
        assert_eq!(other.status(), JobStatus::Cancelled);
        job.finish(&Ok(()));
        assert_eq!(other.status(), JobStatus::Done);
    }
}
