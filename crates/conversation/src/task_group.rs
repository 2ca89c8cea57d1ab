//! Supervision for the child tasks a response session dispatches.

use std::future::Future;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::{JoinError, JoinHandle};

use crate::error::{ConversationError, ConversationResult};

type ChildResult = ConversationResult<()>;

/// A set of spawned tasks that can be joined, aborted, or dropped.
///
/// Joining surfaces the first error any child returned. Dropping the group
/// detaches its children; they run to completion unsupervised.
#[derive(Default)]
pub struct TaskGroup {
    handles: Mutex<Vec<JoinHandle<ChildResult>>>,
    first_error: Mutex<Option<ConversationError>>,
}

impl TaskGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ChildResult> + Send + 'static,
    {
        let handle = tokio::spawn(future);
        let mut handles = self.handles.lock();
        self.prune(&mut handles);
        handles.push(handle);
    }

    /// Waits for every child, including ones spawned while joining.
    pub async fn join_all(&self) -> ChildResult {
        loop {
            let handles = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let result = handle.await;
                self.record(result);
            }
        }
        let first_error = self.first_error.lock().take();
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn abort_all(&self) {
        for handle in self.handles.lock().iter() {
            handle.abort();
        }
    }

    /// Number of children still running.
    pub fn len(&self) -> usize {
        let mut handles = self.handles.lock();
        self.prune(&mut handles);
        handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, handles: &mut Vec<JoinHandle<ChildResult>>) {
        handles.retain_mut(|handle| {
            if !handle.is_finished() {
                return true;
            }
            if let Some(result) = handle.now_or_never() {
                self.record(result);
            }
            false
        });
    }

    fn record(&self, result: Result<ChildResult, JoinError>) {
        let err = match result {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(join_err) if join_err.is_cancelled() => ConversationError::Cancelled,
            Err(join_err) => {
                ConversationError::UpstreamSynthesis(format!("child task panicked: {join_err}"))
            }
        };
        let mut first_error = self.first_error.lock();
        if first_error.is_none() {
            *first_error = Some(err);
        }
    }
}
