//! Fail-fast coordination of the tasks that make up one phase of a transfer.
//!
//! A [`Phase`] pairs a task set with an error channel sized to the number of tasks it may
//! hold. Every task can report its error without waiting for anyone to read it, the first
//! error reported wins, and dropping the phase aborts whatever async tasks are still running.

use anyhow::{Context, anyhow};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

pub struct Phase<T> {
    name: &'static str,
    capacity: usize,
    spawned: usize,
    tasks: JoinSet<Option<T>>,
    errors_tx: mpsc::Sender<anyhow::Error>,
    errors_rx: mpsc::Receiver<anyhow::Error>,
}

impl<T> std::fmt::Debug for Phase<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("spawned", &self.spawned)
            .field("running", &self.tasks.len())
            .finish()
    }
}

impl<T: Send + 'static> Phase<T> {
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (errors_tx, errors_rx) = mpsc::channel(capacity);
        Self {
            name,
            capacity,
            spawned: 0,
            tasks: JoinSet::new(),
            errors_tx,
            errors_rx,
        }
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    fn reserve(&mut self) -> anyhow::Result<mpsc::Sender<anyhow::Error>> {
        if self.spawned >= self.capacity {
            anyhow::bail!(
                "{} phase already runs its maximum of {} tasks",
                self.name,
                self.capacity
            );
        }
        self.spawned += 1;
        Ok(self.errors_tx.clone())
    }

    fn report(errors: &mpsc::Sender<anyhow::Error>, error: anyhow::Error) {
        // capacity equals the task limit, so this only fails once the phase was dropped
        if let Err(error) = errors.try_send(error) {
            tracing::debug!("phase error dropped: {:#}", error.into_inner());
        }
    }

    /// Runs an async task as part of this phase.
    pub fn spawn<F>(&mut self, task: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let errors = self.reserve()?;
        self.tasks.spawn(async move {
            match task.await {
                Ok(output) => Some(output),
                Err(error) => {
                    Self::report(&errors, error);
                    None
                }
            }
        });
        Ok(())
    }

    /// Runs a blocking task as part of this phase.
    ///
    /// Blocking tasks cannot be aborted; when the phase fails they run until they return.
    pub fn spawn_blocking<F>(&mut self, task: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let errors = self.reserve()?;
        self.tasks.spawn_blocking(move || match task() {
            Ok(output) => Some(output),
            Err(error) => {
                Self::report(&errors, error);
                None
            }
        });
        Ok(())
    }

    /// Waits for every task and returns their outputs in completion order.
    ///
    /// Returns as soon as any task fails, with that task's error. The remaining tasks are
    /// aborted when the phase is dropped on return.
    pub async fn wait(mut self) -> anyhow::Result<Vec<T>> {
        let mut outputs = Vec::with_capacity(self.spawned);
        loop {
            tokio::select! {
                biased;
                Some(error) = self.errors_rx.recv() => {
                    tracing::debug!("{} phase failed, abandoning {} task(s)", self.name, self.tasks.len());
                    return Err(error).with_context(|| format!("{} phase failed", self.name));
                }
                joined = self.tasks.join_next() => match joined {
                    None => break,
                    Some(Ok(Some(output))) => outputs.push(output),
                    Some(Ok(None)) => {}
                    Some(Err(error)) => {
                        return Err(anyhow!(error)).with_context(|| format!("{} phase task did not complete", self.name));
                    }
                }
            }
        }
        if let Ok(error) = self.errors_rx.try_recv() {
            return Err(error).with_context(|| format!("{} phase failed", self.name));
        }
        tracing::debug!("{} phase finished", self.name);
        Ok(outputs)
    }
}
