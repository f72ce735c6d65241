use crate::status::StatusWriter;
use crate::{log_error, log_info, Result};
use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;

/// What a step tells the engine to do next.
#[derive(Debug)]
pub enum StepOutcome {
    /// Move on to the next step.
    Continue,
    /// Stop here and mark the workflow successful.
    Done(String),
    /// Stop here and mark the workflow failed.
    Fatal(String),
}

/// Shared state a workflow threads through its steps. `release` runs on
/// every exit path and is where open sessions get closed.
#[async_trait]
pub trait StepContext: Send {
    async fn release(&mut self) {}
}

type StepFn<C> = Box<
    dyn for<'a> Fn(&'a mut C) -> Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send + 'a>>
        + Send
        + Sync,
>;

/// One named step with its checkpoint percentage.
///
/// Percentages are chosen by the concrete workflow to reflect relative step
/// cost, not computed from step count. Conversion is weighted far heavier
/// than cleanup.
pub struct Step<C> {
    name: &'static str,
    progress: u8,
    run: StepFn<C>,
}

impl<C> Step<C> {
    pub fn new<F>(name: &'static str, progress: u8, run: F) -> Self
    where
        F: for<'a> Fn(
                &'a mut C,
            )
                -> Pin<Box<dyn Future<Output = Result<StepOutcome>> + Send + 'a>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            progress,
            run: Box::new(run),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Sequential runner for one background workflow.
///
/// Steps run strictly in order; after each one the engine checkpoints
/// progress into the status store. The first failure becomes the terminal
/// status and the context is released before returning; a workflow never
/// leaks a session, and nothing here retries.
pub struct Workflow<C> {
    name: &'static str,
    writer: StatusWriter,
    steps: Vec<Step<C>>,
}

impl<C: StepContext + 'static> Workflow<C> {
    pub fn new(name: &'static str, writer: StatusWriter) -> Self {
        Self {
            name,
            writer,
            steps: Vec::new(),
        }
    }

    pub fn step(mut self, step: Step<C>) -> Self {
        self.steps.push(step);
        self
    }

    /// Run to completion in the current task, writing terminal status on
    /// every path. Errors never propagate out: by the time a workflow runs,
    /// the accepting call has already returned.
    pub async fn run(self, mut cx: C) {
        let key = self.writer.key().to_string();
        log_info!("Workflow '{}' starting for '{}'", self.name, key);
        self.writer.running(0, &format!("Starting {}...", self.name));

        for step in &self.steps {
            match (step.run)(&mut cx).await {
                Ok(StepOutcome::Continue) => {
                    self.writer
                        .running(step.progress, &format!("{} complete", step.name));
                }
                Ok(StepOutcome::Done(message)) => {
                    self.writer.succeed(&message);
                    cx.release().await;
                    log_info!("Workflow '{}' finished early for '{}'", self.name, key);
                    return;
                }
                Ok(StepOutcome::Fatal(reason)) => {
                    log_error!(
                        "Workflow '{}' step '{}' failed for '{}': {}",
                        self.name,
                        step.name,
                        key,
                        reason
                    );
                    self.writer.fail(&reason);
                    cx.release().await;
                    return;
                }
                Err(err) => {
                    let reason = format!("{} failed: {}", step.name, err);
                    log_error!("Workflow '{}' error for '{}': {}", self.name, key, reason);
                    self.writer.fail(&reason);
                    cx.release().await;
                    return;
                }
            }
        }

        self.writer
            .succeed(&format!("{} completed successfully", self.name));
        cx.release().await;
        log_info!("Workflow '{}' finished for '{}'", self.name, key);
    }

    /// Dispatch onto the runtime and return immediately. The only way to
    /// observe the result is the status store; there is no cancellation.
    pub fn spawn(self, cx: C) {
        tokio::spawn(self.run(cx));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{StatusStore, StatusWriter, WorkflowState};
    use crate::MigrateError;
    use std::sync::Arc;

    struct TestContext {
        visited: Vec<&'static str>,
        released: Arc<std::sync::Mutex<bool>>,
    }

    #[async_trait]
    impl StepContext for TestContext {
        async fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    fn context() -> (TestContext, Arc<std::sync::Mutex<bool>>) {
        let released = Arc::new(std::sync::Mutex::new(false));
        (
            TestContext {
                visited: Vec::new(),
                released: released.clone(),
            },
            released,
        )
    }

    #[tokio::test]
    async fn runs_steps_in_order_and_ends_in_success() {
        let store = StatusStore::new();
        let (cx, released) = context();

        let workflow = Workflow::new("test", StatusWriter::new(store.clone(), "k1"))
            .step(Step::new("first", 30, |cx: &mut TestContext| {
                Box::pin(async move {
                    cx.visited.push("first");
                    Ok(StepOutcome::Continue)
                })
            }))
            .step(Step::new("second", 80, |cx: &mut TestContext| {
                Box::pin(async move {
                    cx.visited.push("second");
                    Ok(StepOutcome::Continue)
                })
            }));

        workflow.run(cx).await;

        let status = store.get("k1").unwrap();
        assert_eq!(status.state, WorkflowState::Success);
        assert_eq!(status.progress, 100);
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn first_error_short_circuits_and_releases() {
        let store = StatusStore::new();
        let (cx, released) = context();

        let workflow = Workflow::new("test", StatusWriter::new(store.clone(), "k2"))
            .step(Step::new("boom", 50, |_cx: &mut TestContext| {
                Box::pin(async move {
                    Err(MigrateError::Precondition("vm missing".into()))
                })
            }))
            .step(Step::new("never", 90, |cx: &mut TestContext| {
                Box::pin(async move {
                    cx.visited.push("never");
                    Ok(StepOutcome::Continue)
                })
            }));

        workflow.run(cx).await;

        let status = store.get("k2").unwrap();
        assert_eq!(status.state, WorkflowState::Error);
        assert!(status.log_tail.contains("vm missing"));
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn done_outcome_skips_remaining_steps() {
        let store = StatusStore::new();
        let (cx, _released) = context();

        let workflow = Workflow::new("test", StatusWriter::new(store.clone(), "k3"))
            .step(Step::new("shortcut", 10, |_cx: &mut TestContext| {
                Box::pin(async move { Ok(StepOutcome::Done("already in place".into())) })
            }))
            .step(Step::new("never", 90, |cx: &mut TestContext| {
                Box::pin(async move {
                    cx.visited.push("never");
                    Ok(StepOutcome::Continue)
                })
            }));

        workflow.run(cx).await;

        let status = store.get("k3").unwrap();
        assert_eq!(status.state, WorkflowState::Success);
        assert_eq!(status.progress, 100);
        assert!(status.log_tail.contains("already in place"));
    }

    #[tokio::test]
    async fn checkpoints_use_step_percentages() {
        let store = StatusStore::new();
        let (cx, _released) = context();

        // The second step reads the store, so it observes exactly what a
        // poller would see right after the first step's checkpoint.
        let observed = Arc::new(std::sync::Mutex::new(None));
        let peek_store = store.clone();
        let peek = observed.clone();

        let workflow = Workflow::new("test", StatusWriter::new(store.clone(), "k4"))
            .step(Step::new("first", 42, |_cx: &mut TestContext| {
                Box::pin(async move { Ok(StepOutcome::Continue) })
            }))
            .step(Step::new("second", 90, move |_cx: &mut TestContext| {
                let store = peek_store.clone();
                let observed = peek.clone();
                Box::pin(async move {
                    *observed.lock().unwrap() = store.get("k4").map(|s| s.progress);
                    Ok(StepOutcome::Continue)
                })
            }));

        workflow.run(cx).await;
        assert_eq!(*observed.lock().unwrap(), Some(42));
        let status = store.get("k4").unwrap();
        assert_eq!(status.state, WorkflowState::Success);
        assert_eq!(status.progress, 100);
    }
}
