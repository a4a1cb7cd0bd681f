//! Step scheduling and the job driver.

use std::collections::HashMap;
use std::fmt::Debug;
use std::mem::{discriminant, Discriminant};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

use crate::job::error::JobError;

/// A multi-step operation driven by [`run`].
///
/// Steps are usually an enum; gates set with [`Job::wait`] and
/// [`Job::never_call`] apply to a whole variant regardless of its payload.
#[async_trait]
pub trait Flow: Send + Sync + Sized + 'static {
    type Step: Debug + Send + 'static;
    type Output: Send + 'static;
    type Error: From<JobError> + Send + 'static;

    /// Name used in logs and in [`JobError::Stalled`].
    const NAME: &'static str;

    /// Run one step. Returning an error settles the job with it and halts
    /// every later call.
    async fn step(&self, step: Self::Step, job: &Job<Self>) -> Result<(), Self::Error>;
}

enum Gate {
    Skip(usize),
    Never,
}

type Outcome<F> = Result<<F as Flow>::Output, <F as Flow>::Error>;

/// Scheduling state of one running flow.
pub struct Job<F: Flow> {
    queue: mpsc::UnboundedSender<F::Step>,
    gates: Mutex<HashMap<Discriminant<F::Step>, Gate>>,
    outcome: Mutex<Option<oneshot::Sender<Outcome<F>>>>,
    halted: AtomicBool,
}

impl<F: Flow> Job<F> {
    fn new(queue: mpsc::UnboundedSender<F::Step>, outcome: oneshot::Sender<Outcome<F>>) -> Self {
        Self {
            queue,
            gates: Mutex::new(HashMap::new()),
            outcome: Mutex::new(Some(outcome)),
            halted: AtomicBool::new(false),
        }
    }

    /// Schedule `step` to run after the current step yields.
    ///
    /// The call is dropped if the job is halted, if the variant is marked
    /// unreachable, or if the variant still has skips left (one is used up).
    pub fn call(&self, step: F::Step) {
        if self.halted.load(Ordering::Acquire) {
            trace!(flow = F::NAME, ?step, "job halted, call dropped");
            return;
        }

        {
            let mut gates = self.gates.lock();
            match gates.get_mut(&discriminant(&step)) {
                Some(Gate::Never) => {
                    trace!(flow = F::NAME, ?step, "step marked unreachable, call dropped");
                    return;
                }
                Some(Gate::Skip(left)) if *left > 0 => {
                    *left -= 1;
                    trace!(flow = F::NAME, ?step, left = *left, "step skipped");
                    return;
                }
                _ => {}
            }
        }

        if let Err(mpsc::error::SendError(step)) = self.queue.send(step) {
            trace!(flow = F::NAME, ?step, "driver gone, call dropped");
        }
    }

    /// Skip the next `times` calls to this step's variant.
    pub fn wait(&self, step: &F::Step, times: usize) {
        let mut gates = self.gates.lock();
        match gates.get(&discriminant(step)) {
            Some(Gate::Never) => {}
            _ => {
                gates.insert(discriminant(step), Gate::Skip(times));
            }
        }
    }

    /// Ignore every later call to this step's variant.
    pub fn never_call(&self, step: &F::Step) {
        self.gates.lock().insert(discriminant(step), Gate::Never);
    }

    /// Deliver the terminal outcome. Only the first settlement is kept;
    /// returns whether this one was.
    pub fn settle(&self, result: Outcome<F>) -> bool {
        match self.outcome.lock().take() {
            Some(tx) => tx.send(result).is_ok(),
            None => {
                debug!(flow = F::NAME, "job already settled, outcome dropped");
                false
            }
        }
    }

    pub fn succeed(&self, output: F::Output) -> bool {
        self.settle(Ok(output))
    }

    /// Settle with an error and halt.
    pub fn fail(&self, error: F::Error) -> bool {
        self.halt();
        self.settle(Err(error))
    }

    /// Turn every later [`Job::call`] into a no-op. Running steps finish.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::Release);
    }

    pub fn is_settled(&self) -> bool {
        self.outcome.lock().is_none()
    }
}

async fn drive<F: Flow>(flow: &F, job: &Job<F>, step: F::Step) {
    if let Err(error) = flow.step(step, job).await {
        job.fail(error);
    }
}

/// Run `flow` from `first` until the job has settled and every started step
/// has finished.
///
/// Queued steps start in call order. Started steps are polled concurrently,
/// so a step that awaits the backing store does not hold back its siblings.
pub async fn run<F: Flow>(flow: &F, first: F::Step) -> Result<F::Output, F::Error> {
    let (queue_tx, mut queue) = mpsc::unbounded_channel();
    let (outcome_tx, mut outcome) = oneshot::channel();
    let job = Job::<F>::new(queue_tx, outcome_tx);
    job.call(first);

    let mut running = FuturesUnordered::new();
    loop {
        if running.is_empty() {
            match queue.try_recv() {
                Ok(step) => {
                    debug!(flow = F::NAME, ?step, "step");
                    running.push(drive(flow, &job, step));
                    continue;
                }
                Err(_) => break,
            }
        }

        tokio::select! {
            biased;
            Some(step) = queue.recv() => {
                debug!(flow = F::NAME, ?step, "step");
                running.push(drive(flow, &job, step));
            }
            _ = running.next() => {}
        }
    }

    match outcome.try_recv() {
        Ok(result) => result,
        Err(_) => Err(JobError::Stalled { flow: F::NAME }.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum TestError {
        Job(JobError),
        Step(String),
    }

    impl From<JobError> for TestError {
        fn from(e: JobError) -> Self {
            TestError::Job(e)
        }
    }

    #[derive(Debug)]
    enum Step {
        Start,
        Part(usize),
        Extra(&'static str),
        Success,
        Error(String),
    }

    /// Programmable flow: `script` decides what Start does.
    struct Script {
        log: Mutex<Vec<String>>,
        start: fn(&Job<Script>),
    }

    impl Script {
        fn new(start: fn(&Job<Script>)) -> Self {
            Self {
                log: Mutex::new(Vec::new()),
                start,
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().clone()
        }
    }

    #[async_trait]
    impl Flow for Script {
        type Step = Step;
        type Output = usize;
        type Error = TestError;
        const NAME: &'static str = "script";

        async fn step(&self, step: Step, job: &Job<Self>) -> Result<(), TestError> {
            match step {
                Step::Start => {
                    self.log.lock().push("start".into());
                    (self.start)(job);
                    self.log.lock().push("start-end".into());
                }
                Step::Part(n) => {
                    tokio::task::yield_now().await;
                    self.log.lock().push(format!("part{}", n));
                    if n == 99 {
                        return Err(TestError::Step("part failed".into()));
                    }
                    job.call(Step::Success);
                }
                Step::Extra(name) => self.log.lock().push(name.to_string()),
                Step::Success => {
                    let count = self.log.lock().iter().filter(|l| l.starts_with("part")).count();
                    self.log.lock().push("success".into());
                    job.succeed(count);
                }
                Step::Error(msg) => {
                    job.never_call(&Step::Success);
                    job.fail(TestError::Step(msg));
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_wait_fires_success_once() {
        let flow = Script::new(|job| {
            job.wait(&Step::Success, 2);
            for i in 0..3 {
                job.call(Step::Part(i));
            }
        });

        let result = run(&flow, Step::Start).await;
        assert_eq!(result, Ok(3));
        let log = flow.log();
        assert_eq!(log.iter().filter(|l| *l == "success").count(), 1);
        assert_eq!(log.last().unwrap(), "success");
    }

    #[tokio::test]
    async fn test_never_call_ignores_step() {
        let flow = Script::new(|job| {
            job.never_call(&Step::Success);
            job.call(Step::Success);
            job.call(Step::Error("boom".into()));
        });

        let result = run(&flow, Step::Start).await;
        assert_eq!(result, Err(TestError::Step("boom".into())));
        assert!(!flow.log().contains(&"success".to_string()));
    }

    #[tokio::test]
    async fn test_never_call_overrides_wait() {
        let flow = Script::new(|job| {
            job.never_call(&Step::Success);
            job.wait(&Step::Success, 0);
            job.call(Step::Success);
        });

        let result = run(&flow, Step::Start).await;
        assert_eq!(result, Err(TestError::Job(JobError::Stalled { flow: "script" })));
    }

    #[tokio::test]
    async fn test_first_settlement_wins() {
        let flow = Script::new(|job| {
            assert!(job.succeed(1));
            assert!(job.is_settled());
            assert!(!job.succeed(2));
            assert!(!job.fail(TestError::Step("late".into())));
        });

        assert_eq!(run(&flow, Step::Start).await, Ok(1));
    }

    #[tokio::test]
    async fn test_calls_are_not_reentrant() {
        let flow = Script::new(|job| {
            job.call(Step::Extra("a"));
            job.call(Step::Extra("b"));
            job.call(Step::Success);
        });

        run(&flow, Step::Start).await.unwrap();
        assert_eq!(flow.log(), vec!["start", "start-end", "a", "b", "success"]);
    }

    #[tokio::test]
    async fn test_step_error_halts_job() {
        let flow = Script::new(|job| {
            job.call(Step::Part(99));
        });

        let result = run(&flow, Step::Start).await;
        assert_eq!(result, Err(TestError::Step("part failed".into())));
        // Part(99) failed before calling Success
        assert!(!flow.log().contains(&"success".to_string()));
    }

    #[tokio::test]
    async fn test_halt_drops_later_calls() {
        let flow = Script::new(|job| {
            job.halt();
            job.call(Step::Success);
        });

        let result = run(&flow, Step::Start).await;
        assert_eq!(result, Err(TestError::Job(JobError::Stalled { flow: "script" })));
    }

    #[tokio::test]
    async fn test_unsettled_job_stalls() {
        let flow = Script::new(|job| job.call(Step::Extra("only")));

        let result = run(&flow, Step::Start).await;
        assert!(matches!(result, Err(TestError::Job(JobError::Stalled { .. }))));
        assert_eq!(flow.log(), vec!["start", "start-end", "only"]);
    }
}
