//! Async job sequencing for multi-step backing store operations.
//!
//! Every engine operation is a small graph of steps (load the side-car, write
//! the blob, write the side-car, report). A [`Flow`] names its steps and says
//! what each one does; [`run`] drives them and hands back the single terminal
//! outcome.
//!
//! # Architecture
//!
//! ```text
//!   Job::call(step) ──► gate check ──► FIFO queue
//!                       (skip N /          │
//!                        never)            ▼
//!                                 ┌──────────────────┐
//!                                 │       run        │
//!                                 │ FuturesUnordered │
//!                                 └──────────────────┘
//!                                          │
//!                         Job::settle ─────┴────► one-shot outcome
//!                         (first one wins)
//! ```
//!
//! Fan-out is expressed with gates: a step that starts `n` parallel
//! sub-operations calls `job.wait(&Step::Done, n - 1)` so only the last
//! arrival runs `Done`, and an error path calls `job.never_call(&Step::Done)`
//! so a late success can no longer run.
//!
//! # Usage
//!
//! ```ignore
//! use revstore::job::{run, Flow, Job};
//!
//! #[async_trait]
//! impl Flow for Put {
//!     type Step = PutStep;
//!     type Output = WriteResponse;
//!     type Error = RevisionError;
//!     const NAME: &'static str = "tree.put";
//!
//!     async fn step(&self, step: PutStep, job: &Job<Self>) -> RevisionResult<()> {
//!         match step {
//!             PutStep::LoadTree => { /* ... */ job.call(PutStep::WriteBlob) }
//!             // ...
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let response = run(&Put::new(store, doc), PutStep::LoadTree).await?;
//! ```

mod error;
mod sequencer;

pub use error::JobError;
pub use sequencer::{run, Flow, Job};
