//! Durable, Postgres-backed workflow engine.
//!
//! Named blueprints execute as runs composed of ordered steps, with
//! at-least-once execution, lease-based crash recovery, parent/child DAG
//! orchestration, priority scheduling, and full event auditing. Clients
//! enqueue runs; worker processes claim, lease, execute, and finalize them.
//!
//! # Architecture
//!
//! ```text
//! enqueue_run()                 Worker
//!     │                            │
//!     └─► runs (QUEUED) ◄──poll────┼─► claim_runs (FOR UPDATE SKIP LOCKED)
//!                                  ├─► LeaseRenewer (ephemeral connections)
//!                                  ├─► execute_run
//!                                  │       └─► blueprint(ctx, inputs)
//!                                  │               ├─► ctx.step / emit_event
//!                                  │               └─► ctx.spawn_run / wait_runs
//!                                  └─► CAS finalize (COMPLETED / FAILED)
//! ```

pub mod advisory;
pub mod blueprints;
pub mod config;
pub mod context;
pub mod dag;
pub mod error;
pub mod executor;
pub mod lease;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod registry;
pub mod worker;

pub use config::{Config, WorkerConfig};
pub use context::{RunContext, StepScope};
pub use dag::{SpawnOptions, WaitOptions, WaitOutcome, WaitPolicy};
pub use error::EngineError;
pub use queue::{cancel_run, claim_runs, enqueue_run, EnqueueOptions};
pub use registry::{BlueprintRegistry, SharedBlueprintRegistry};
pub use worker::Worker;
