//! Scheduler core: routes session tasks onto a fixed pool of worker slots.
//!
//! The scheduler is a single actor task that exclusively owns every slot,
//! the task correlator and the worker handles. Callers talk to it through
//! [`pool::SessionPool`]; workers talk to it through the event channel fed
//! by [`launcher::WorkerLauncher`] implementations.

pub mod correlator;
pub mod launcher;
pub mod monitor;
pub mod pool;
pub mod router;
pub mod slot;

use tokio::sync::oneshot;

use crate::models::task::TaskOutput;
use crate::Result;

/// Completion channel for one caller request.
pub type Reply = oneshot::Sender<Result<TaskOutput>>;
