//! Domain data types shared by the scheduler and the worker.

pub mod task;
pub mod worker;
