//! Scheduler for scoped-cache modules.
//!
//! This module provides:
//! - **ModuleRunner**: type-erased adapter owning one module's caches and
//!   counters, dispatching only the hooks its abilities declare.
//! - **WorkerPool**: a fixed number of stream slots, each a tokio task that
//!   owns its stream caches and processes commands in order.
//! - **TransitionScheduler**: walks the job input, issues global transitions
//!   on the dispatcher and hands events to idle stream slots.
//!
//! # Architecture
//!
//! The scheduler uses a dispatcher/worker model:
//! 1. Global begin transitions run on the dispatcher before any event of the scope
//! 2. Events go to whichever slot reported idle first
//! 3. A scope ends only after every slot that entered it acknowledged the exit
//! 4. Shared caches are destroyed once the global end transitions are done
//!
//! # Example
//!
//! ```ignore
//! use streamscope::scheduler::{SchedulerConfig, TransitionScheduler};
//! use streamscope::source::JobInput;
//!
//! let mut scheduler = TransitionScheduler::new(SchedulerConfig::default().with_streams(3))?;
//! scheduler.add_module(my_filter)?;
//! let report = scheduler.run(&JobInput::uniform(2, 1, 5)).await?;
//! ```

mod runner;
mod transition;
mod worker;

pub use runner::{ModuleRunner, ScheduledModule, StreamScopes, StreamUnit};
pub use transition::{SchedulerConfig, TransitionScheduler};
pub use worker::{StreamCommand, WorkerEvent, WorkerPool};
