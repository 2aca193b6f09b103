//! Flowgate Common - Shared vocabulary for the Flowgate datapath
//!
//! This crate provides the small, dependency-light types that every other
//! Flowgate crate speaks:
//!
//! - Resource accounting (`Resource`, `ResourceArr`)
//! - The worker cycle clock (`Clock`, `TscClock`, `ManualClock`)
//! - The scheduler/module contract (`Task`)
//! - Error handling (`CoreError`, `CoreResult`)

#![warn(missing_docs)]

pub mod clock;
pub mod error;
pub mod resource;
pub mod task;

pub use clock::{Clock, ManualClock, TscClock};
pub use error::{CoreError, CoreResult};
pub use resource::{accumulate, Resource, ResourceArr, NUM_RESOURCES};
pub use task::Task;
