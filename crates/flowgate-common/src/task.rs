//! The scheduler/module contract
//!
//! A task is one unit of schedulable work. The scheduler does not know what
//! a task does; it only dispatches it and bills the returned usage vector up
//! the traffic-class tree. Tasks run to completion within one call and must
//! not block.

use crate::resource::ResourceArr;

/// One unit of schedulable work, owned by a leaf traffic class.
pub trait Task {
    /// Run the task once and report the resources consumed during the call
    /// as `{count, cycles, packets, bits}`.
    fn run(&mut self) -> ResourceArr;
}
