//! Datapath modules and gate dispatch
//!
//! A module consumes a packet batch and partitions it across its output
//! gates; downstream wiring (which module hangs off which gate) is the
//! topology layer's business, not ours. [`ModuleTask`] adapts a module into
//! a schedulable [`Task`] that pulls batches from a source, runs the module,
//! pushes the per-gate sub-batches into a sink, and reports the usage vector
//! the scheduler bills.

use flowgate_common::{Clock, Resource, ResourceArr, Task};

use crate::packet::{Packet, PacketBatch};
use crate::{GateIdx, DROP_GATE};

/// Lookup hit/miss counters kept by the classifier modules.
///
/// Plain counters: a module is owned by exactly one worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct MatchStats {
    /// Packets whose key matched an installed rule.
    pub hits: u64,
    /// Packets routed to the default gate.
    pub misses: u64,
}

/// A packet-processing module.
pub trait Module {
    /// Process one input batch, partitioning it across output gates.
    fn process_batch(&mut self, batch: PacketBatch) -> GateBatches;

    /// One-line human-readable summary of the module's state.
    fn desc(&self) -> String {
        "module".to_string()
    }
}

/// An input batch partitioned by output gate.
///
/// Packet order is preserved within each gate. Packets routed to
/// [`DROP_GATE`] are discarded at push time.
#[derive(Debug, Default)]
pub struct GateBatches {
    out: Vec<(GateIdx, PacketBatch)>,
    dropped: usize,
}

impl GateBatches {
    /// Create an empty partitioning.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route one packet to `gate`.
    pub fn push(&mut self, gate: GateIdx, pkt: Packet) {
        if gate == DROP_GATE {
            self.dropped += 1;
            return;
        }
        if let Some((_, batch)) = self.out.iter_mut().find(|(g, _)| *g == gate) {
            batch.push(pkt);
        } else {
            let mut batch = PacketBatch::new();
            batch.push(pkt);
            self.out.push((gate, batch));
        }
    }

    /// Take the sub-batch for `gate`, if any packet was routed there.
    pub fn take(&mut self, gate: GateIdx) -> Option<PacketBatch> {
        let i = self.out.iter().position(|(g, _)| *g == gate)?;
        Some(self.out.swap_remove(i).1)
    }

    /// Gates that received at least one packet, in first-seen order.
    pub fn gates(&self) -> impl Iterator<Item = GateIdx> + '_ {
        self.out.iter().map(|(g, _)| *g)
    }

    /// Iterate over the per-gate sub-batches.
    pub fn iter(&self) -> impl Iterator<Item = (GateIdx, &PacketBatch)> {
        self.out.iter().map(|(g, b)| (*g, b))
    }

    /// Total packets across all gates (excluding drops).
    pub fn total_packets(&self) -> usize {
        self.out.iter().map(|(_, b)| b.len()).sum()
    }

    /// Packets routed to the drop gate.
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl IntoIterator for GateBatches {
    type Item = (GateIdx, PacketBatch);
    type IntoIter = std::vec::IntoIter<(GateIdx, PacketBatch)>;

    fn into_iter(self) -> Self::IntoIter {
        self.out.into_iter()
    }
}

/// Pulls input batches for a [`ModuleTask`].
pub trait BatchSource {
    /// Next batch to process, or `None` when no work is pending.
    fn next_batch(&mut self) -> Option<PacketBatch>;
}

impl<F: FnMut() -> Option<PacketBatch>> BatchSource for F {
    fn next_batch(&mut self) -> Option<PacketBatch> {
        self()
    }
}

/// Receives a module's per-gate output.
pub trait GateSink {
    /// Accept the sub-batch routed to `gate`.
    fn consume(&mut self, gate: GateIdx, batch: PacketBatch);
}

impl<F: FnMut(GateIdx, PacketBatch)> GateSink for F {
    fn consume(&mut self, gate: GateIdx, batch: PacketBatch) {
        self(gate, batch)
    }
}

/// Adapts a module into a schedulable task.
///
/// Each `run` pulls at most one batch, processes it, forwards the per-gate
/// output, and reports `{count: 1, cycles, packets, bits}` measured over the
/// invocation.
pub struct ModuleTask<M, S, K, C> {
    module: M,
    source: S,
    sink: K,
    clock: C,
}

impl<M: Module, S: BatchSource, K: GateSink, C: Clock> ModuleTask<M, S, K, C> {
    /// Wire a module between a batch source and a gate sink.
    pub fn new(module: M, source: S, sink: K, clock: C) -> Self {
        Self { module, source, sink, clock }
    }

    /// The wrapped module.
    pub fn module(&self) -> &M {
        &self.module
    }
}

impl<M: Module, S: BatchSource, K: GateSink, C: Clock> Task for ModuleTask<M, S, K, C> {
    fn run(&mut self) -> ResourceArr {
        let start = self.clock.now();
        let mut usage: ResourceArr = [0; flowgate_common::NUM_RESOURCES];
        usage[Resource::Count.index()] = 1;

        if let Some(batch) = self.source.next_batch() {
            usage[Resource::Packets.index()] = batch.len() as u64;
            usage[Resource::Bits.index()] = batch.total_bytes() as u64 * 8;
            let out = self.module.process_batch(batch);
            for (gate, sub) in out {
                self.sink.consume(gate, sub);
            }
        }

        usage[Resource::Cycles.index()] = self.clock.now().wrapping_sub(start);
        usage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowgate_common::ManualClock;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Echo;

    impl Module for Echo {
        fn process_batch(&mut self, batch: PacketBatch) -> GateBatches {
            let mut out = GateBatches::new();
            for pkt in batch {
                out.push(0, pkt);
            }
            out
        }
    }

    #[test]
    fn test_gate_batches_partitioning() {
        let mut out = GateBatches::new();
        out.push(2, Packet::from_slice(&[1]));
        out.push(0, Packet::from_slice(&[2]));
        out.push(2, Packet::from_slice(&[3]));
        out.push(DROP_GATE, Packet::from_slice(&[4]));

        assert_eq!(out.total_packets(), 3);
        assert_eq!(out.dropped(), 1);
        assert_eq!(out.take(2).map(|b| b.len()), Some(2));
        assert!(out.take(2).is_none());
        assert_eq!(out.take(0).map(|b| b.len()), Some(1));
    }

    #[test]
    fn test_module_task_usage() {
        let clock = ManualClock::new();
        let delivered: Rc<RefCell<usize>> = Rc::default();
        let sink_count = delivered.clone();

        let mut pending = Some({
            let mut b = PacketBatch::new();
            b.push(Packet::from_slice(&[0u8; 100]));
            b.push(Packet::from_slice(&[0u8; 28]));
            b
        });

        let mut task = ModuleTask::new(
            Echo,
            move || pending.take(),
            move |_gate: GateIdx, batch: PacketBatch| {
                *sink_count.borrow_mut() += batch.len();
            },
            clock.clone(),
        );

        let usage = task.run();
        assert_eq!(usage[Resource::Count.index()], 1);
        assert_eq!(usage[Resource::Packets.index()], 2);
        assert_eq!(usage[Resource::Bits.index()], 1024);
        assert_eq!(*delivered.borrow(), 2);

        // Source drained: second run is an idle dispatch.
        let usage = task.run();
        assert_eq!(usage[Resource::Packets.index()], 0);
    }
}
