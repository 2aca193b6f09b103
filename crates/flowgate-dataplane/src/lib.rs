//! Flowgate Dataplane
//!
//! Per-worker packet processing primitives for the Flowgate framework:
//!
//! ```text
//!   upstream ──▶ ┌──────────────┐      gate 0 ──▶ downstream
//!                │  classifier  │      gate 1 ──▶ downstream
//!     batch ──▶  │  (EM / WM)   │ ──▶  gate 2 ──▶ downstream
//!                └──────┬───────┘        ⋮
//!                       │            default ──▶ downstream
//!                 cuckoo tables
//! ```
//!
//! A module consumes a batch of up to [`MAX_BURST`] packets, decides an
//! output gate per packet, and hands the per-gate sub-batches downstream.
//! The exact-match classifier maps a packed key to a gate through one
//! cuckoo hash table; the wildcard-match classifier keeps one table per
//! distinct mask and resolves overlaps by rule priority.
//!
//! # Thread safety
//!
//! Everything here is built for the run-to-completion model: one worker
//! owns its classifiers and tables outright, and nothing on the per-packet
//! path takes a lock. Cuckoo table lookups are additionally safe under
//! concurrent readers, but any update (insert/remove/clear) must be
//! serialized against readers by external quiescence - in practice, apply
//! rule changes between worker scheduler iterations.

#![warn(missing_docs)]

pub mod cuckoo;
pub mod exact_match;
pub mod key;
pub mod module;
pub mod packet;
pub mod wildcard_match;

pub use cuckoo::CuckooMap;
pub use exact_match::{ExactMatch, ExactMatchConfig};
pub use key::{FieldConfig, FieldSourceConfig, HashKey};
pub use module::{BatchSource, GateBatches, GateSink, MatchStats, Module, ModuleTask};
pub use packet::{AttrId, AttrRegistry, Packet, PacketBatch};
pub use wildcard_match::{WildcardMatch, WildcardMatchConfig};

/// Maximum number of packets per batch.
pub const MAX_BURST: usize = 32;

/// Output gate index.
pub type GateIdx = u16;

/// Number of addressable output gates per module.
pub const MAX_GATES: GateIdx = 8192;

/// Pseudo-gate that drops the packet.
pub const DROP_GATE: GateIdx = MAX_GATES;

/// Whether `gate` is addressable (a real gate or the drop gate).
#[inline(always)]
pub fn is_valid_gate(gate: GateIdx) -> bool {
    gate <= DROP_GATE
}
