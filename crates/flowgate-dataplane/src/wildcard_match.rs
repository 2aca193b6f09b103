//! Wildcard-match classifier
//!
//! Rules match arbitrary packet fields under a mask. Rules sharing a mask
//! are grouped into a *tuple* backed by one cuckoo table keyed by the masked
//! key; lookup tries every tuple and keeps the highest-priority hit, with
//! ties going to the earlier-created tuple.

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowgate_common::{CoreError, CoreResult};

use crate::cuckoo::CuckooMap;
use crate::key::{FieldConfig, FieldSet, HashKey};
use crate::module::{GateBatches, MatchStats, Module};
use crate::packet::{AttrRegistry, PacketBatch};
use crate::{is_valid_gate, GateIdx, DROP_GATE};

/// Maximum number of distinct masks (tuples).
pub const MAX_TUPLES: usize = 8;

/// Rule payload: priority and output gate.
#[derive(Debug, Clone, Copy, Default)]
struct WmData {
    priority: i32,
    gate: GateIdx,
}

struct WmTuple {
    mask: HashKey,
    table: CuckooMap<WmData>,
}

/// Configuration payload for [`WildcardMatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WildcardMatchConfig {
    /// Key fields, at most eight.
    pub fields: Vec<FieldConfig>,
}

/// The wildcard-match classifier module.
pub struct WildcardMatch {
    default_gate: GateIdx,
    fields: FieldSet,
    tuples: Vec<WmTuple>,
    stats: MatchStats,
}

impl WildcardMatch {
    /// Validate the field layout and build an empty classifier.
    pub fn new(config: &WildcardMatchConfig, registry: &AttrRegistry) -> CoreResult<Self> {
        let fields = FieldSet::resolve(&config.fields, registry)?;
        Ok(Self { default_gate: DROP_GATE, fields, tuples: Vec::new(), stats: MatchStats::default() })
    }

    /// Add or overwrite a rule.
    ///
    /// `values` and `masks` are per-field; the rule matches packets whose
    /// gathered key ANDed with the mask equals `values & masks`. A new mask
    /// allocates a tuple; running out of tuple slots is `TableFull`.
    pub fn add_rule(
        &mut self,
        values: &[u64],
        masks: &[u64],
        priority: i32,
        gate: GateIdx,
    ) -> CoreResult<()> {
        if !is_valid_gate(gate) {
            return Err(CoreError::InvalidConfig(format!("invalid gate {}", gate)));
        }
        let key_size = self.fields.total_key_size();
        let key = self.fields.pack_values(values)?;
        let mask = self.fields.pack_values(masks)?;
        let masked = key.masked(&mask, key_size);

        let idx = match self.find_tuple(&mask) {
            Some(i) => i,
            None => {
                if self.tuples.len() >= MAX_TUPLES {
                    return Err(CoreError::TableFull(format!(
                        "all {} wildcard tuple slots in use",
                        MAX_TUPLES
                    )));
                }
                self.tuples.push(WmTuple { mask, table: CuckooMap::with_key_size(key_size) });
                self.tuples.len() - 1
            }
        };
        self.tuples[idx].table.insert(masked, WmData { priority, gate });
        debug!(priority, gate, tuples = self.tuples.len(), "wildcard rule added");
        Ok(())
    }

    /// Delete the rule for `values`/`masks`.
    ///
    /// An emptied tuple is retained to avoid churn; `clear_rules` collects
    /// it.
    pub fn delete_rule(&mut self, values: &[u64], masks: &[u64]) -> CoreResult<()> {
        let key_size = self.fields.total_key_size();
        let key = self.fields.pack_values(values)?;
        let mask = self.fields.pack_values(masks)?;
        let masked = key.masked(&mask, key_size);

        let i = self
            .find_tuple(&mask)
            .ok_or_else(|| CoreError::NotFound("no tuple with the given mask".to_string()))?;
        if !self.tuples[i].table.remove(&masked) {
            return Err(CoreError::NotFound("no rule for the given key/mask".to_string()));
        }
        Ok(())
    }

    /// Drop all rules and tuples.
    pub fn clear_rules(&mut self) {
        self.tuples.clear();
    }

    /// Route lookup misses (and malformed packets) to `gate`.
    pub fn set_default_gate(&mut self, gate: GateIdx) -> CoreResult<()> {
        if !is_valid_gate(gate) {
            return Err(CoreError::InvalidConfig(format!("invalid gate {}", gate)));
        }
        self.default_gate = gate;
        Ok(())
    }

    /// Total rules across all tuples.
    pub fn num_rules(&self) -> usize {
        self.tuples.iter().map(|t| t.table.count()).sum()
    }

    /// Number of allocated tuples.
    pub fn num_tuples(&self) -> usize {
        self.tuples.len()
    }

    /// Hit/miss counters.
    pub fn stats(&self) -> MatchStats {
        self.stats
    }

    /// Resolve a gathered key against every tuple, returning the gate of the
    /// highest-priority hit or `def_gate` if nothing matches. Equal-priority
    /// hits resolve to the earlier-created tuple.
    pub fn lookup_entry(&self, key: &HashKey, def_gate: GateIdx) -> GateIdx {
        self.lookup(key).unwrap_or(def_gate)
    }

    #[inline]
    fn lookup(&self, key: &HashKey) -> Option<GateIdx> {
        let key_size = self.fields.total_key_size();
        let mut best: Option<WmData> = None;
        for tuple in &self.tuples {
            let masked = key.masked(&tuple.mask, key_size);
            if let Some(data) = tuple.table.find(&masked) {
                match best {
                    Some(b) if data.priority <= b.priority => {}
                    _ => best = Some(*data),
                }
            }
        }
        best.map(|b| b.gate)
    }

    fn find_tuple(&self, mask: &HashKey) -> Option<usize> {
        let key_size = self.fields.total_key_size();
        self.tuples.iter().position(|t| t.mask.key_eq(mask, key_size))
    }
}

impl Module for WildcardMatch {
    fn process_batch(&mut self, batch: PacketBatch) -> GateBatches {
        let mut out = GateBatches::new();
        for pkt in batch {
            let gate = match self.fields.gather(&pkt).and_then(|key| self.lookup(&key)) {
                Some(gate) => {
                    self.stats.hits += 1;
                    gate
                }
                None => {
                    self.stats.misses += 1;
                    self.default_gate
                }
            };
            out.push(gate, pkt);
        }
        out
    }

    fn desc(&self) -> String {
        format!(
            "WildcardMatch: {} fields, {} tuples, {} rules",
            self.fields.num_fields(),
            self.tuples.len(),
            self.num_rules()
        )
    }
}
