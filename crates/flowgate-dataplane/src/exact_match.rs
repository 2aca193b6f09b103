//! Exact-match classifier
//!
//! Gathers a fixed-shape key from each packet and maps it to an output gate
//! through a cuckoo table. Packets whose key has no rule (or that are too
//! short to gather from) go to the default gate.

use serde::{Deserialize, Serialize};
use tracing::debug;

use flowgate_common::{CoreError, CoreResult};

use crate::cuckoo::CuckooMap;
use crate::key::{FieldConfig, FieldSet};
use crate::module::{GateBatches, MatchStats, Module};
use crate::packet::{AttrRegistry, PacketBatch};
use crate::{is_valid_gate, GateIdx, DROP_GATE};

/// Configuration payload for [`ExactMatch`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExactMatchConfig {
    /// Key fields, at most eight.
    pub fields: Vec<FieldConfig>,
}

/// The exact-match classifier module.
pub struct ExactMatch {
    default_gate: GateIdx,
    fields: FieldSet,
    table: CuckooMap<GateIdx>,
    stats: MatchStats,
}

impl ExactMatch {
    /// Validate the field layout and build an empty classifier.
    ///
    /// The default gate starts as the drop gate; set it explicitly with
    /// [`set_default_gate`](Self::set_default_gate).
    pub fn new(config: &ExactMatchConfig, registry: &AttrRegistry) -> CoreResult<Self> {
        let fields = FieldSet::resolve(&config.fields, registry)?;
        let table = CuckooMap::with_key_size(fields.total_key_size());
        Ok(Self { default_gate: DROP_GATE, fields, table, stats: MatchStats::default() })
    }

    /// Add or overwrite a rule mapping the packed field `values` to `gate`.
    pub fn add_rule(&mut self, values: &[u64], gate: GateIdx) -> CoreResult<()> {
        if !is_valid_gate(gate) {
            return Err(CoreError::InvalidConfig(format!("invalid gate {}", gate)));
        }
        let key = self.fields.pack_values(values)?;
        self.table.insert(key, gate);
        debug!(gate, rules = self.table.count(), "exact-match rule added");
        Ok(())
    }

    /// Delete the rule for the packed field `values`.
    pub fn delete_rule(&mut self, values: &[u64]) -> CoreResult<()> {
        let key = self.fields.pack_values(values)?;
        if !self.table.remove(&key) {
            return Err(CoreError::NotFound("no rule for the given field values".to_string()));
        }
        Ok(())
    }

    /// Drop all rules.
    pub fn clear_rules(&mut self) {
        self.table.clear();
    }

    /// Route lookup misses (and malformed packets) to `gate`.
    pub fn set_default_gate(&mut self, gate: GateIdx) -> CoreResult<()> {
        if !is_valid_gate(gate) {
            return Err(CoreError::InvalidConfig(format!("invalid gate {}", gate)));
        }
        self.default_gate = gate;
        Ok(())
    }

    /// Number of installed rules.
    pub fn num_rules(&self) -> usize {
        self.table.count()
    }

    /// Hit/miss counters.
    pub fn stats(&self) -> MatchStats {
        self.stats
    }
}

impl Module for ExactMatch {
    fn process_batch(&mut self, batch: PacketBatch) -> GateBatches {
        let mut out = GateBatches::new();
        for pkt in batch {
            let hit = self.fields.gather(&pkt).and_then(|key| self.table.find(&key)).copied();
            let gate = match hit {
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
        format!("ExactMatch: {} fields, {} rules", self.fields.num_fields(), self.table.count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn ipv4_pkt(src: [u8; 4]) -> Packet {
        let mut data = vec![0u8; 64];
        data[26..30].copy_from_slice(&src);
        Packet::new(data)
    }

    fn src_ip_classifier() -> ExactMatch {
        let reg = AttrRegistry::new();
        let cfg = ExactMatchConfig { fields: vec![FieldConfig::offset(26, 4)] };
        ExactMatch::new(&cfg, &reg).unwrap()
    }

    // Keys are packed little-endian, so an IPv4 address read from the wire
    // becomes u32::from_le_bytes of its octets.
    fn ip_value(octets: [u8; 4]) -> u64 {
        u32::from_le_bytes(octets) as u64
    }

    #[test]
    fn test_rules_route_to_gates() {
        let mut em = src_ip_classifier();
        em.set_default_gate(0).unwrap();
        em.add_rule(&[ip_value([10, 0, 0, 1])], 2).unwrap();
        em.add_rule(&[ip_value([10, 0, 0, 2])], 3).unwrap();

        let mut batch = PacketBatch::new();
        batch.push(ipv4_pkt([10, 0, 0, 1]));
        batch.push(ipv4_pkt([10, 0, 0, 2]));
        batch.push(ipv4_pkt([10, 0, 0, 9]));

        let mut out = em.process_batch(batch);
        assert_eq!(out.take(2).map(|b| b.len()), Some(1));
        assert_eq!(out.take(3).map(|b| b.len()), Some(1));
        assert_eq!(out.take(0).map(|b| b.len()), Some(1));
        assert_eq!(em.stats().hits, 2);
        assert_eq!(em.stats().misses, 1);
    }

    #[test]
    fn test_add_overwrites() {
        let mut em = src_ip_classifier();
        em.add_rule(&[ip_value([10, 0, 0, 1])], 2).unwrap();
        em.add_rule(&[ip_value([10, 0, 0, 1])], 5).unwrap();
        assert_eq!(em.num_rules(), 1);

        let mut batch = PacketBatch::new();
        batch.push(ipv4_pkt([10, 0, 0, 1]));
        let mut out = em.process_batch(batch);
        assert!(out.take(5).is_some());
    }

    #[test]
    fn test_delete_absent_is_not_found() {
        let mut em = src_ip_classifier();
        em.add_rule(&[ip_value([10, 0, 0, 1])], 2).unwrap();
        assert!(em.delete_rule(&[ip_value([10, 0, 0, 1])]).is_ok());
        assert!(matches!(
            em.delete_rule(&[ip_value([10, 0, 0, 1])]),
            Err(CoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_short_packet_goes_to_default() {
        let mut em = src_ip_classifier();
        em.set_default_gate(7).unwrap();
        let mut batch = PacketBatch::new();
        batch.push(Packet::from_slice(&[0u8; 12]));
        let mut out = em.process_batch(batch);
        assert_eq!(out.take(7).map(|b| b.len()), Some(1));
    }

    #[test]
    fn test_invalid_gate_rejected() {
        let mut em = src_ip_classifier();
        assert!(em.add_rule(&[1], DROP_GATE + 1).is_err());
        assert!(em.set_default_gate(DROP_GATE + 1).is_err());
    }

    #[test]
    fn test_attr_field() {
        let reg = AttrRegistry::new();
        let vlan = reg.register("vlan_id", 2).unwrap();
        let cfg = ExactMatchConfig { fields: vec![FieldConfig::attr("vlan_id", 2)] };
        let mut em = ExactMatch::new(&cfg, &reg).unwrap();
        em.set_default_gate(0).unwrap();
        em.add_rule(&[100], 4).unwrap();

        let mut tagged = Packet::from_slice(&[0u8; 64]);
        tagged.set_attr(vlan, &100u16.to_le_bytes());
        let untagged = Packet::from_slice(&[0u8; 64]);

        let mut batch = PacketBatch::new();
        batch.push(tagged);
        batch.push(untagged);
        let mut out = em.process_batch(batch);
        assert_eq!(out.take(4).map(|b| b.len()), Some(1));
        assert_eq!(out.take(0).map(|b| b.len()), Some(1));
    }
}
