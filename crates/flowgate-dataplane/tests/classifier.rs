//! Classifier scenario tests: wire-shaped packets through full
//! `process_batch` calls, plus randomized cuckoo-table load tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use flowgate_dataplane::cuckoo::{CuckooMap, INIT_ENTRIES};
use flowgate_dataplane::{
    AttrRegistry, ExactMatch, ExactMatchConfig, FieldConfig, HashKey, Module, Packet, PacketBatch,
    WildcardMatch, WildcardMatchConfig,
};

/// Minimal Ethernet+IPv4+L4 frame with the given addresses and ports.
fn frame(src: [u8; 4], dst: [u8; 4], dport: u16) -> Packet {
    let mut data = vec![0u8; 64];
    data[12] = 0x08; // IPv4 ethertype
    data[14] = 0x45;
    data[26..30].copy_from_slice(&src);
    data[30..34].copy_from_slice(&dst);
    data[36..38].copy_from_slice(&dport.to_be_bytes());
    Packet::new(data)
}

/// Rule value for an IPv4 address field: the gathered bytes read as a
/// little-endian integer.
fn ip(octets: [u8; 4]) -> u64 {
    u32::from_le_bytes(octets) as u64
}

/// Rule value for a big-endian wire port gathered into a little-endian key.
fn port(p: u16) -> u64 {
    u16::from_le_bytes(p.to_be_bytes()) as u64
}

#[test]
fn exact_match_routes_by_source_ip() {
    let registry = AttrRegistry::new();
    let cfg = ExactMatchConfig { fields: vec![FieldConfig::offset(26, 4)] };
    let mut em = ExactMatch::new(&cfg, &registry).unwrap();
    em.set_default_gate(0).unwrap();
    em.add_rule(&[ip([10, 0, 0, 1])], 2).unwrap();
    em.add_rule(&[ip([10, 0, 0, 2])], 3).unwrap();

    let mut batch = PacketBatch::new();
    for src in [[10, 0, 0, 1], [10, 0, 0, 2], [10, 0, 0, 9]] {
        batch.push(frame(src, [192, 168, 0, 1], 80));
    }

    let mut out = em.process_batch(batch);
    assert_eq!(out.take(2).map(|b| b.len()), Some(1));
    assert_eq!(out.take(3).map(|b| b.len()), Some(1));
    assert_eq!(out.take(0).map(|b| b.len()), Some(1));
}

#[test]
fn wildcard_match_resolves_priorities() {
    let registry = AttrRegistry::new();
    let cfg = WildcardMatchConfig {
        fields: vec![FieldConfig::offset(30, 4), FieldConfig::offset(36, 2)],
    };
    let mut wm = WildcardMatch::new(&cfg, &registry).unwrap();
    wm.set_default_gate(1).unwrap();

    // 10.0.0.0/24, any port -> gate 5 at priority 1.
    wm.add_rule(&[ip([10, 0, 0, 0]), 0], &[ip([255, 255, 255, 0]), 0], 1, 5).unwrap();
    // 10.0.0.5:80 exactly -> gate 7 at priority 10.
    wm.add_rule(
        &[ip([10, 0, 0, 5]), port(80)],
        &[ip([255, 255, 255, 255]), 0xffff],
        10,
        7,
    )
    .unwrap();

    let mut batch = PacketBatch::new();
    batch.push(frame([1, 1, 1, 1], [10, 0, 0, 5], 80)); // both rules match
    batch.push(frame([1, 1, 1, 1], [10, 0, 0, 5], 81)); // only the /24 rule
    batch.push(frame([1, 1, 1, 1], [10, 0, 1, 1], 80)); // no rule

    let mut out = wm.process_batch(batch);
    assert_eq!(out.take(7).map(|b| b.len()), Some(1));
    assert_eq!(out.take(5).map(|b| b.len()), Some(1));
    assert_eq!(out.take(1).map(|b| b.len()), Some(1));
}

fn key_of(v: u64) -> HashKey {
    let mut k = HashKey::zeroed();
    k.set_limb(0, v);
    k
}

#[test]
fn cuckoo_survives_grow_with_interleaved_removes() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut map: CuckooMap<u64> = CuckooMap::with_key_size(8);

    let total = 10_000u64;
    let mut live: Vec<u64> = Vec::new();
    let mut removed = 0usize;
    let mut min_buckets = 0usize;

    for i in 0..total {
        map.insert(key_of(i), i ^ 0xabcd);
        live.push(i);

        // Interleave 1000 removes across the run.
        if removed < 1000 && i % 10 == 9 {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            assert!(map.remove(&key_of(victim)));
            removed += 1;
        }

        // Capacity only ever grows.
        assert!(map.num_buckets() >= min_buckets);
        min_buckets = map.num_buckets();
    }

    assert_eq!(removed, 1000);
    assert_eq!(map.count(), live.len());
    for &k in &live {
        assert_eq!(map.find(&key_of(k)), Some(&(k ^ 0xabcd)), "survivor {} lost", k);
    }
}

#[test]
fn cuckoo_random_load_to_ten_times_initial_capacity() {
    let mut rng = StdRng::seed_from_u64(42);
    let mut map: CuckooMap<u64> = CuckooMap::with_key_size(16);

    let mut keys = std::collections::HashSet::new();
    while keys.len() < 10 * INIT_ENTRIES {
        keys.insert((rng.gen::<u64>(), rng.gen::<u64>()));
    }

    for &(a, b) in &keys {
        let mut k = HashKey::zeroed();
        k.set_limb(0, a);
        k.set_limb(1, b);
        map.insert(k, a ^ b);
    }

    assert_eq!(map.count(), keys.len());
    for &(a, b) in &keys {
        let mut k = HashKey::zeroed();
        k.set_limb(0, a);
        k.set_limb(1, b);
        assert_eq!(map.find(&k), Some(&(a ^ b)));
    }

    // The iterator visits each stored entry exactly once.
    assert_eq!(map.iter().count(), keys.len());
}

#[test]
fn wildcard_delete_restores_prior_state() {
    let registry = AttrRegistry::new();
    let cfg = WildcardMatchConfig { fields: vec![FieldConfig::offset(30, 4)] };
    let mut wm = WildcardMatch::new(&cfg, &registry).unwrap();
    wm.set_default_gate(0).unwrap();
    wm.add_rule(&[ip([10, 0, 0, 0])], &[ip([255, 255, 255, 0])], 1, 3).unwrap();

    let probe = |wm: &mut WildcardMatch| {
        let mut batch = PacketBatch::new();
        batch.push(frame([1, 1, 1, 1], [10, 0, 0, 7], 80));
        let out = wm.process_batch(batch);
        let gate = out.gates().next();
        gate
    };

    assert_eq!(probe(&mut wm), Some(3));

    wm.add_rule(&[ip([10, 0, 0, 7])], &[ip([255, 255, 255, 255])], 9, 8).unwrap();
    assert_eq!(probe(&mut wm), Some(8));

    wm.delete_rule(&[ip([10, 0, 0, 7])], &[ip([255, 255, 255, 255])]).unwrap();
    assert_eq!(probe(&mut wm), Some(3));
}
