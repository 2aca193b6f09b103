//! Packets, batches, and metadata attributes
//!
//! A packet is an owned data buffer plus a fixed metadata area. Classifier
//! fields read either from the data (by byte offset) or from a named
//! metadata attribute; attribute names are resolved to metadata offsets once
//! at setup time through the [`AttrRegistry`].

use std::collections::HashMap;

use flowgate_common::{CoreError, CoreResult};
use parking_lot::RwLock;

use crate::MAX_BURST;

/// Size of the per-packet metadata area, in bytes.
pub const METADATA_SIZE: usize = 64;

/// A resolved metadata attribute: a byte offset into the metadata area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttrId(u16);

impl AttrId {
    /// Byte offset of this attribute within the metadata area.
    #[inline(always)]
    pub fn offset(self) -> usize {
        self.0 as usize
    }
}

/// A packet handle: data buffer plus metadata.
#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
    metadata: [u8; METADATA_SIZE],
}

impl Packet {
    /// Create a packet from raw frame data.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, metadata: [0u8; METADATA_SIZE] }
    }

    /// Create a packet by copying a byte slice.
    pub fn from_slice(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }

    /// Packet data, starting at the frame's first byte.
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable packet data.
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Data length in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet holds no data.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Read `size` bytes at `offset` from the packet data.
    ///
    /// Returns `None` if the packet is too short; callers on the hot path
    /// route such packets to the default gate.
    #[inline(always)]
    pub fn read_bytes(&self, offset: usize, size: usize) -> Option<&[u8]> {
        self.data.get(offset..offset + size)
    }

    /// Read `size` bytes of a metadata attribute.
    #[inline(always)]
    pub fn read_attr(&self, attr: AttrId, size: usize) -> Option<&[u8]> {
        self.metadata.get(attr.offset()..attr.offset() + size)
    }

    /// Write a metadata attribute value (little-endian byte order).
    pub fn set_attr(&mut self, attr: AttrId, value: &[u8]) {
        let off = attr.offset();
        debug_assert!(off + value.len() <= METADATA_SIZE);
        self.metadata[off..off + value.len()].copy_from_slice(value);
    }
}

/// An ordered batch of packets, capped at [`MAX_BURST`].
#[derive(Debug, Default)]
pub struct PacketBatch {
    pkts: Vec<Packet>,
}

impl PacketBatch {
    /// Create an empty batch.
    pub fn new() -> Self {
        Self { pkts: Vec::with_capacity(MAX_BURST) }
    }

    /// Add a packet to the batch.
    pub fn push(&mut self, pkt: Packet) {
        debug_assert!(self.pkts.len() < MAX_BURST, "batch overflow");
        self.pkts.push(pkt);
    }

    /// Number of packets in the batch.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.pkts.len()
    }

    /// Whether the batch is empty.
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.pkts.is_empty()
    }

    /// Total data bytes across the batch.
    pub fn total_bytes(&self) -> usize {
        self.pkts.iter().map(Packet::len).sum()
    }

    /// Iterate over packets.
    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.pkts.iter()
    }

    /// Consume the batch, yielding its packets in order.
    pub fn drain(&mut self) -> impl Iterator<Item = Packet> + '_ {
        self.pkts.drain(..)
    }
}

impl IntoIterator for PacketBatch {
    type Item = Packet;
    type IntoIter = std::vec::IntoIter<Packet>;

    fn into_iter(self) -> Self::IntoIter {
        self.pkts.into_iter()
    }
}

impl FromIterator<Packet> for PacketBatch {
    fn from_iter<T: IntoIterator<Item = Packet>>(iter: T) -> Self {
        Self { pkts: iter.into_iter().collect() }
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    attrs: HashMap<String, AttrDef>,
    next_offset: usize,
}

/// A registered attribute: resolved id plus declared size.
#[derive(Debug, Clone, Copy)]
pub struct AttrDef {
    /// Resolved attribute id.
    pub id: AttrId,
    /// Declared size in bytes.
    pub size: usize,
}

/// Process-wide registry of named metadata attributes.
///
/// Mutated only during setup; never consulted on the per-packet path
/// (fields carry resolved [`AttrId`]s). Concurrent setup-time registration
/// is serialized internally.
#[derive(Debug, Default)]
pub struct AttrRegistry {
    inner: RwLock<RegistryInner>,
}

impl AttrRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an attribute, allocating space in the metadata area.
    ///
    /// Re-registering the same name with the same size returns the existing
    /// id; a size mismatch is a configuration error.
    pub fn register(&self, name: &str, size: usize) -> CoreResult<AttrId> {
        let mut inner = self.inner.write();
        if let Some(def) = inner.attrs.get(name) {
            if def.size != size {
                return Err(CoreError::InvalidConfig(format!(
                    "attribute '{}' already registered with size {}",
                    name, def.size
                )));
            }
            return Ok(def.id);
        }
        if inner.next_offset + size > METADATA_SIZE {
            return Err(CoreError::InvalidConfig(format!(
                "metadata area exhausted registering attribute '{}'",
                name
            )));
        }
        let id = AttrId(inner.next_offset as u16);
        inner.next_offset += size;
        inner.attrs.insert(name.to_string(), AttrDef { id, size });
        Ok(id)
    }

    /// Look up a registered attribute by name.
    pub fn resolve(&self, name: &str) -> Option<AttrDef> {
        self.inner.read().attrs.get(name).copied()
    }
}
