//! Packed classifier keys and field descriptors
//!
//! Classifier fields are gathered from packet data or metadata into a packed
//! little-endian key of up to eight 8-byte limbs. Hash and equality helpers
//! work a limb at a time; on x86_64 with SSE4.2 the hash is a hardware
//! CRC32C fold, elsewhere it falls back to an FNV-1a fold with equivalent
//! distribution (but different values).

use serde::{Deserialize, Serialize};

use flowgate_common::{CoreError, CoreResult};

use crate::packet::{AttrId, AttrRegistry, Packet};

/// Maximum number of fields in a classifier key.
pub const MAX_FIELDS: usize = 8;

/// Maximum size of a single field, in bytes.
pub const MAX_FIELD_SIZE: usize = 8;

/// Maximum packed key size, in bytes.
pub const HASH_KEY_SIZE: usize = MAX_FIELDS * MAX_FIELD_SIZE;

/// A packed classifier key: up to eight little-endian 8-byte limbs,
/// zero-padded to a multiple of 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, align(8))]
pub struct HashKey {
    bytes: [u8; HASH_KEY_SIZE],
}

impl Default for HashKey {
    fn default() -> Self {
        Self { bytes: [0u8; HASH_KEY_SIZE] }
    }
}

impl HashKey {
    /// A zeroed key.
    #[inline(always)]
    pub fn zeroed() -> Self {
        Self::default()
    }

    /// Write `src` at byte position `pos`.
    #[inline(always)]
    pub fn set_bytes(&mut self, pos: usize, src: &[u8]) {
        self.bytes[pos..pos + src.len()].copy_from_slice(src);
    }

    /// Raw key bytes.
    #[inline(always)]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The `i`-th 8-byte limb, little-endian.
    #[inline(always)]
    pub fn limb(&self, i: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bytes[i * 8..i * 8 + 8]);
        u64::from_le_bytes(b)
    }

    /// Set the `i`-th limb.
    #[inline(always)]
    pub fn set_limb(&mut self, i: usize, v: u64) {
        self.bytes[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// This key ANDed with `mask`, limb-wise over `key_size` bytes.
    #[inline(always)]
    pub fn masked(&self, mask: &HashKey, key_size: usize) -> HashKey {
        let mut out = HashKey::zeroed();
        for i in 0..key_size / 8 {
            out.set_limb(i, self.limb(i) & mask.limb(i));
        }
        out
    }

    /// Hash the first `key_size` bytes (a multiple of 8), 8 bytes at a time.
    #[inline(always)]
    pub fn hash(&self, key_size: usize) -> u32 {
        let mut h = 0u32;
        for i in 0..key_size / 8 {
            h = crc32c_u64(h, self.limb(i));
        }
        h
    }

    /// Compare the first `key_size` bytes (a multiple of 8), 8 bytes at a
    /// time.
    #[inline(always)]
    pub fn key_eq(&self, other: &HashKey, key_size: usize) -> bool {
        for i in 0..key_size / 8 {
            if self.limb(i) != other.limb(i) {
                return false;
            }
        }
        true
    }
}

#[cfg(all(target_arch = "x86_64", target_feature = "sse4.2"))]
#[inline(always)]
fn crc32c_u64(init: u32, v: u64) -> u32 {
    // SAFETY: gated on sse4.2 being enabled at compile time.
    unsafe { core::arch::x86_64::_mm_crc32_u64(init as u64, v) as u32 }
}

#[cfg(not(all(target_arch = "x86_64", target_feature = "sse4.2")))]
#[inline(always)]
fn crc32c_u64(init: u32, v: u64) -> u32 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut h = FNV_OFFSET ^ u64::from(init);
    for b in v.to_le_bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV_PRIME);
    }
    (h ^ (h >> 32)) as u32
}

/// Where a field's bytes come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldSourceConfig {
    /// A named packet metadata attribute.
    Attr(String),
    /// A byte offset from the packet's data start.
    Offset(usize),
}

/// One field of a classifier key, as carried by configuration payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    /// Byte source of the field.
    pub source: FieldSourceConfig,
    /// Field size in bytes, 1 to 8.
    pub size: usize,
    /// Byte position within the packed key; assigned sequentially when
    /// omitted.
    #[serde(default)]
    pub pos: Option<usize>,
}

impl FieldConfig {
    /// An offset-based field.
    pub fn offset(offset: usize, size: usize) -> Self {
        Self { source: FieldSourceConfig::Offset(offset), size, pos: None }
    }

    /// An attribute-based field.
    pub fn attr(name: &str, size: usize) -> Self {
        Self { source: FieldSourceConfig::Attr(name.to_string()), size, pos: None }
    }

    /// Pin the field at an explicit key position.
    pub fn at(mut self, pos: usize) -> Self {
        self.pos = Some(pos);
        self
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldSource {
    Attr(AttrId),
    Offset(usize),
}

#[derive(Debug, Clone, Copy)]
struct Field {
    source: FieldSource,
    pos: usize,
    size: usize,
}

/// A validated, resolved set of key fields shared by both classifiers.
#[derive(Debug, Clone)]
pub(crate) struct FieldSet {
    fields: Vec<Field>,
    total_key_size: usize,
}

impl FieldSet {
    /// Validate field configs and resolve attribute names against the
    /// registry. Computes per-field positions and the packed key size
    /// (rounded up to a multiple of 8).
    pub fn resolve(configs: &[FieldConfig], registry: &AttrRegistry) -> CoreResult<Self> {
        if configs.is_empty() || configs.len() > MAX_FIELDS {
            return Err(CoreError::InvalidConfig(format!(
                "expected 1 to {} fields, got {}",
                MAX_FIELDS,
                configs.len()
            )));
        }

        let mut fields = Vec::with_capacity(configs.len());
        let mut next_pos = 0usize;
        for (idx, cfg) in configs.iter().enumerate() {
            if cfg.size < 1 || cfg.size > MAX_FIELD_SIZE {
                return Err(CoreError::InvalidConfig(format!(
                    "field {}: size must be 1 to {} bytes, got {}",
                    idx, MAX_FIELD_SIZE, cfg.size
                )));
            }
            let pos = cfg.pos.unwrap_or(next_pos);
            if pos + cfg.size > HASH_KEY_SIZE {
                return Err(CoreError::InvalidConfig(format!(
                    "field {}: position {} exceeds the {}-byte key",
                    idx, pos, HASH_KEY_SIZE
                )));
            }
            let source = match &cfg.source {
                FieldSourceConfig::Offset(off) => FieldSource::Offset(*off),
                FieldSourceConfig::Attr(name) => {
                    let def = registry.resolve(name).ok_or_else(|| {
                        CoreError::InvalidConfig(format!(
                            "field {}: unknown attribute '{}'",
                            idx, name
                        ))
                    })?;
                    if cfg.size > def.size {
                        return Err(CoreError::InvalidConfig(format!(
                            "field {}: attribute '{}' is only {} bytes",
                            idx, name, def.size
                        )));
                    }
                    FieldSource::Attr(def.id)
                }
            };
            fields.push(Field { source, pos, size: cfg.size });
            next_pos = pos + cfg.size;
        }

        // Positions must not overlap.
        let mut spans: Vec<(usize, usize)> = fields.iter().map(|f| (f.pos, f.size)).collect();
        spans.sort_unstable();
        for w in spans.windows(2) {
            if w[0].0 + w[0].1 > w[1].0 {
                return Err(CoreError::InvalidConfig(
                    "field positions overlap within the key".to_string(),
                ));
            }
        }

        let end = fields.iter().map(|f| f.pos + f.size).max().unwrap_or(0);
        let total_key_size = (end + 7) & !7;

        Ok(Self { fields, total_key_size })
    }

    /// Packed key size in bytes (a multiple of 8).
    #[inline(always)]
    pub fn total_key_size(&self) -> usize {
        self.total_key_size
    }

    /// Number of fields.
    #[inline(always)]
    pub fn num_fields(&self) -> usize {
        self.fields.len()
    }

    /// Gather all field bytes from `pkt` into a zeroed key.
    ///
    /// Returns `None` if the packet is too short for any field.
    #[inline]
    pub fn gather(&self, pkt: &Packet) -> Option<HashKey> {
        let mut key = HashKey::zeroed();
        for f in &self.fields {
            let bytes = match f.source {
                FieldSource::Offset(off) => pkt.read_bytes(off, f.size)?,
                FieldSource::Attr(attr) => pkt.read_attr(attr, f.size)?,
            };
            key.set_bytes(f.pos, bytes);
        }
        Some(key)
    }

    /// Pack per-field rule values into a key, validating each value fits its
    /// field width.
    pub fn pack_values(&self, values: &[u64]) -> CoreResult<HashKey> {
        if values.len() != self.fields.len() {
            return Err(CoreError::InvalidConfig(format!(
                "expected {} field values, got {}",
                self.fields.len(),
                values.len()
            )));
        }
        let mut key = HashKey::zeroed();
        for (f, &v) in self.fields.iter().zip(values) {
            if f.size < 8 && v >> (f.size * 8) != 0 {
                return Err(CoreError::InvalidConfig(format!(
                    "value {:#x} does not fit a {}-byte field",
                    v, f.size
                )));
            }
            key.set_bytes(f.pos, &v.to_le_bytes()[..f.size]);
        }
        Ok(key)
    }
}
