//! Resource accounting
//!
//! Every task invocation reports how much of each resource it consumed; the
//! scheduler bills that usage up the traffic-class tree. The resource set is
//! fixed and ordered so usage can live in a flat array on the hot path.

/// A schedulable resource dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum Resource {
    /// Number of task invocations (always 1 per dispatch).
    Count = 0,
    /// Worker cycles spent, in TSC units.
    Cycles = 1,
    /// Packets processed.
    Packets = 2,
    /// Bits processed.
    Bits = 3,
}

/// Number of resource dimensions.
pub const NUM_RESOURCES: usize = 4;

impl Resource {
    /// All resources, in billing order.
    pub const ALL: [Resource; NUM_RESOURCES] =
        [Resource::Count, Resource::Cycles, Resource::Packets, Resource::Bits];

    /// Index of this resource within a usage vector.
    #[inline(always)]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A usage vector: one unsigned 64-bit counter per resource.
pub type ResourceArr = [u64; NUM_RESOURCES];

/// Accumulate `delta` into `acc`, component-wise.
#[inline(always)]
pub fn accumulate(acc: &mut ResourceArr, delta: &ResourceArr) {
    for i in 0..NUM_RESOURCES {
        acc[i] = acc[i].wrapping_add(delta[i]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_indices() {
        assert_eq!(Resource::Count.index(), 0);
        assert_eq!(Resource::Bits.index(), 3);
        for (i, r) in Resource::ALL.iter().enumerate() {
            assert_eq!(r.index(), i);
        }
    }

    #[test]
    fn test_accumulate() {
        let mut acc: ResourceArr = [1, 2, 3, 4];
        accumulate(&mut acc, &[10, 20, 30, 40]);
        assert_eq!(acc, [11, 22, 33, 44]);
    }
}
