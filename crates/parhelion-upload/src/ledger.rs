//! Staging region bookkeeping.
//!
//! The ledger tracks capacity and occupancy per staging region without
//! touching Vulkan, so the claim policy is testable on its own. The pool
//! keeps its region vector in lockstep with the ledger entries.

/// Hard cap on the number of staging regions. Exceeding it means the pool is
/// leaking regions or sized wrong for the workload, not a transient
/// condition, so the claim asserts instead of erroring.
pub const MAX_STAGING_REGIONS: usize = 64;

/// Occupancy state of a staging region.
///
/// A region cycles `Free -> Frame(n) -> Free`. It stays stamped with frame
/// `n` until that frame slot is known retired one full frames-in-flight
/// rotation later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Occupancy {
    /// Available for the next claim.
    Free,
    /// Claimed or submitted during the given frame.
    Frame(u64),
}

/// Result of a ledger claim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// An existing free region was large enough.
    Reuse(usize),
    /// No free region fit; a new entry of the given capacity was appended
    /// and the pool must create the matching region.
    Grow { index: usize, capacity: u64 },
}

#[derive(Clone, Copy, Debug)]
struct LedgerEntry {
    capacity: u64,
    occupancy: Occupancy,
}

/// Per-region capacity and occupancy records.
#[derive(Default)]
pub struct RegionLedger {
    entries: Vec<LedgerEntry>,
}

impl RegionLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions ever created. Growth is monotonic; entries are
    /// never removed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no region has been created yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Capacity of the region at `index`.
    pub fn capacity(&self, index: usize) -> u64 {
        self.entries[index].capacity
    }

    /// Occupancy of the region at `index`.
    pub fn occupancy(&self, index: usize) -> Occupancy {
        self.entries[index].occupancy
    }

    /// Claim a region able to hold `size` bytes, stamping it with `frame`.
    ///
    /// First-fit scan in pool order: the first free region with enough
    /// capacity wins. On a miss a new entry sized to the next power of two
    /// above `size` is appended, which amortizes reuse across similarly
    /// sized requests.
    ///
    /// # Panics
    /// If growth would exceed [`MAX_STAGING_REGIONS`].
    pub fn claim(&mut self, size: u64, frame: u64) -> ClaimOutcome {
        if let Some(index) = self
            .entries
            .iter()
            .position(|e| e.occupancy == Occupancy::Free && e.capacity >= size)
        {
            self.entries[index].occupancy = Occupancy::Frame(frame);
            return ClaimOutcome::Reuse(index);
        }

        assert!(
            self.entries.len() < MAX_STAGING_REGIONS,
            "staging pool exhausted: {} regions exist, none free with capacity >= {size}",
            self.entries.len(),
        );

        let capacity = size.max(1).next_power_of_two();
        let index = self.entries.len();
        self.entries.push(LedgerEntry {
            capacity,
            occupancy: Occupancy::Frame(frame),
        });

        ClaimOutcome::Grow { index, capacity }
    }

    /// Return every region stamped with `frame` to the free state.
    ///
    /// Called once the frames-in-flight rotation proves frame `frame` has
    /// fully retired on the GPU.
    pub fn release_frame(&mut self, frame: u64) {
        for entry in &mut self.entries {
            if entry.occupancy == Occupancy::Frame(frame) {
                entry.occupancy = Occupancy::Free;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_rounds_up_to_power_of_two() {
        let mut ledger = RegionLedger::new();
        assert_eq!(
            ledger.claim(10, 0),
            ClaimOutcome::Grow {
                index: 0,
                capacity: 16
            }
        );
        assert_eq!(ledger.capacity(0), 16);
        assert_eq!(ledger.occupancy(0), Occupancy::Frame(0));
    }

    #[test]
    fn occupied_region_forces_growth() {
        let mut ledger = RegionLedger::new();
        ledger.claim(10, 0);
        // First region is occupied (and too small anyway)
        assert_eq!(
            ledger.claim(20, 0),
            ClaimOutcome::Grow {
                index: 1,
                capacity: 32
            }
        );
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn first_fit_in_pool_order() {
        let mut ledger = RegionLedger::new();
        ledger.claim(1000, 0); // capacity 1024
        ledger.claim(100, 0); // capacity 128
        ledger.release_frame(0);

        // Both regions free and large enough; pool order wins, not best fit
        assert_eq!(ledger.claim(64, 1), ClaimOutcome::Reuse(0));
        assert_eq!(ledger.occupancy(0), Occupancy::Frame(1));
        assert_eq!(ledger.occupancy(1), Occupancy::Free);
    }

    #[test]
    fn claim_leaves_other_regions_untouched() {
        let mut ledger = RegionLedger::new();
        ledger.claim(16, 0);
        ledger.claim(16, 0);
        ledger.release_frame(0);

        ledger.claim(8, 1);
        assert_eq!(ledger.occupancy(0), Occupancy::Frame(1));
        assert_eq!(ledger.occupancy(1), Occupancy::Free);
    }

    #[test]
    fn release_frees_only_matching_frame() {
        let mut ledger = RegionLedger::new();
        ledger.claim(16, 0);
        ledger.claim(16, 1);

        ledger.release_frame(0);
        assert_eq!(ledger.occupancy(0), Occupancy::Free);
        assert_eq!(ledger.occupancy(1), Occupancy::Frame(1));
    }

    #[test]
    fn released_region_is_reused() {
        let mut ledger = RegionLedger::new();
        ledger.claim(16, 0);
        ledger.release_frame(0);

        assert_eq!(ledger.claim(16, 1), ClaimOutcome::Reuse(0));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    #[should_panic(expected = "staging pool exhausted")]
    fn exceeding_region_cap_is_fatal() {
        let mut ledger = RegionLedger::new();
        for _ in 0..MAX_STAGING_REGIONS {
            ledger.claim(16, 0);
        }
        // All regions occupied; the next claim would need a new region
        ledger.claim(16, 0);
    }
}
