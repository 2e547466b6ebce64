// Cluster allocation for relocation targets. The allocator state lives in a
// context object owned by the resize engine, never in globals; two engines
// can't interfere with each other's scan position.

use carve_core::CarveError;
use log::debug;

use crate::bitmap::Bitmap;
use crate::meta::{Lcn, RunEntry};

#[derive(Debug, Default)]
pub struct ClusterAlloc {
    /// Rolling scan position; the next search starts here.
    pos: u64,
    /// Upper bound on the longest free run found so far; lets a search stop
    /// early when no bigger run can exist.
    max_free_range: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct FreeZone {
    lcn: u64,
    length: u64,
}

impl ClusterAlloc {
    pub fn new() -> Self {
        ClusterAlloc::default()
    }

    /// Forget the free-run bound, e.g. after clusters were freed back into
    /// the bitmap.
    pub fn reset_max_range(&mut self) {
        self.max_free_range = 0;
    }

    /// Find one free zone of up to `want` clusters below `nr_clusters`,
    /// commit it in the bitmap, and return it. When no run of the full size
    /// exists the largest zone seen is committed instead.
    fn find_free(
        &mut self,
        bm: &mut Bitmap,
        want: u64,
        nr_clusters: u64,
        hint: bool,
    ) -> Option<FreeZone> {
        if self.pos >= nr_clusters {
            self.pos = 0;
        }
        if self.max_free_range == 0 {
            self.max_free_range = nr_clusters;
        }
        if hint {
            self.pos = nr_clusters / 2;
        }

        let mut best = FreeZone::default();
        let mut free_zone = 0u64;
        let mut i = self.pos;

        let keep_best = |best: &mut FreeZone, length: u64, end: u64| {
            if length > best.length {
                best.lcn = end - length;
                best.length = length;
            }
        };

        loop {
            if !bm.get(i) {
                free_zone += 1;
                if free_zone == want {
                    keep_best(&mut best, free_zone, i + 1);
                    break;
                }
            } else {
                keep_best(&mut best, free_zone, i);
                free_zone = 0;
            }

            i += 1;
            if i == nr_clusters {
                keep_best(&mut best, free_zone, i);
                i = 0;
                free_zone = 0;
            }
            if best.length == self.max_free_range {
                break;
            }
            // Wrap around at most once; never pass the start twice.
            if i == self.pos {
                keep_best(&mut best, free_zone, i);
                break;
            }
        }

        if best.length == 0 {
            return None;
        }

        if best.length < want && best.length < self.max_free_range {
            self.max_free_range = best.length;
            debug!("Max free range: {}", self.max_free_range);
        }

        // Resume just past the committed run.
        self.pos = best.lcn + best.length;
        if self.pos >= nr_clusters {
            self.pos = 0;
        }

        bm.set_range(best.lcn, best.length, true);
        Some(best)
    }

    /// Allocate `items` clusters below `nr_clusters`, contiguously if
    /// possible, as multiple runs otherwise. With `hint` the first zone is
    /// sought near the middle of the volume.
    pub fn alloc(
        &mut self,
        bm: &mut Bitmap,
        items: u64,
        nr_clusters: u64,
        hint: bool,
    ) -> Result<Vec<RunEntry>, CarveError> {
        if items == 0 {
            return Err(CarveError::Parameter(
                "zero-cluster allocation".to_string(),
            ));
        }

        let mut runs = Vec::new();
        let mut remaining = items;
        let mut vcn = 0u64;
        let mut hint = hint;

        while remaining > 0 {
            let zone = self
                .find_free(bm, remaining, nr_clusters, hint)
                .ok_or_else(|| {
                    CarveError::NoSpace(format!(
                        "no free clusters for an allocation of {}",
                        items
                    ))
                })?;
            hint = false;

            runs.push(RunEntry::new(vcn, Lcn::At(zone.lcn), zone.length));
            vcn += zone.length;
            remaining -= zone.length;
        }

        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Bitmap with free runs of 40, 30, 20, and 10 clusters separated by
    /// single occupied clusters: 103 clusters total.
    fn fragmented_bitmap() -> Bitmap {
        let mut bm = Bitmap::new(103);
        bm.set(40, true);
        bm.set(71, true);
        bm.set(92, true);
        bm
    }

    #[test]
    fn test_contiguous_allocation() {
        let mut bm = fragmented_bitmap();
        let mut alloc = ClusterAlloc::new();
        let runs = alloc.alloc(&mut bm, 30, 103, false).unwrap();
        assert_eq!(runs, vec![RunEntry::new(0, Lcn::At(0), 30)]);
        assert!(bm.get(0) && bm.get(29) && !bm.get(30));
    }

    #[test]
    fn test_fragmented_allocation_walks_runs() {
        let mut bm = fragmented_bitmap();
        let mut alloc = ClusterAlloc::new();

        // 50 clusters don't fit contiguously: the 40-run is committed, then
        // 10 more from the start of the next free run.
        let runs = alloc.alloc(&mut bm, 50, 103, false).unwrap();
        assert_eq!(
            runs,
            vec![
                RunEntry::new(0, Lcn::At(0), 40),
                RunEntry::new(40, Lcn::At(41), 10),
            ]
        );
        for bit in 0..40 {
            assert!(bm.get(bit));
        }
        for bit in 41..51 {
            assert!(bm.get(bit));
        }
        assert!(!bm.get(51));
    }

    #[test]
    fn test_zero_request_fails() {
        let mut bm = fragmented_bitmap();
        let mut alloc = ClusterAlloc::new();
        assert!(alloc.alloc(&mut bm, 0, 103, false).is_err());
    }

    #[test]
    fn test_oversized_request_fails() {
        let mut bm = fragmented_bitmap();
        let mut alloc = ClusterAlloc::new();
        match alloc.alloc(&mut bm, 200, 103, false) {
            Err(CarveError::NoSpace(_)) => {}
            other => panic!("expected no-space, got {:?}", other),
        }
    }

    #[test]
    fn test_hint_searches_volume_middle() {
        let mut bm = Bitmap::new(100);
        let mut alloc = ClusterAlloc::new();
        let runs = alloc.alloc(&mut bm, 4, 100, true).unwrap();
        assert_eq!(runs, vec![RunEntry::new(0, Lcn::At(50), 4)]);
    }

    #[test]
    fn test_full_bitmap_fails() {
        let mut bm = Bitmap::new(16);
        bm.set_range(0, 16, true);
        let mut alloc = ClusterAlloc::new();
        assert!(alloc.alloc(&mut bm, 1, 16, false).is_err());
    }
}
