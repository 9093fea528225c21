//! Nearest-first spiral ordering of horizontal chunk offsets

use std::collections::HashMap;

use glam::IVec2;

/// Scale applied to offsets outside the cached radius so they sort after
/// every cached offset, grouped by Chebyshev ring.
pub const OUT_OF_RANGE_PRIORITY_SCALE: u64 = 100_000;

/// Cached spiral order for one radius, plus its reverse lookup.
///
/// Ring `r` starts at `(r, 0)`, climbs the right edge to `(r, r)`, walks the
/// top edge to `(-r, r)`, descends the left edge to `(-r, -r)`, walks the
/// bottom edge to `(r, -r)` and closes on the right edge at `(r, -1)`.
/// Offsets are `(dx, dz)`.
#[derive(Debug, Default)]
pub struct SpiralIndexer {
    radius: Option<u32>,
    offsets: Vec<IVec2>,
    index: HashMap<IVec2, usize>,
}

impl SpiralIndexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild for `radius` if it changed. Returns true when rebuilt.
    pub fn ensure(&mut self, radius: u32) -> bool {
        if self.radius == Some(radius) {
            return false;
        }
        self.offsets = Self::build(radius as i32);
        self.index = self
            .offsets
            .iter()
            .enumerate()
            .map(|(i, o)| (*o, i))
            .collect();
        self.radius = Some(radius);
        log::debug!("Spiral order rebuilt: radius {}, {} offsets", radius, self.offsets.len());
        true
    }

    fn build(r: i32) -> Vec<IVec2> {
        let side = (2 * r + 1) as usize;
        let mut out = Vec::with_capacity(side * side);
        out.push(IVec2::ZERO);
        for ring in 1..=r {
            out.push(IVec2::new(ring, 0));
            for z in 1..=ring {
                out.push(IVec2::new(ring, z));
            }
            for x in (-ring..ring).rev() {
                out.push(IVec2::new(x, ring));
            }
            for z in (-ring..ring).rev() {
                out.push(IVec2::new(-ring, z));
            }
            for x in (-ring + 1)..=ring {
                out.push(IVec2::new(x, -ring));
            }
            for z in (-ring + 1)..0 {
                out.push(IVec2::new(ring, z));
            }
        }
        out
    }

    pub fn radius(&self) -> Option<u32> {
        self.radius
    }

    pub fn offsets(&self) -> &[IVec2] {
        &self.offsets
    }

    /// Rank of an offset: its spiral index when cached, otherwise a value
    /// past every cached index ordered by Chebyshev distance.
    pub fn priority_of(&self, offset: IVec2) -> u64 {
        if let Some(&i) = self.index.get(&offset) {
            return i as u64;
        }
        let radius = self.radius.unwrap_or(0) as u64;
        let chebyshev = offset.x.unsigned_abs().max(offset.y.unsigned_abs()) as u64;
        (radius + chebyshev) * OUT_OF_RANGE_PRIORITY_SCALE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_offset_count_and_uniqueness() {
        let mut spiral = SpiralIndexer::new();
        for r in 0..=12u32 {
            spiral.ensure(r);
            let expected = ((2 * r + 1) * (2 * r + 1)) as usize;
            assert_eq!(spiral.offsets().len(), expected);
            let unique: HashSet<_> = spiral.offsets().iter().collect();
            assert_eq!(unique.len(), expected);
            assert_eq!(spiral.offsets()[0], IVec2::ZERO);
            let ri = r as i32;
            assert!(spiral.offsets().iter().all(|o| o.x.abs() <= ri && o.y.abs() <= ri));
        }
    }

    #[test]
    fn test_ring_one_order() {
        let mut spiral = SpiralIndexer::new();
        spiral.ensure(1);
        let expected: Vec<IVec2> = [
            (0, 0), (1, 0), (1, 1), (0, 1), (-1, 1), (-1, 0), (-1, -1), (0, -1), (1, -1),
        ]
        .iter()
        .map(|&(x, z)| IVec2::new(x, z))
        .collect();
        assert_eq!(spiral.offsets(), expected.as_slice());
    }

    #[test]
    fn test_ring_two_starts_after_ring_one() {
        let mut spiral = SpiralIndexer::new();
        spiral.ensure(2);
        let offsets = spiral.offsets();
        assert_eq!(offsets[9], IVec2::new(2, 0));
        assert_eq!(offsets[10], IVec2::new(2, 1));
        assert_eq!(offsets[11], IVec2::new(2, 2));
        assert_eq!(offsets[12], IVec2::new(1, 2));
        assert_eq!(offsets[24], IVec2::new(2, -1));
        // Rings never interleave
        for (i, o) in offsets.iter().enumerate() {
            let ring = o.x.abs().max(o.y.abs());
            let expected = if i == 0 { 0 } else if i < 9 { 1 } else { 2 };
            assert_eq!(ring, expected);
        }
    }

    #[test]
    fn test_priority_monotonic_with_order() {
        let mut spiral = SpiralIndexer::new();
        spiral.ensure(5);
        let priorities: Vec<u64> = spiral.offsets().iter().map(|o| spiral.priority_of(*o)).collect();
        assert!(priorities.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(priorities[0], 0);
    }

    #[test]
    fn test_out_of_range_priority() {
        let mut spiral = SpiralIndexer::new();
        spiral.ensure(2);
        let last_cached = (spiral.offsets().len() - 1) as u64;

        let near = spiral.priority_of(IVec2::new(3, 0));
        let far = spiral.priority_of(IVec2::new(-1, 7));
        assert_eq!(near, 5 * OUT_OF_RANGE_PRIORITY_SCALE);
        assert_eq!(far, 9 * OUT_OF_RANGE_PRIORITY_SCALE);
        assert!(last_cached < near && near < far);
    }

    #[test]
    fn test_ensure_rebuilds_only_on_change() {
        let mut spiral = SpiralIndexer::new();
        assert!(spiral.ensure(3));
        assert!(!spiral.ensure(3));
        assert!(spiral.ensure(0));
        assert_eq!(spiral.offsets(), &[IVec2::ZERO]);
        assert_eq!(spiral.radius(), Some(0));
    }
}
