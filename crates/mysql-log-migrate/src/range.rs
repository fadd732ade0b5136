//! PK range planning: shard tiling and incremental-resume bounds.

/// A closed interval over the source's numeric primary key.
///
/// Consumed exactly once by a stage worker; the matching query binds
/// `(from - 1, to)` against `pk > ? AND pk <= ?` so adjacent shards never
/// double-count boundary rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PkRange {
    pub from: u64,
    pub to: u64,
}

impl std::fmt::Display for PkRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}..{}]", self.from, self.to)
    }
}

/// Tile `[min..max]` with fixed-width shards; the last shard is clamped to
/// `max`. Returns an empty sequence when `max < min`. Shards never overlap
/// and cover the interval exactly.
pub fn split_by_width(min: u64, max: u64, width: u64) -> Vec<PkRange> {
    let width = width.max(1);
    if max < min {
        return Vec::new();
    }

    let mut out = Vec::new();
    let mut cur = min;
    loop {
        let end = cur.saturating_add(width - 1).min(max);
        out.push(PkRange { from: cur, to: end });
        if end >= max {
            break;
        }
        cur = end + 1;
    }

    out
}

/// Split `[min..max]` into roughly `parts` shards of equal width; used by the
/// export variant where each worker owns one shard.
pub fn split_into(min: u64, max: u64, parts: usize) -> Vec<PkRange> {
    if max < min {
        return Vec::new();
    }

    let parts = parts.max(1) as u64;
    let width = ((max - min + 1) / parts).max(1);

    split_by_width(min, max, width)
}

/// Apply the resume rule to the discovered bounds.
///
/// `min` is the larger of the source minimum and the destination's highest
/// already-migrated numeric id; the run covers `(min, max]` territory. Returns
/// `None` ("no rows") when the source range is absent, already covered by the
/// destination, or collapses to a point.
pub fn resolve_bounds(
    src_min: Option<u64>,
    src_max: Option<u64>,
    dst_max: Option<u64>,
) -> Option<(u64, u64)> {
    let (src_min, src_max) = match (src_min, src_max) {
        (Some(a), Some(b)) => (a, b),
        _ => return None,
    };

    let min = match dst_max {
        Some(d) if d > src_min => d,
        _ => src_min,
    };

    if min >= src_max {
        return None;
    }

    Some((min, src_max))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_by_width_tiles_exactly() {
        let shards = split_by_width(1, 250_000, 100_000);
        assert_eq!(
            shards,
            vec![
                PkRange { from: 1, to: 100_000 },
                PkRange { from: 100_001, to: 200_000 },
                PkRange { from: 200_001, to: 250_000 },
            ]
        );
    }

    #[test]
    fn test_split_by_width_no_gaps_no_overlaps() {
        for (min, max, width) in [(1u64, 10u64, 3u64), (5, 5, 10), (0, 99, 7), (3, 1000, 1)] {
            let shards = split_by_width(min, max, width);
            assert!(!shards.is_empty());
            assert_eq!(shards[0].from, min);
            assert_eq!(shards.last().unwrap().to, max);
            for pair in shards.windows(2) {
                assert_eq!(pair[1].from, pair[0].to + 1, "gap or overlap in {:?}", pair);
            }
            for s in &shards {
                assert!(s.from <= s.to);
            }
        }
    }

    #[test]
    fn test_split_by_width_single_point() {
        assert_eq!(split_by_width(100, 100, 10), vec![PkRange { from: 100, to: 100 }]);
    }

    #[test]
    fn test_split_by_width_inverted_range_is_empty() {
        assert!(split_by_width(100, 50, 10).is_empty());
    }

    #[test]
    fn test_split_by_width_near_u64_max() {
        let shards = split_by_width(u64::MAX - 5, u64::MAX, 4);
        assert_eq!(shards.last().unwrap().to, u64::MAX);
        for pair in shards.windows(2) {
            assert_eq!(pair[1].from, pair[0].to + 1);
        }
    }

    #[test]
    fn test_split_into_parts() {
        let shards = split_into(1, 100, 4);
        assert_eq!(shards[0], PkRange { from: 1, to: 25 });
        assert_eq!(shards.last().unwrap().to, 100);

        // Huge part count degrades to width-1 shards, never panics.
        let shards = split_into(1, 5, 100);
        assert_eq!(shards.len(), 5);

        assert!(split_into(10, 9, 4).is_empty());
    }

    #[test]
    fn test_resolve_bounds_fresh_run() {
        assert_eq!(resolve_bounds(Some(1), Some(100_000), None), Some((1, 100_000)));
        assert_eq!(resolve_bounds(Some(1), Some(100_000), Some(0)), Some((1, 100_000)));
    }

    #[test]
    fn test_resolve_bounds_resumes_from_destination() {
        assert_eq!(
            resolve_bounds(Some(1), Some(100_000), Some(50_000)),
            Some((50_000, 100_000))
        );
    }

    #[test]
    fn test_resolve_bounds_no_rows() {
        assert_eq!(resolve_bounds(None, None, None), None);
        assert_eq!(resolve_bounds(Some(1), None, None), None);
        // Destination already at or past the source maximum.
        assert_eq!(resolve_bounds(Some(1), Some(100), Some(100)), None);
        assert_eq!(resolve_bounds(Some(1), Some(100), Some(150)), None);
        // Collapsed range.
        assert_eq!(resolve_bounds(Some(7), Some(7), None), None);
    }
}
