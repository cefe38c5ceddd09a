//! Chunk map — which byte windows of a resource a holder possesses
//!
//! A chunk map is a sorted set of half-open ranges `[start, start+length)`
//! over `[0, chunk_cnt)`. Adjacent or overlapping ranges are merged eagerly
//! on insertion, so the range list is always minimal and
//! `present_chunk_cnt` equals the sum of the range lengths.

use crate::wire::{Reader, SectionWriter, WireError, Writer, SEP_ENTRY, SEP_PART};
use rand::Rng;

/// One contiguous run of present chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u32,
    pub length: u32,
}

/// The set of chunks a particular holder possesses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkMap {
    chunk_cnt: u32,
    present_cnt: u32,
    ranges: Vec<ChunkRange>,
}

impl ChunkMap {
    /// Empty map over `chunk_cnt` chunks.
    pub fn incomplete(chunk_cnt: u32) -> Self {
        Self {
            chunk_cnt,
            present_cnt: 0,
            ranges: Vec::new(),
        }
    }

    /// Full map over `chunk_cnt` chunks.
    pub fn complete(chunk_cnt: u32) -> Self {
        let mut map = Self::incomplete(chunk_cnt);
        map.add_range(0, chunk_cnt);
        map
    }

    /// Reset to empty over a (possibly new) chunk count.
    pub fn set_incomplete(&mut self, chunk_cnt: u32) {
        self.chunk_cnt = chunk_cnt;
        self.present_cnt = 0;
        self.ranges.clear();
    }

    /// Reset to full over a (possibly new) chunk count.
    pub fn set_complete(&mut self, chunk_cnt: u32) {
        self.set_incomplete(chunk_cnt);
        self.add_range(0, chunk_cnt);
    }

    pub fn chunk_cnt(&self) -> u32 {
        self.chunk_cnt
    }

    pub fn present_chunk_cnt(&self) -> u32 {
        self.present_cnt
    }

    pub fn range_cnt(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_complete(&self) -> bool {
        self.present_cnt == self.chunk_cnt
    }

    pub fn has_chunk(&self, chunk: u32) -> bool {
        self.ranges
            .iter()
            .any(|r| r.start <= chunk && chunk < r.start + r.length)
    }

    pub fn add_chunk(&mut self, chunk: u32) {
        self.add_range(chunk, 1);
    }

    /// Insert a range, clamping invalid input away: zero-length ranges and
    /// ranges reaching past `chunk_cnt` are silently rejected.
    pub fn add_range(&mut self, start: u32, length: u32) {
        if length == 0 || start.checked_add(length).map_or(true, |e| e > self.chunk_cnt) {
            return;
        }
        // insertion point: first range with start >= new start
        let at = self.ranges.partition_point(|r| r.start < start);
        self.ranges.insert(at, ChunkRange { start, length });
        self.present_cnt += length;
        // merge forward from the predecessor
        let mut i = at.saturating_sub(1);
        while i + 1 < self.ranges.len() {
            let cur = self.ranges[i];
            let next = self.ranges[i + 1];
            if cur.start + cur.length < next.start {
                if i >= at {
                    break;
                }
                i += 1;
                continue;
            }
            let overlap = (cur.start + cur.length - next.start).min(next.length);
            self.ranges[i].length = cur.length + next.length - overlap;
            self.ranges.remove(i + 1);
            self.present_cnt -= overlap;
        }
    }

    /// Union with another map. Both maps must cover the same chunk count.
    pub fn merge(&mut self, other: &ChunkMap) {
        assert_eq!(
            self.chunk_cnt, other.chunk_cnt,
            "chunk map merge requires equal chunk counts"
        );
        for range in &other.ranges {
            self.add_range(range.start, range.length);
        }
    }

    /// The map of absent chunks over the same chunk count.
    pub fn complement(&self) -> ChunkMap {
        let mut out = ChunkMap::incomplete(self.chunk_cnt);
        let mut free_start = 0;
        for range in &self.ranges {
            out.add_range(free_start, range.start - free_start);
            free_start = range.start + range.length;
        }
        out.add_range(free_start, self.chunk_cnt - free_start);
        out
    }

    /// The `nr`-th present chunk index in order, if `nr < present_chunk_cnt`.
    pub fn nth_present(&self, mut nr: u32) -> Option<u32> {
        for range in &self.ranges {
            if nr < range.length {
                return Some(range.start + nr);
            }
            nr -= range.length;
        }
        None
    }

    /// Pick a chunk to request from a peer: one the peer has, that we lack,
    /// and that is not already in flight. Uniformly random over the
    /// candidate set; `None` when no such chunk exists.
    ///
    /// `available` must cover the same chunk count as `self`.
    pub fn pick_retrieval<R: Rng>(
        &self,
        available: &ChunkMap,
        in_flight: &[u32],
        rng: &mut R,
    ) -> Option<u32> {
        // everything that should not be retrieved
        let mut blocked = available.complement();
        blocked.merge(self);
        for &chunk in in_flight {
            blocked.add_chunk(chunk);
        }
        if blocked.is_complete() {
            return None;
        }
        let candidates = blocked.complement();
        let pick = rng.gen_range(0..candidates.present_chunk_cnt());
        candidates.nth_present(pick)
    }

    pub fn ranges(&self) -> impl Iterator<Item = ChunkRange> + '_ {
        self.ranges.iter().copied()
    }

    /// Wire form: `ChunkCnt`, `ChunkRangeCnt`, then a `Ranges` section of
    /// `start=length` entries separated by `;`.
    pub fn encode(&self, w: &mut Writer) {
        w.uint("ChunkCnt", u64::from(self.chunk_cnt), 0);
        w.uint("ChunkRangeCnt", self.ranges.len() as u64, 0);
        let mut body = SectionWriter::new();
        for (i, range) in self.ranges.iter().enumerate() {
            if i > 0 {
                body.sep(SEP_ENTRY);
            }
            body.uint(u64::from(range.start));
            body.sep(SEP_PART);
            body.uint(u64::from(range.length));
        }
        w.section("Ranges", &body.into_bytes());
    }

    pub fn decode(r: &mut Reader<'_>) -> Result<Self, WireError> {
        let chunk_cnt = r.uint("ChunkCnt", 0)? as u32;
        let range_cnt = r.uint("ChunkRangeCnt", 0)? as usize;
        let mut section = r.section("Ranges")?;
        let mut map = ChunkMap::incomplete(chunk_cnt);
        for i in 0..range_cnt {
            if i > 0 {
                section.sep(SEP_ENTRY)?;
            }
            let start = section.uint()? as u32;
            section.sep(SEP_PART)?;
            let length = section.uint()? as u32;
            map.add_range(start, length);
        }
        if !section.at_end() {
            return Err(WireError::Corrupt(
                "chunk range count disagrees with ranges".into(),
            ));
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_invariants(map: &ChunkMap) {
        let mut sum = 0u32;
        let mut prev_end: Option<u32> = None;
        for r in map.ranges() {
            assert!(r.length > 0);
            assert!(r.start + r.length <= map.chunk_cnt());
            if let Some(end) = prev_end {
                // strictly increasing, non-adjacent
                assert!(r.start > end);
            }
            prev_end = Some(r.start + r.length);
            sum += r.length;
        }
        assert_eq!(sum, map.present_chunk_cnt());
        assert!(map.present_chunk_cnt() <= map.chunk_cnt());
    }

    #[test]
    fn test_empty_and_complete() {
        let empty = ChunkMap::incomplete(10);
        assert_eq!(empty.present_chunk_cnt(), 0);
        assert!(!empty.is_complete());

        let full = ChunkMap::complete(10);
        assert_eq!(full.present_chunk_cnt(), 10);
        assert!(full.is_complete());
        assert_eq!(full.range_cnt(), 1);
        assert_invariants(&full);
    }

    #[test]
    fn test_zero_chunks_is_complete() {
        let map = ChunkMap::incomplete(0);
        assert!(map.is_complete());
    }

    #[test]
    fn test_add_chunk_merges_adjacent() {
        let mut map = ChunkMap::incomplete(10);
        map.add_chunk(3);
        map.add_chunk(5);
        assert_eq!(map.range_cnt(), 2);
        map.add_chunk(4);
        assert_eq!(map.range_cnt(), 1);
        assert_eq!(map.present_chunk_cnt(), 3);
        assert_invariants(&map);
    }

    #[test]
    fn test_add_range_overlap_counts_once() {
        let mut map = ChunkMap::incomplete(20);
        map.add_range(2, 6);
        map.add_range(5, 6);
        assert_eq!(map.present_chunk_cnt(), 9);
        assert_eq!(map.range_cnt(), 1);
        assert_invariants(&map);
    }

    #[test]
    fn test_add_range_swallows_contained() {
        let mut map = ChunkMap::incomplete(20);
        map.add_range(5, 2);
        map.add_range(10, 3);
        map.add_range(0, 20);
        assert!(map.is_complete());
        assert_eq!(map.range_cnt(), 1);
        assert_invariants(&map);
    }

    #[test]
    fn test_add_range_rejects_out_of_bounds() {
        let mut map = ChunkMap::incomplete(10);
        map.add_range(8, 5);
        map.add_range(0, 0);
        map.add_range(u32::MAX, 2);
        assert_eq!(map.present_chunk_cnt(), 0);
    }

    #[test]
    fn test_duplicate_add_is_idempotent() {
        let mut map = ChunkMap::incomplete(10);
        map.add_chunk(4);
        map.add_chunk(4);
        assert_eq!(map.present_chunk_cnt(), 1);
        assert_invariants(&map);
    }

    #[test]
    fn test_merge_union_cardinality() {
        let mut a = ChunkMap::incomplete(30);
        a.add_range(0, 10);
        a.add_range(20, 5);
        let mut b = ChunkMap::incomplete(30);
        b.add_range(5, 10);
        b.add_range(28, 2);
        a.merge(&b);
        // |[0,15) ∪ [20,25) ∪ [28,30)| = 15 + 5 + 2
        assert_eq!(a.present_chunk_cnt(), 22);
        assert_invariants(&a);
    }

    #[test]
    #[should_panic(expected = "equal chunk counts")]
    fn test_merge_chunk_cnt_mismatch_panics() {
        let mut a = ChunkMap::incomplete(10);
        let b = ChunkMap::incomplete(11);
        a.merge(&b);
    }

    #[test]
    fn test_complement_involution() {
        let mut map = ChunkMap::incomplete(50);
        map.add_range(3, 4);
        map.add_range(10, 1);
        map.add_range(30, 20);
        let back = map.complement().complement();
        assert_eq!(map, back);
        assert_invariants(&map.complement());
    }

    #[test]
    fn test_complement_counts() {
        let mut map = ChunkMap::incomplete(10);
        map.add_range(0, 4);
        let neg = map.complement();
        assert_eq!(neg.present_chunk_cnt(), 6);
        assert!(neg.has_chunk(4));
        assert!(!neg.has_chunk(3));
    }

    #[test]
    fn test_nth_present_order() {
        let mut map = ChunkMap::incomplete(20);
        map.add_range(2, 2);
        map.add_range(10, 3);
        let present: Vec<u32> = (0..map.present_chunk_cnt())
            .map(|i| map.nth_present(i).unwrap())
            .collect();
        assert_eq!(present, vec![2, 3, 10, 11, 12]);
        assert_eq!(map.nth_present(5), None);
    }

    #[test]
    fn test_pick_retrieval_properties() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut have = ChunkMap::incomplete(16);
        have.add_range(0, 4);
        let mut avail = ChunkMap::incomplete(16);
        avail.add_range(0, 12);
        let in_flight = [4u32, 5];
        for _ in 0..64 {
            let pick = have.pick_retrieval(&avail, &in_flight, &mut rng).unwrap();
            assert!(avail.has_chunk(pick));
            assert!(!have.has_chunk(pick));
            assert!(!in_flight.contains(&pick));
        }
    }

    #[test]
    fn test_pick_retrieval_exhausted() {
        let mut rng = StdRng::seed_from_u64(7);
        let have = ChunkMap::complete(8);
        let avail = ChunkMap::complete(8);
        assert_eq!(have.pick_retrieval(&avail, &[], &mut rng), None);

        // peer has nothing we lack
        let have = ChunkMap::incomplete(8);
        let avail = ChunkMap::incomplete(8);
        assert_eq!(have.pick_retrieval(&avail, &[], &mut rng), None);
    }

    #[test]
    fn test_pick_retrieval_single_chunk() {
        let mut rng = StdRng::seed_from_u64(1);
        let have = ChunkMap::incomplete(1);
        let avail = ChunkMap::complete(1);
        assert_eq!(have.pick_retrieval(&avail, &[], &mut rng), Some(0));
        let have = ChunkMap::complete(1);
        assert_eq!(have.pick_retrieval(&avail, &[], &mut rng), None);
    }

    #[test]
    fn test_pick_retrieval_skips_in_flight() {
        let mut rng = StdRng::seed_from_u64(3);
        let have = ChunkMap::incomplete(3);
        let avail = ChunkMap::complete(3);
        let pick = have.pick_retrieval(&avail, &[0, 2], &mut rng);
        assert_eq!(pick, Some(1));
        assert_eq!(have.pick_retrieval(&avail, &[0, 1, 2], &mut rng), None);
    }

    #[test]
    fn test_wire_roundtrip() {
        let mut map = ChunkMap::incomplete(100);
        map.add_range(0, 10);
        map.add_range(40, 1);
        map.add_range(90, 10);

        let mut w = Writer::new();
        map.encode(&mut w);
        let buf = w.into_bytes();

        let mut r = Reader::new(&buf);
        let back = ChunkMap::decode(&mut r).unwrap();
        assert_eq!(map, back);
        assert_invariants(&back);
    }

    #[test]
    fn test_wire_empty_map() {
        let map = ChunkMap::incomplete(5);
        let mut w = Writer::new();
        map.encode(&mut w);
        let buf = w.into_bytes();
        let back = ChunkMap::decode(&mut Reader::new(&buf)).unwrap();
        assert_eq!(back.chunk_cnt(), 5);
        assert_eq!(back.present_chunk_cnt(), 0);
    }

    #[test]
    fn test_wire_range_count_mismatch_is_corrupt() {
        let mut w = Writer::new();
        w.uint("ChunkCnt", 10, 0);
        w.uint("ChunkRangeCnt", 1, 0);
        let mut body = SectionWriter::new();
        body.uint(0);
        body.sep(SEP_PART);
        body.uint(2);
        body.sep(SEP_ENTRY);
        body.uint(5);
        body.sep(SEP_PART);
        body.uint(1);
        w.section("Ranges", &body.into_bytes());
        let buf = w.into_bytes();
        assert!(ChunkMap::decode(&mut Reader::new(&buf)).is_err());
    }

    #[test]
    fn test_wire_missing_ranges_section_is_corrupt() {
        let mut w = Writer::new();
        w.uint("ChunkCnt", 10, 0);
        w.uint("ChunkRangeCnt", 0, 0);
        let buf = w.into_bytes();
        assert!(matches!(
            ChunkMap::decode(&mut Reader::new(&buf)),
            Err(WireError::Corrupt(_))
        ));
    }
}
