use proptest::prelude::*;
use taskweave::region::Region;

fn region() -> impl Strategy<Value = Region> {
    (0u64..1 << 20, 0u64..1 << 12).prop_map(|(start, len)| Region::new(start, len))
}

proptest! {
    #[test]
    fn fragments_tile_the_region(r in region(), max_len in 1u64..512) {
        let chunks: Vec<_> = r.fragments(max_len).collect();
        prop_assert_eq!(chunks.len(), r.fragment_count(max_len));
        let mut cursor = r.start;
        for chunk in &chunks {
            prop_assert_eq!(chunk.start, cursor);
            prop_assert!(chunk.len > 0 && chunk.len <= max_len);
            cursor = chunk.end();
        }
        prop_assert_eq!(cursor, if chunks.is_empty() { r.start } else { r.end() });
    }

    #[test]
    fn intersection_lies_in_both(a in region(), b in region()) {
        prop_assert_eq!(a.intersect(&b), b.intersect(&a));
        match a.intersect(&b) {
            Some(common) => {
                prop_assert!(a.overlaps(&b));
                prop_assert!(common.fully_contained_in(&a));
                prop_assert!(common.fully_contained_in(&b));
            }
            None => prop_assert!(!a.overlaps(&b)),
        }
    }
}
