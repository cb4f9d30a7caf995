#![forbid(unsafe_code)]

use e2r_bmap::{BlockMap, BlockTier};
use e2r_types::BlockSize;
use proptest::prelude::*;

fn block_size_strategy() -> impl Strategy<Value = u32> {
    prop::sample::select(vec![1024_u32, 2048, 4096])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn path_round_trips_through_logical(bs in block_size_strategy(), seed in any::<u64>()) {
        let map = BlockMap::new(BlockSize::new(bs).unwrap());
        let logical = seed % map.max_logical_blocks();
        let path = map.path(logical).unwrap();
        prop_assert_eq!(map.logical(&path), logical);
        prop_assert_eq!(path.tier, map.classify(logical).unwrap());
        for off in path.offsets() {
            prop_assert!((*off as u64) < map.pointers_per_block());
        }
    }

    #[test]
    fn tier_ranges_contain_their_members(bs in block_size_strategy(), seed in any::<u64>()) {
        let map = BlockMap::new(BlockSize::new(bs).unwrap());
        let logical = seed % map.max_logical_blocks();
        let tier = map.classify(logical).unwrap();
        let start = map.tier_start(tier);
        prop_assert!(logical >= start);
        prop_assert!(logical < start + map.tier_width(tier));
    }

    #[test]
    fn neighbours_share_all_but_the_last_level(bs in block_size_strategy(), seed in any::<u64>()) {
        let map = BlockMap::new(BlockSize::new(bs).unwrap());
        let logical = seed % (map.max_logical_blocks() - 1);
        let a = map.path(logical).unwrap();
        let b = map.path(logical + 1).unwrap();
        let shared = a.shared_prefix(&b);
        prop_assert_eq!(shared, b.shared_prefix(&a));
        if a.tier == b.tier && a.tier != BlockTier::Direct {
            prop_assert!(shared >= 1);
            prop_assert!(shared <= a.depth());
        } else {
            prop_assert_eq!(shared, 0);
        }
    }

    #[test]
    fn beyond_triple_range_is_too_large(bs in block_size_strategy(), extra in 0_u64..1_000_000) {
        let map = BlockMap::new(BlockSize::new(bs).unwrap());
        let logical = map.max_logical_blocks() + extra;
        prop_assert!(map.path(logical).is_err());
    }
}
