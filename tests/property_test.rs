use proptest::prelude::*;
use spinel_cluster::core::slot::{NUM_SLOTS, get_slot};

proptest! {
    #[test]
    fn slot_is_always_within_the_slot_space(key in any::<Vec<u8>>()) {
        prop_assert!((get_slot(&key) as usize) < NUM_SLOTS);
    }

    #[test]
    fn hash_tagged_keys_collide_with_their_tag(
        tag in "[a-z0-9]{1,16}",
        prefix in "[a-z0-9]{0,8}",
        suffix in "[a-z0-9]{0,8}",
    ) {
        let tagged = format!("{prefix}{{{tag}}}{suffix}");
        prop_assert_eq!(get_slot(tagged.as_bytes()), get_slot(tag.as_bytes()));
    }

    #[test]
    fn slot_ignores_everything_outside_the_tag(
        tag in "[a-z0-9]{1,16}",
        a in "[a-z0-9]{0,8}",
        b in "[a-z0-9]{0,8}",
    ) {
        let first = format!("{a}{{{tag}}}");
        let second = format!("{b}{{{tag}}}");
        prop_assert_eq!(get_slot(first.as_bytes()), get_slot(second.as_bytes()));
    }
}
