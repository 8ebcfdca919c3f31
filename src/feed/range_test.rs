use super::*;

#[test]
fn full_range_contains_every_key() {
    let full = FeedRange::full();
    assert!(full.contains_epk(""));
    assert!(full.contains_epk("0000000000000000"));
    assert!(full.contains_epk("FEFFFFFFFFFFFFFF"));
    assert!(!full.contains_epk("FF"));
}

#[test]
fn split_produces_adjacent_halves() {
    let (left, right) = FeedRange::full().split().unwrap();

    assert_eq!(left.min_inclusive, "");
    assert_eq!(left.max_exclusive, "7F80000000000000");
    assert_eq!(right.min_inclusive, "7F80000000000000");
    assert_eq!(right.max_exclusive, "FF");
    assert!(left.is_adjacent_to(&right));
    assert!(!left.overlaps(&right));
    assert!(FeedRange::full().contains_range(&left));
    assert!(FeedRange::full().contains_range(&right));
}

#[test]
fn union_of_split_halves_is_the_parent() {
    let (left, right) = FeedRange::full().split().unwrap();
    let merged = right.union(&left).unwrap();
    assert!(merged.same_as(&FeedRange::full()));
}

#[test]
fn union_rejects_gaps() {
    let a = FeedRange::new("", "10");
    let b = FeedRange::new("20", "FF");
    assert!(a.union(&b).is_err());
}

#[test]
fn overlap_is_half_open() {
    let a = FeedRange::new("", "80");
    let b = FeedRange::new("80", "FF");
    let c = FeedRange::new("7F", "81");
    assert!(!a.overlaps(&b));
    assert!(a.overlaps(&c));
    assert!(b.overlaps(&c));
}

#[test]
fn padded_and_short_keys_compare_numerically() {
    let r = FeedRange::new("80", "FF");
    assert!(r.same_as(&FeedRange::new("8000000000000000", "FF00000000000000")));
    assert!(r.contains_epk("8000000000000000"));
    assert!(!r.contains_epk("7FFFFFFFFFFFFFFF"));
}

#[test]
fn malformed_bounds_cannot_be_split() {
    assert!(FeedRange::new("XYZ", "FF").split().is_err());
    assert!(FeedRange::new("", "00000000000000001").split().is_err());
}
