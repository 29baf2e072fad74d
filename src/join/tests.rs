//! Unit tests for the pairing engine.

use rstest::rstest;

use super::{Pair, join};

fn distance(l: &i32, r: &i32) -> Option<i32> {
    let diff = (l - r).abs();
    (diff <= 10).then_some(diff)
}

#[rstest]
fn pairs_prefer_lower_scores() {
    let result = join(vec![10, 20], vec![19, 11], distance);

    assert_eq!(
        result.pairs,
        vec![
            Pair {
                left: 10,
                right: 11
            },
            Pair {
                left: 20,
                right: 19
            },
        ]
    );
    assert!(result.only_left.is_empty());
    assert!(result.only_right.is_empty());
}

#[rstest]
fn inadmissible_candidates_are_never_matched() {
    let result = join(vec![0], vec![100], distance);

    assert!(result.pairs.is_empty());
    assert_eq!(result.only_left, vec![0]);
    assert_eq!(result.only_right, vec![100]);
}

#[rstest]
fn ties_resolve_to_smallest_left_then_right_index() {
    // Every candidate scores identically; the matching must still be
    // deterministic.
    let result = join(vec![1, 1, 1], vec![1, 1], |_, _| Some(0));

    assert_eq!(result.pairs.len(), 2);
    assert_eq!(result.only_left, vec![1]);
    assert!(result.only_right.is_empty());
}

#[rstest]
fn leftovers_preserve_input_order() {
    let result = join(vec![5, 300, 6, 400], vec![5], distance);

    assert_eq!(result.pairs, vec![Pair { left: 5, right: 5 }]);
    assert_eq!(result.only_left, vec![300, 6, 400]);
}

#[rstest]
fn a_cheap_cross_match_beats_an_expensive_direct_one() {
    // 10 pairs with 12 at cost 2 even though 19 is also admissible for it,
    // because the global ordering visits cheaper candidates first.
    let result = join(vec![10], vec![19, 12], distance);

    assert_eq!(
        result.pairs,
        vec![Pair {
            left: 10,
            right: 12
        }]
    );
    assert_eq!(result.only_right, vec![19]);
}

#[rstest]
#[case(Vec::new(), vec![7], 0, 1)]
#[case(vec![7], Vec::new(), 1, 0)]
#[case(Vec::new(), Vec::new(), 0, 0)]
fn empty_sides_produce_only_leftovers(
    #[case] left: Vec<i32>,
    #[case] right: Vec<i32>,
    #[case] expected_left: usize,
    #[case] expected_right: usize,
) {
    let result = join(left, right, distance);

    assert!(result.pairs.is_empty());
    assert_eq!(result.only_left.len(), expected_left);
    assert_eq!(result.only_right.len(), expected_right);
}
