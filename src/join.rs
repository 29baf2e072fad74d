//! Generic pairing of two record sets under a scored equivalence.
//!
//! The reconciliation planner pairs desired rows with observed machines by
//! several overlapping identity keys; this module supplies the matching
//! itself, leaving the scoring to the caller. Scores are opaque ordered
//! values where lower is better and `None` marks an inadmissible pair.

/// A matched element from each side.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pair<L, R> {
    /// Element taken from the left sequence.
    pub left: L,
    /// Element taken from the right sequence.
    pub right: R,
}

/// Outcome of [`join`]: the matching plus both sides' leftovers.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JoinResult<L, R> {
    /// Matched pairs, ordered by left index.
    pub pairs: Vec<Pair<L, R>>,
    /// Unmatched left elements, in input order.
    pub only_left: Vec<L>,
    /// Unmatched right elements, in input order.
    pub only_right: Vec<R>,
}

/// Pairs elements of `left` with elements of `right`, preferring lower
/// scores.
///
/// Admissible candidates are visited in ascending `(score, left index,
/// right index)` order and greedily matched, so ties always resolve to the
/// smallest left index and then the smallest right index. Each element is
/// used at most once.
#[must_use]
pub fn join<L, R, C, F>(left: Vec<L>, right: Vec<R>, score: F) -> JoinResult<L, R>
where
    C: Ord,
    F: Fn(&L, &R) -> Option<C>,
{
    let mut candidates = Vec::new();
    for (left_index, l) in left.iter().enumerate() {
        for (right_index, r) in right.iter().enumerate() {
            if let Some(cost) = score(l, r) {
                candidates.push((cost, left_index, right_index));
            }
        }
    }
    candidates.sort_unstable();

    let mut left_taken = vec![false; left.len()];
    let mut right_taken = vec![false; right.len()];
    let mut matched = Vec::new();
    for (_, left_index, right_index) in candidates {
        if !left_taken[left_index] && !right_taken[right_index] {
            left_taken[left_index] = true;
            right_taken[right_index] = true;
            matched.push((left_index, right_index));
        }
    }
    matched.sort_unstable();

    let mut left_slots: Vec<Option<L>> = left.into_iter().map(Some).collect();
    let mut right_slots: Vec<Option<R>> = right.into_iter().map(Some).collect();
    let mut pairs = Vec::with_capacity(matched.len());
    for (left_index, right_index) in matched {
        if let (Some(l), Some(r)) = (left_slots[left_index].take(), right_slots[right_index].take())
        {
            pairs.push(Pair { left: l, right: r });
        }
    }

    JoinResult {
        pairs,
        only_left: left_slots.into_iter().flatten().collect(),
        only_right: right_slots.into_iter().flatten().collect(),
    }
}

#[cfg(test)]
mod tests;
