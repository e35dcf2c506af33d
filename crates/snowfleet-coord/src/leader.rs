use core::cmp::Ordering;

use crate::coordinator::node_name;

/// Parses the trailing decimal digits of a node name, if any.
pub fn sequence_suffix(name: &str) -> Option<u64> {
    let name = node_name(name);
    let digits = name
        .bytes()
        .rev()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

/// Leader ordering: numeric sequence suffix first, names without a suffix
/// after every suffixed name, ties broken lexicographically.
pub fn compare_sequence(a: &str, b: &str) -> Ordering {
    match (sequence_suffix(a), sequence_suffix(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Picks the slot leader: the child with the smallest sequence suffix.
pub fn slot_leader<S: AsRef<str>>(children: &[S]) -> Option<&S> {
    children
        .iter()
        .min_by(|a, b| compare_sequence(a.as_ref(), b.as_ref()))
}

/// Sorts children leader first.
pub fn sort_leader_first<S: AsRef<str>>(children: &mut [S]) {
    children.sort_by(|a, b| compare_sequence(a.as_ref(), b.as_ref()));
}
