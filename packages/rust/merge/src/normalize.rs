//! Name normalization.

/// Comparison key for a name: trimmed, full-width forms folded to ASCII,
/// whitespace runs collapsed to one space, lowercased.
///
/// `"  王林 "`, `"王林"` and `"Ｗang　Lin"`/`"wang lin"` pair up as expected.
pub fn normalize_name(name: &str) -> String {
    let folded: String = name.chars().map(to_half_width).collect();
    folded
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn to_half_width(c: char) -> char {
    match c {
        '\u{3000}' => ' ',
        '\u{FF01}'..='\u{FF5E}' => char::from_u32(c as u32 - 0xFEE0).unwrap_or(c),
        _ => c,
    }
}

/// Most frequent key of `counts`; ties go to the smallest key.
pub(crate) fn most_frequent<K: Ord + Clone>(
    counts: &std::collections::BTreeMap<K, usize>,
) -> Option<K> {
    counts
        .iter()
        .max_by(|(ka, a), (kb, b)| a.cmp(b).then_with(|| kb.cmp(ka)))
        .map(|(k, _)| k.clone())
}
