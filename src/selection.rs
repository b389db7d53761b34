// Cut-style column range parsing ("1-3,5", "-2", "4-", "all")

use crate::ThreadSafeStdError;

/// Parses a cut-like 1-indexed column selection string into sorted 0-based
/// indices over `max_columns` columns.
///
/// Syntax: comma-separated single indices and inclusive `start-end` ranges
/// with `end > start`; a leading `-b` means `1-b`, a trailing `a-` means
/// `a-end`; `all` (case-insensitive) or a lone `-` selects every column;
/// whitespace is ignored. Range upper bounds are clamped to `max_columns`.
///
/// # Errors
///
/// Returns an error for characters outside digits, `,` and `-`, empty
/// entries, non-increasing ranges, single indices outside
/// `1..=max_columns`, or duplicated indices.
pub fn parse_column_ranges(
    selection: &str,
    max_columns: usize,
) -> Result<Vec<usize>, ThreadSafeStdError> {
    let compact: String = selection.split_whitespace().collect();

    if compact.eq_ignore_ascii_case("all") || compact == "-" {
        return Ok((0..max_columns).collect());
    }
    if compact.is_empty() {
        return Err("Empty column selection.".into());
    }

    if let Some(bad) = compact
        .chars()
        .find(|c| !c.is_ascii_digit() && *c != ',' && *c != '-')
    {
        return Err(format!(
            "Invalid column selection {:?}: only digits, ',' and '-' are allowed, found {:?}.",
            selection, bad
        )
        .into());
    }

    // Open-ended forms: "a-" runs to the last column, "-b" starts at the first.
    let mut normalized = compact;
    if normalized.ends_with('-') {
        normalized.push_str(&max_columns.to_string());
    } else if normalized.starts_with('-') {
        normalized.insert(0, '1');
    }

    let mut selected = Vec::new();
    for entry in normalized.split(',') {
        if entry.is_empty() {
            return Err(format!("Invalid column selection {:?}: empty entry.", selection).into());
        }
        if let Some((start_str, end_str)) = entry.split_once('-') {
            let start: usize = start_str
                .parse()
                .map_err(|_| format!("Invalid range start {:?} in {:?}.", start_str, selection))?;
            let end: usize = end_str
                .parse()
                .map_err(|_| format!("Invalid range end {:?} in {:?}.", end_str, selection))?;
            if start == 0 {
                return Err(format!("Column indices are 1-based, got 0 in {:?}.", selection).into());
            }
            if end <= start {
                return Err(format!(
                    "Range {}-{} in {:?} must be increasing.",
                    start, end, selection
                )
                .into());
            }
            selected.extend(start..=end.min(max_columns));
        } else {
            let index: usize = entry
                .parse()
                .map_err(|_| format!("Invalid column index {:?} in {:?}.", entry, selection))?;
            if index == 0 || index > max_columns {
                return Err(format!(
                    "Column index {} in {:?} is out of range 1..={}.",
                    index, selection, max_columns
                )
                .into());
            }
            selected.push(index);
        }
    }

    let mut deduplicated = selected.clone();
    deduplicated.sort_unstable();
    deduplicated.dedup();
    if deduplicated.len() != selected.len() {
        return Err(format!("Duplicated columns in selection {:?}.", selection).into());
    }

    Ok(deduplicated.into_iter().map(|i| i - 1).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_singles_and_ranges() {
        assert_eq!(parse_column_ranges("1-3,5", 6).unwrap(), vec![0, 1, 2, 4]);
        assert_eq!(parse_column_ranges("2,4,6-7", 8).unwrap(), vec![1, 3, 5, 6]);
    }

    #[test]
    fn all_selects_every_column() {
        assert_eq!(parse_column_ranges("all", 6).unwrap(), vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(parse_column_ranges("ALL", 3).unwrap(), vec![0, 1, 2]);
        assert_eq!(parse_column_ranges("-", 3).unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn open_ended_ranges() {
        assert_eq!(parse_column_ranges("-2", 6).unwrap(), vec![0, 1]);
        assert_eq!(parse_column_ranges("4-", 6).unwrap(), vec![3, 4, 5]);
    }

    #[test]
    fn whitespace_is_ignored() {
        assert_eq!(parse_column_ranges(" 1 - 3 , 5 ", 6).unwrap(), vec![0, 1, 2, 4]);
    }

    #[test]
    fn range_end_is_clamped_to_column_count() {
        assert_eq!(parse_column_ranges("3-9", 6).unwrap(), vec![2, 3, 4, 5]);
    }

    #[test]
    fn invalid_characters_are_rejected() {
        assert!(parse_column_ranges("1;3", 6).is_err());
        assert!(parse_column_ranges("1.5", 6).is_err());
        assert!(parse_column_ranges("a-b", 6).is_err());
    }

    #[test]
    fn non_increasing_ranges_are_rejected() {
        assert!(parse_column_ranges("3-2", 6).is_err());
        assert!(parse_column_ranges("3-3", 6).is_err());
    }

    #[test]
    fn duplicates_are_rejected() {
        assert!(parse_column_ranges("2,2", 6).is_err());
        assert!(parse_column_ranges("1-3,2", 6).is_err());
    }

    #[test]
    fn out_of_range_single_index_is_rejected() {
        assert!(parse_column_ranges("9", 6).is_err());
        assert!(parse_column_ranges("0", 6).is_err());
    }

    #[test]
    fn empty_and_malformed_entries_are_rejected() {
        assert!(parse_column_ranges("", 6).is_err());
        assert!(parse_column_ranges("1,,3", 6).is_err());
        assert!(parse_column_ranges("1-2-3", 6).is_err());
    }
}
