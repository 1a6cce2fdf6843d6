//! Predicates which tell single-record ranges apart from row or shard spans.
use crate::kvs::KeyRange;

/// Whether a range is delimited around exactly one record.
///
/// A record is stored as one column family of one row, so a single-record
/// range starts within `(row, cf)` and ends at the smallest key of the next
/// column family, `(row, cf\0)`. Continuations of such a range keep the same
/// end, and so are classified the same way.
pub fn is_single_record_range(range: &KeyRange) -> bool {
	let (Some(start), Some(end)) = (range.start(), range.end()) else {
		return false;
	};
	if start.row != end.row || start.column_family.is_empty() {
		return false;
	}
	if !end.column_qualifier.is_empty() || !end.visibility.is_empty() {
		return false;
	}
	match end.column_family.split_last() {
		Some((0x00, family)) => family == start.column_family.as_slice(),
		_ => false,
	}
}

/// Whether every range is a single-record range. An empty set qualifies.
pub fn all_single_record<'a>(ranges: impl IntoIterator<Item = &'a KeyRange>) -> bool {
	ranges.into_iter().all(is_single_record_range)
}
