use std::cmp::Ordering;
use std::fmt;

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::err::Error;
use crate::key::Key;

/// A scan interval over the store's key space.
///
/// A missing start or end key leaves that side of the range unbounded.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
	start: Option<Key>,
	start_inclusive: bool,
	end: Option<Key>,
	end_inclusive: bool,
}

impl KeyRange {
	pub fn new(
		start: Option<Key>,
		start_inclusive: bool,
		end: Option<Key>,
		end_inclusive: bool,
	) -> Result<Self> {
		if let (Some(s), Some(e)) = (&start, &end) {
			match s.cmp(e) {
				Ordering::Greater => {
					bail!(Error::InvalidRange(format!("start key {s} is after end key {e}")))
				}
				Ordering::Equal if !(start_inclusive && end_inclusive) => {
					bail!(Error::InvalidRange(format!("range around {s} is empty")))
				}
				_ => (),
			}
		}
		// Inclusivity is meaningless on an unbounded side
		Ok(Self {
			start_inclusive: start_inclusive || start.is_none(),
			start,
			end_inclusive: end_inclusive || end.is_none(),
			end,
		})
	}

	/// A range which covers the entire key space
	pub fn all() -> Self {
		Self {
			start: None,
			start_inclusive: true,
			end: None,
			end_inclusive: true,
		}
	}

	/// The rows from `start` up to but excluding `end`
	pub fn rows(start: impl Into<Vec<u8>>, end: impl Into<Vec<u8>>) -> Result<Self> {
		Self::new(Some(Key::row(start)), true, Some(Key::row(end)), false)
	}

	/// A range which covers exactly one row
	pub fn exact_row(row: impl Into<Vec<u8>>) -> Self {
		let start = Key::row(row);
		let end = start.following_key(crate::key::PartialKey::Row);
		Self {
			start: Some(start),
			start_inclusive: true,
			end: Some(end),
			end_inclusive: false,
		}
	}

	/// A range which covers exactly one record, stored as a column family of a row
	pub fn document(row: impl Into<Vec<u8>>, column_family: impl Into<Vec<u8>>) -> Self {
		let start = Key::column(row, column_family);
		let end = start.following_key(crate::key::PartialKey::RowColFam);
		Self {
			start: Some(start),
			start_inclusive: true,
			end: Some(end),
			end_inclusive: false,
		}
	}

	pub fn start(&self) -> Option<&Key> {
		self.start.as_ref()
	}

	pub fn end(&self) -> Option<&Key> {
		self.end.as_ref()
	}

	pub fn is_start_inclusive(&self) -> bool {
		self.start_inclusive
	}

	pub fn is_end_inclusive(&self) -> bool {
		self.end_inclusive
	}

	/// Whether the key sorts before the first key of this range
	pub fn before_start_key(&self, key: &Key) -> bool {
		match &self.start {
			None => false,
			Some(s) if self.start_inclusive => key < s,
			Some(s) => key <= s,
		}
	}

	/// Whether the key sorts after the last key of this range
	pub fn after_end_key(&self, key: &Key) -> bool {
		match &self.end {
			None => false,
			Some(e) if self.end_inclusive => key > e,
			Some(e) => key >= e,
		}
	}

	pub fn contains(&self, key: &Key) -> bool {
		!self.before_start_key(key) && !self.after_end_key(key)
	}
}

impl Ord for KeyRange {
	fn cmp(&self, other: &Self) -> Ordering {
		let ord = match (&self.start, &other.start) {
			(None, None) => Ordering::Equal,
			(None, Some(_)) => Ordering::Less,
			(Some(_), None) => Ordering::Greater,
			// An inclusive start sorts before an exclusive one
			(Some(a), Some(b)) => a.cmp(b).then(other.start_inclusive.cmp(&self.start_inclusive)),
		};
		if ord != Ordering::Equal {
			return ord;
		}
		match (&self.end, &other.end) {
			(None, None) => Ordering::Equal,
			(None, Some(_)) => Ordering::Greater,
			(Some(_), None) => Ordering::Less,
			// An exclusive end sorts before an inclusive one
			(Some(a), Some(b)) => a.cmp(b).then(self.end_inclusive.cmp(&other.end_inclusive)),
		}
	}
}

impl PartialOrd for KeyRange {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for KeyRange {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match &self.start {
			None => write!(f, "(-inf")?,
			Some(k) if self.start_inclusive => write!(f, "[{k}")?,
			Some(k) => write!(f, "({k}")?,
		}
		match &self.end {
			None => write!(f, ",+inf)"),
			Some(k) if self.end_inclusive => write!(f, ",{k}]"),
			Some(k) => write!(f, ",{k})"),
		}
	}
}
