//! Keys of the sorted store.
//!
//! A [`Key`] is made of five components: row, column family, column
//! qualifier, visibility, and timestamp. Keys sort by the four byte-string
//! components in ascending order and then by timestamp in DESCENDING order,
//! so the newest version of a cell is always seen first.
//!
//! [`PartialKey`] names a prefix of those components. It is used to compute
//! the smallest key which sorts strictly after another one at a given depth,
//! which is how a scan re-anchors after the last key it emitted.
use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// The depth at which two keys are compared, or at which a following key is built
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum PartialKey {
	Row,
	RowColFam,
	RowColFamColQual,
	RowColFamColQualColVis,
	RowColFamColQualColVisTime,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Key {
	pub row: Vec<u8>,
	pub column_family: Vec<u8>,
	pub column_qualifier: Vec<u8>,
	pub visibility: Vec<u8>,
	pub timestamp: i64,
}

impl Key {
	pub fn new(
		row: impl Into<Vec<u8>>,
		column_family: impl Into<Vec<u8>>,
		column_qualifier: impl Into<Vec<u8>>,
		visibility: impl Into<Vec<u8>>,
		timestamp: i64,
	) -> Self {
		Self {
			row: row.into(),
			column_family: column_family.into(),
			column_qualifier: column_qualifier.into(),
			visibility: visibility.into(),
			timestamp,
		}
	}

	/// The smallest key within a row
	pub fn row(row: impl Into<Vec<u8>>) -> Self {
		Self::new(row, vec![], vec![], vec![], i64::MAX)
	}

	/// The smallest key within a column family of a row
	pub fn column(row: impl Into<Vec<u8>>, column_family: impl Into<Vec<u8>>) -> Self {
		Self::new(row, column_family, vec![], vec![], i64::MAX)
	}

	/// Compares two keys using only the components up to and including `part`
	pub fn compare_to(&self, other: &Key, part: PartialKey) -> Ordering {
		let ord = self.row.cmp(&other.row);
		if ord != Ordering::Equal || part == PartialKey::Row {
			return ord;
		}
		let ord = self.column_family.cmp(&other.column_family);
		if ord != Ordering::Equal || part == PartialKey::RowColFam {
			return ord;
		}
		let ord = self.column_qualifier.cmp(&other.column_qualifier);
		if ord != Ordering::Equal || part == PartialKey::RowColFamColQual {
			return ord;
		}
		let ord = self.visibility.cmp(&other.visibility);
		if ord != Ordering::Equal || part == PartialKey::RowColFamColQualColVis {
			return ord;
		}
		// Newer timestamps sort first
		other.timestamp.cmp(&self.timestamp)
	}

	/// Returns the smallest key which sorts strictly after every key sharing
	/// this key's components up to `part`.
	///
	/// At [`PartialKey::RowColFamColQualColVisTime`] this is the next possible
	/// version of the same cell, so the result is the immediate successor of
	/// this key in the store's ordering.
	pub fn following_key(&self, part: PartialKey) -> Key {
		match part {
			PartialKey::Row => Key::row(followed(&self.row)),
			PartialKey::RowColFam => Key::column(self.row.clone(), followed(&self.column_family)),
			PartialKey::RowColFamColQual => Key::new(
				self.row.clone(),
				self.column_family.clone(),
				followed(&self.column_qualifier),
				vec![],
				i64::MAX,
			),
			PartialKey::RowColFamColQualColVis => Key::new(
				self.row.clone(),
				self.column_family.clone(),
				self.column_qualifier.clone(),
				followed(&self.visibility),
				i64::MAX,
			),
			PartialKey::RowColFamColQualColVisTime => match self.timestamp {
				// There is no older version of this cell
				i64::MIN => self.following_key(PartialKey::RowColFamColQualColVis),
				ts => {
					let mut key = self.clone();
					key.timestamp = ts - 1;
					key
				}
			},
		}
	}
}

/// Appends a zero byte, giving the smallest byte string after `bytes`
fn followed(bytes: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(bytes.len() + 1);
	out.extend_from_slice(bytes);
	out.push(0x00);
	out
}

impl Ord for Key {
	fn cmp(&self, other: &Self) -> Ordering {
		self.compare_to(other, PartialKey::RowColFamColQualColVisTime)
	}
}

impl PartialOrd for Key {
	fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
		Some(self.cmp(other))
	}
}

impl fmt::Display for Key {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(
			f,
			"{} {}:{} [{}] {}",
			Printable(&self.row),
			Printable(&self.column_family),
			Printable(&self.column_qualifier),
			Printable(&self.visibility),
			self.timestamp
		)
	}
}

/// Renders a byte string as text, escaping any non-printable bytes
pub(crate) struct Printable<'a>(pub &'a [u8]);

impl fmt::Display for Printable<'_> {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		for &b in self.0 {
			if b.is_ascii_graphic() || b == b' ' {
				write!(f, "{}", b as char)?;
			} else {
				write!(f, "%{}", hex::encode([b]))?;
			}
		}
		Ok(())
	}
}
