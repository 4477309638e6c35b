//! Series selection lists read from CSV
//!
//! The `SeriesInstanceUID` column is located by header name, so any export of
//! the query output (or a hand-written sheet) can be used.

use std::collections::HashSet;
use std::io::Read;
use std::path::Path;

use crate::{Error, Result};

pub const SERIES_UID_COLUMN: &str = "SeriesInstanceUID";

/// Ordered, de-duplicated list of SeriesInstanceUIDs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeriesSelection {
    uids: Vec<String>,
    index: HashSet<String>,
}

impl SeriesSelection {
    pub fn from_uids<I, S>(uids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut selection = Self::default();
        for uid in uids {
            selection.push(uid.into());
        }
        selection
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut csv = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        let column = csv
            .headers()?
            .iter()
            .position(|header| header.trim_start_matches('\u{feff}') == SERIES_UID_COLUMN)
            .ok_or_else(|| {
                Error::Selection(format!("no '{}' column in the header row", SERIES_UID_COLUMN))
            })?;

        let mut selection = Self::default();
        for record in csv.records() {
            let record = record?;
            if let Some(uid) = record.get(column).filter(|uid| !uid.is_empty()) {
                selection.push(uid.to_string());
            }
        }
        Ok(selection)
    }

    /// Read a selection file; `-` reads standard input
    pub fn from_path(path: &Path) -> Result<Self> {
        if path == Path::new("-") {
            return Self::from_reader(std::io::stdin().lock());
        }
        let file = std::fs::File::open(path)
            .map_err(|e| Error::Selection(format!("{}: {}", path.display(), e)))?;
        Self::from_reader(file)
    }

    fn push(&mut self, uid: String) {
        if self.index.insert(uid.clone()) {
            self.uids.push(uid);
        }
    }

    pub fn uids(&self) -> &[String] {
        &self.uids
    }

    pub fn contains(&self, uid: &str) -> bool {
        self.index.contains(uid)
    }

    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }
}
