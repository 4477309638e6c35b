//! Read path over the catalog: date and pattern filters, CSV output

use regex::Regex;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::str::FromStr;

use crate::catalog::{CatalogStore, SeriesRecord};
use crate::{Error, Result};

/// A series column that can be searched and is written to the query CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    StudyDescription,
    SeriesDescription,
    PatientName,
    PatientId,
    StudyDate,
    SeriesInstanceUid,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::StudyDescription,
        Column::SeriesDescription,
        Column::PatientName,
        Column::PatientId,
        Column::StudyDate,
        Column::SeriesInstanceUid,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Column::StudyDescription => "StudyDescription",
            Column::SeriesDescription => "SeriesDescription",
            Column::PatientName => "PatientName",
            Column::PatientId => "PatientID",
            Column::StudyDate => "StudyDate",
            Column::SeriesInstanceUid => "SeriesInstanceUID",
        }
    }

    fn value(self, series: &SeriesRecord) -> &str {
        let value = match self {
            Column::StudyDescription => series.study_description.as_deref(),
            Column::SeriesDescription => series.series_description.as_deref(),
            Column::PatientName => series.patient_name.as_deref(),
            Column::PatientId => series.patient_id.as_deref(),
            Column::StudyDate => series.study_date.as_deref(),
            Column::SeriesInstanceUid => Some(series.series_instance_uid.as_str()),
        };
        value.unwrap_or("")
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Column {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim();
        Column::ALL
            .into_iter()
            .find(|column| column.name().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| {
                let known: Vec<_> = Column::ALL.iter().map(|c| c.name()).collect();
                Error::usage(format!("unknown column '{}' (expected one of {})", wanted, known.join(", ")))
            })
    }
}

/// Regular expression searched in any of a set of columns
#[derive(Debug, Clone)]
pub struct PatternFilter {
    pub columns: Vec<Column>,
    pub regex: Regex,
}

impl PatternFilter {
    /// An empty column list searches every column
    pub fn new(columns: Vec<Column>, pattern: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| Error::usage(format!("invalid pattern: {}", e)))?;
        let columns = if columns.is_empty() {
            Column::ALL.to_vec()
        } else {
            columns
        };
        Ok(Self { columns, regex })
    }

    fn matches(&self, series: &SeriesRecord) -> bool {
        self.columns
            .iter()
            .any(|column| self.regex.is_match(column.value(series)))
    }
}

/// Filters combined with AND; dates are YYYYMMDD and compared as strings
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub date: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    pub pattern: Option<PatternFilter>,
}

impl QueryFilter {
    /// Build a filter from command-line style options, validating dates and pattern
    pub fn from_options(
        date: Option<String>,
        start_date: Option<String>,
        end_date: Option<String>,
        targets: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<Self> {
        for value in [&date, &start_date, &end_date].into_iter().flatten() {
            validate_date(value)?;
        }

        let pattern = match (targets, pattern) {
            (_, Some(pattern)) => {
                let columns = targets
                    .map(|targets| {
                        targets
                            .split(',')
                            .filter(|t| !t.trim().is_empty())
                            .map(Column::from_str)
                            .collect::<Result<Vec<_>>>()
                    })
                    .transpose()?
                    .unwrap_or_default();
                Some(PatternFilter::new(columns, pattern)?)
            }
            (Some(_), None) => return Err(Error::usage("--targets requires --pattern")),
            (None, None) => None,
        };

        Ok(Self {
            date,
            start_date,
            end_date,
            pattern,
        })
    }

    fn has_date_filter(&self) -> bool {
        self.date.is_some() || self.start_date.is_some() || self.end_date.is_some()
    }

    pub fn matches(&self, series: &SeriesRecord) -> bool {
        if self.has_date_filter() {
            let Some(study_date) = series.study_date.as_deref() else {
                return false;
            };
            if self.date.as_deref().is_some_and(|date| study_date != date)
                || self.start_date.as_deref().is_some_and(|start| study_date < start)
                || self.end_date.as_deref().is_some_and(|end| study_date > end)
            {
                return false;
            }
        }
        self.pattern.as_ref().map_or(true, |pattern| pattern.matches(series))
    }
}

fn validate_date(value: &str) -> Result<()> {
    if value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()) {
        Ok(())
    } else {
        Err(Error::usage(format!("invalid date '{}': expected YYYYMMDD", value)))
    }
}

/// One output row; field order is the CSV column order
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SeriesRow {
    #[serde(rename = "StudyDescription")]
    pub study_description: String,
    #[serde(rename = "SeriesDescription")]
    pub series_description: String,
    #[serde(rename = "PatientName")]
    pub patient_name: String,
    #[serde(rename = "PatientID")]
    pub patient_id: String,
    #[serde(rename = "StudyDate")]
    pub study_date: String,
    #[serde(rename = "SeriesInstanceUID")]
    pub series_instance_uid: String,
}

impl From<&SeriesRecord> for SeriesRow {
    fn from(series: &SeriesRecord) -> Self {
        Self {
            study_description: Column::StudyDescription.value(series).to_string(),
            series_description: Column::SeriesDescription.value(series).to_string(),
            patient_name: Column::PatientName.value(series).to_string(),
            patient_id: Column::PatientId.value(series).to_string(),
            study_date: Column::StudyDate.value(series).to_string(),
            series_instance_uid: series.series_instance_uid.clone(),
        }
    }
}

/// Matching rows, de-duplicated and sorted
#[tracing::instrument(skip_all, fields(catalog = %catalog.path().display()))]
pub fn search(catalog: &CatalogStore, filter: &QueryFilter) -> Result<Vec<SeriesRow>> {
    let rows: BTreeSet<SeriesRow> = catalog
        .series()?
        .iter()
        .filter(|series| filter.matches(series))
        .map(SeriesRow::from)
        .collect();
    tracing::debug!("{} series matched", rows.len());
    Ok(rows.into_iter().collect())
}

/// Write rows as CSV with a header line
pub fn write_csv<W: Write>(rows: &[SeriesRow], writer: W) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    if rows.is_empty() {
        csv.write_record(Column::ALL.iter().map(|c| c.name()))?;
    }
    for row in rows {
        csv.serialize(row)?;
    }
    csv.flush()?;
    Ok(())
}
