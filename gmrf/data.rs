//! # Observation Table and Data Loading
//!
//! The engine consumes a flat table of `(site, time, observed, covariate)`
//! records. This module validates that table against a grid, groups the
//! records by site once (a counting sort into contiguous per-site runs), and
//! reads the table from a tab-separated file.
//!
//! - Strict Schema: the TSV columns are `site`, `time`, `observed` and
//!   `covariate`. `site` is 1-based in files, following the external
//!   convention `site = (j-1)*rows + i`; in memory every index is zero-based.
//! - Errors are assumed to be user-input errors and carry the offending
//!   record number.

use crate::grid::Grid;
use ahash::AHashSet;
use itertools::izip;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// One record of the panel: a value observed at a site and period.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    /// Zero-based site index.
    pub site: usize,
    pub time: i64,
    pub observed: f64,
    pub covariate: f64,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("The observation table is empty.")]
    EmptyTable,
    #[error("Record {record} references site {site}, but the grid only has {site_count} sites.")]
    SiteOutOfRange {
        record: usize,
        site: usize,
        site_count: usize,
    },
    #[error("Record {record} has a non-finite '{column}' value.")]
    NonFiniteValue { record: usize, column: &'static str },
    #[error("Site {site} has more than one record for time {time}.")]
    DuplicateRecord { site: usize, time: i64 },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationTable {
    records: Vec<Observation>,
}

impl ObservationTable {
    pub fn new(records: Vec<Observation>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Observation] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Observation> {
        self.records.iter()
    }

    /// A copy of the table without the records for which `drop` is true.
    pub fn filtered<F>(&self, mut drop: F) -> Self
    where
        F: FnMut(&Observation) -> bool,
    {
        Self::new(self.records.iter().copied().filter(|r| !drop(r)).collect())
    }
}

impl FromIterator<Observation> for ObservationTable {
    fn from_iter<I: IntoIterator<Item = Observation>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// Records grouped by site, stored as contiguous runs.
///
/// `observed[offsets[s]..offsets[s + 1]]` (and likewise `covariate`) holds
/// the records of site `s`, in their original relative order.
#[derive(Debug, Clone)]
pub struct GroupedObservations {
    offsets: Vec<usize>,
    observed: Vec<f64>,
    covariate: Vec<f64>,
    distinct_times: usize,
}

impl GroupedObservations {
    /// Validates `table` against `grid` and groups it by site.
    pub fn new(table: &ObservationTable, grid: &Grid) -> Result<Self, DataError> {
        if table.is_empty() {
            return Err(DataError::EmptyTable);
        }
        let site_count = grid.site_count();
        let mut seen: AHashSet<(usize, i64)> = AHashSet::with_capacity(table.len());
        let mut times: AHashSet<i64> = AHashSet::new();
        let mut counts = vec![0usize; site_count];

        for (record, obs) in table.iter().enumerate() {
            if obs.site >= site_count {
                return Err(DataError::SiteOutOfRange {
                    record,
                    site: obs.site,
                    site_count,
                });
            }
            if !obs.observed.is_finite() {
                return Err(DataError::NonFiniteValue {
                    record,
                    column: "observed",
                });
            }
            if !obs.covariate.is_finite() {
                return Err(DataError::NonFiniteValue {
                    record,
                    column: "covariate",
                });
            }
            if !seen.insert((obs.site, obs.time)) {
                return Err(DataError::DuplicateRecord {
                    site: obs.site,
                    time: obs.time,
                });
            }
            times.insert(obs.time);
            counts[obs.site] += 1;
        }

        let mut offsets = Vec::with_capacity(site_count + 1);
        offsets.push(0);
        for count in &counts {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + count);
        }

        let mut cursor = offsets[..site_count].to_vec();
        let mut observed = vec![0.0; table.len()];
        let mut covariate = vec![0.0; table.len()];
        for obs in table.iter() {
            let slot = cursor[obs.site];
            observed[slot] = obs.observed;
            covariate[slot] = obs.covariate;
            cursor[obs.site] += 1;
        }

        Ok(Self {
            offsets,
            observed,
            covariate,
            distinct_times: times.len(),
        })
    }

    #[inline]
    pub fn site_count(&self) -> usize {
        self.offsets.len() - 1
    }

    #[inline]
    pub fn record_count(&self, site: usize) -> usize {
        self.offsets[site + 1] - self.offsets[site]
    }

    /// `(observed, covariate)` slices of one site.
    #[inline]
    pub fn site_records(&self, site: usize) -> (&[f64], &[f64]) {
        let range = self.offsets[site]..self.offsets[site + 1];
        (&self.observed[range.clone()], &self.covariate[range])
    }

    /// Sites without any record; their estimates are driven by the prior alone.
    pub fn empty_sites(&self) -> Vec<usize> {
        (0..self.site_count())
            .filter(|&site| self.record_count(site) == 0)
            .collect()
    }

    /// True when every site carries a record for every period present in the table.
    pub fn is_complete_panel(&self) -> bool {
        (0..self.site_count()).all(|site| self.record_count(site) == self.distinct_times)
    }

    pub fn distinct_times(&self) -> usize {
        self.distinct_times
    }
}

/// Failures while reading an observation file.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input file. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error("Missing or null values were found in the required column '{0}'.")]
    MissingValuesFound(String),
    #[error("Non-finite values (NaN or Infinity) were found in the required column '{0}'.")]
    NonFiniteValuesFound(String),
    #[error("Row {row}: column '{column}' must hold whole numbers, found {value}.")]
    NonIntegerValue {
        row: usize,
        column: &'static str,
        value: f64,
    },
    #[error("Row {row}: site {site} is outside the 1-based range 1..={site_count}.")]
    SiteOutOfGrid {
        row: usize,
        site: i64,
        site_count: usize,
    },
}

const REQUIRED_COLUMNS: [&str; 4] = ["site", "time", "observed", "covariate"];

/// Loads a tab-separated observation file with `site`, `time`, `observed`
/// and `covariate` columns and maps its 1-based sites onto `grid`.
pub fn load_observations(path: &Path, grid: &Grid) -> Result<ObservationTable, LoadError> {
    log::info!("Loading observations from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(b'\t')),
        )
        .finish()?;

    let columns_set: HashSet<String> = df
        .get_column_names()
        .into_iter()
        .map(|s| s.to_string())
        .collect();
    for col_name in REQUIRED_COLUMNS {
        if !columns_set.contains(col_name) {
            return Err(LoadError::ColumnNotFound(col_name.to_string()));
        }
    }

    let sites = extract_numeric_column(&df, "site")?;
    let times = extract_numeric_column(&df, "time")?;
    let observed = extract_numeric_column(&df, "observed")?;
    let covariate = extract_numeric_column(&df, "covariate")?;

    let mut records = Vec::with_capacity(df.height());
    for (row, (site, time, observed, covariate)) in
        izip!(sites, times, observed, covariate).enumerate()
    {
        let external_site = whole_number(site, row, "site")?;
        let site = grid
            .site_from_external(external_site)
            .ok_or(LoadError::SiteOutOfGrid {
                row: row + 1,
                site: external_site,
                site_count: grid.site_count(),
            })?;
        records.push(Observation {
            site,
            time: whole_number(time, row, "time")?,
            observed,
            covariate,
        });
    }

    log::info!(
        "Loaded {} records for a {}x{} grid",
        records.len(),
        grid.rows(),
        grid.cols()
    );
    Ok(ObservationTable::new(records))
}

fn whole_number(value: f64, row: usize, column: &'static str) -> Result<i64, LoadError> {
    if value.fract() != 0.0 || value.abs() > i64::MAX as f64 {
        return Err(LoadError::NonIntegerValue {
            row: row + 1,
            column,
            value,
        });
    }
    Ok(value as i64)
}

fn extract_numeric_column(df: &DataFrame, column_name: &str) -> Result<Vec<f64>, LoadError> {
    let series = df.column(column_name)?;
    if series.null_count() > 0 {
        return Err(LoadError::MissingValuesFound(column_name.to_string()));
    }

    let casted = match series.cast(&DataType::Float64) {
        Ok(casted) => casted,
        Err(_) => {
            return Err(LoadError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }
    };

    if casted.null_count() > 0 {
        return Err(LoadError::ColumnWrongType {
            column_name: column_name.to_string(),
            expected_type: "f64 (numeric)",
            found_type: format!("{:?}", series.dtype()),
        });
    }

    let chunked = casted.f64()?.rechunk();
    let values: Vec<f64> = chunked.into_no_null_iter().collect();
    if values.iter().any(|v| !v.is_finite()) {
        return Err(LoadError::NonFiniteValuesFound(column_name.to_string()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn obs(site: usize, time: i64, observed: f64, covariate: f64) -> Observation {
        Observation {
            site,
            time,
            observed,
            covariate,
        }
    }

    #[test]
    fn grouping_preserves_per_site_order() {
        let grid = Grid::new(2, 2).unwrap();
        let table = ObservationTable::new(vec![
            obs(2, 1, 1.0, 10.0),
            obs(0, 1, 2.0, 20.0),
            obs(2, 2, 3.0, 30.0),
            obs(1, 1, 4.0, 40.0),
        ]);
        let grouped = GroupedObservations::new(&table, &grid).unwrap();
        assert_eq!(grouped.site_count(), 4);
        assert_eq!(grouped.site_records(2), (&[1.0, 3.0][..], &[10.0, 30.0][..]));
        assert_eq!(grouped.site_records(0), (&[2.0][..], &[20.0][..]));
        assert_eq!(grouped.record_count(3), 0);
        assert_eq!(grouped.empty_sites(), vec![3]);
        assert_eq!(grouped.distinct_times(), 2);
        assert!(!grouped.is_complete_panel());
    }

    #[test]
    fn complete_panel_is_detected() {
        let grid = Grid::new(2, 2).unwrap();
        let table: ObservationTable = (0..4)
            .flat_map(|site| (0..3).map(move |t| obs(site, t, 0.0, 0.0)))
            .collect();
        let grouped = GroupedObservations::new(&table, &grid).unwrap();
        assert!(grouped.is_complete_panel());
        assert!(grouped.empty_sites().is_empty());
    }

    #[test]
    fn invalid_records_are_rejected() {
        let grid = Grid::new(2, 2).unwrap();
        assert_eq!(
            GroupedObservations::new(&ObservationTable::default(), &grid).err(),
            Some(DataError::EmptyTable)
        );

        let out_of_range = ObservationTable::new(vec![obs(0, 0, 1.0, 1.0), obs(4, 0, 1.0, 1.0)]);
        assert_eq!(
            GroupedObservations::new(&out_of_range, &grid).err(),
            Some(DataError::SiteOutOfRange {
                record: 1,
                site: 4,
                site_count: 4
            })
        );

        let nan = ObservationTable::new(vec![obs(0, 0, f64::NAN, 1.0)]);
        assert_eq!(
            GroupedObservations::new(&nan, &grid).err(),
            Some(DataError::NonFiniteValue {
                record: 0,
                column: "observed"
            })
        );

        let duplicate = ObservationTable::new(vec![obs(1, 5, 1.0, 1.0), obs(1, 5, 2.0, 1.0)]);
        assert_eq!(
            GroupedObservations::new(&duplicate, &grid).err(),
            Some(DataError::DuplicateRecord { site: 1, time: 5 })
        );
    }

    #[test]
    fn filtered_drops_matching_records() {
        let table = ObservationTable::new(vec![obs(0, 1, 1.0, 1.0), obs(0, 2, 1.0, 1.0)]);
        let kept = table.filtered(|r| r.time == 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.records()[0].time, 2);
    }

    #[test]
    fn tsv_loader_maps_one_based_sites() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("obs.tsv");
        fs::write(
            &path,
            "site\ttime\tobserved\tcovariate\n1\t2001\t0.5\t0.0\n4\t2001\t2.5\t1.0\n",
        )
        .unwrap();
        let grid = Grid::new(2, 2).unwrap();
        let table = load_observations(&path, &grid).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.records()[0], obs(0, 2001, 0.5, 0.0));
        assert_eq!(table.records()[1], obs(3, 2001, 2.5, 1.0));
    }

    #[test]
    fn tsv_loader_reports_schema_problems() {
        let dir = tempdir().unwrap();
        let grid = Grid::new(2, 2).unwrap();

        let missing = dir.path().join("missing.tsv");
        fs::write(&missing, "site\ttime\tobserved\n1\t1\t0.5\n").unwrap();
        assert!(matches!(
            load_observations(&missing, &grid),
            Err(LoadError::ColumnNotFound(name)) if name == "covariate"
        ));

        let outside = dir.path().join("outside.tsv");
        fs::write(
            &outside,
            "site\ttime\tobserved\tcovariate\n5\t1\t0.5\t1.0\n",
        )
        .unwrap();
        assert!(matches!(
            load_observations(&outside, &grid),
            Err(LoadError::SiteOutOfGrid { row: 1, site: 5, site_count: 4 })
        ));

        let fractional = dir.path().join("fractional.tsv");
        fs::write(
            &fractional,
            "site\ttime\tobserved\tcovariate\n1.5\t1\t0.5\t1.0\n",
        )
        .unwrap();
        assert!(matches!(
            load_observations(&fractional, &grid),
            Err(LoadError::NonIntegerValue { column: "site", .. })
        ));
    }
}
