//! Temperature-banded lookup tables.
//!
//! Rows are kept in ascending order of their upper temperature bound. A
//! target above every row saturates at the last (highest) row.

use serde::{Deserialize, Serialize};

use crate::error::{CryoError, CryoResult};

/// Proportional band, integral and derivative action times.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pid {
    /// Proportional band.
    pub p: f64,
    /// Integral action time (min).
    pub i: f64,
    /// Derivative action time (min).
    pub d: f64,
}

impl Pid {
    /// Builds a PID triple.
    pub const fn new(p: f64, i: f64, d: f64) -> Self {
        Self { p, i, d }
    }
}

/// One PID table row: `(upper bound, P, I, D)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PidRow {
    /// Highest temperature (K) the row applies to.
    pub upper: f64,
    /// Terms to use at or below `upper`.
    #[serde(flatten)]
    pub pid: Pid,
}

/// Outcome of a PID table lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PidLookup {
    /// Whether a row's upper bound covered the target.
    pub found: bool,
    /// Matching terms, or the highest row's terms when nothing matched.
    pub pid: Pid,
}

/// Ordered PID table for one thermal node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PidRow>", into = "Vec<PidRow>")]
pub struct PidTable {
    rows: Vec<PidRow>,
}

impl PidTable {
    /// Builds a table, sorting rows by upper bound. Empty tables are rejected.
    pub fn new(mut rows: Vec<PidRow>) -> CryoResult<Self> {
        if rows.is_empty() {
            return Err(CryoError::Configuration("PID table has no rows".into()));
        }
        rows.sort_by(|a, b| a.upper.total_cmp(&b.upper));
        Ok(Self { rows })
    }

    /// Builds a table from `(upper, p, i, d)` tuples.
    pub fn from_tuples(rows: &[(f64, f64, f64, f64)]) -> CryoResult<Self> {
        Self::new(
            rows.iter()
                .map(|&(upper, p, i, d)| PidRow { upper, pid: Pid::new(p, i, d) })
                .collect(),
        )
    }

    /// First row whose upper bound is at or above `target`.
    pub fn lookup(&self, target: f64) -> PidLookup {
        match self.rows.iter().find(|row| row.upper >= target) {
            Some(row) => PidLookup { found: true, pid: row.pid },
            None => PidLookup { found: false, pid: self.last().pid },
        }
    }

    fn last(&self) -> &PidRow {
        // non-empty by construction
        &self.rows[self.rows.len() - 1]
    }

    /// Rows in ascending order.
    pub fn rows(&self) -> &[PidRow] {
        &self.rows
    }
}

impl TryFrom<Vec<PidRow>> for PidTable {
    type Error = CryoError;

    fn try_from(rows: Vec<PidRow>) -> CryoResult<Self> {
        Self::new(rows)
    }
}

impl From<PidTable> for Vec<PidRow> {
    fn from(table: PidTable) -> Self {
        table.rows
    }
}

/// How a stability row's deviation is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviationKind {
    /// Deviation in kelvin.
    Value,
    /// Deviation as a fraction of the setpoint.
    Fraction,
}

/// One stability table row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityRow {
    /// Highest temperature (K) the row applies to.
    pub upper: f64,
    /// Allowed deviation from the setpoint.
    pub deviation: f64,
    /// Absolute or fractional.
    pub kind: DeviationKind,
}

/// Ordered table of allowed deviations used by run-to-temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<StabilityRow>", into = "Vec<StabilityRow>")]
pub struct StabilityTable {
    rows: Vec<StabilityRow>,
}

impl StabilityTable {
    /// Builds a table, sorting rows by upper bound. Empty tables are rejected.
    pub fn new(mut rows: Vec<StabilityRow>) -> CryoResult<Self> {
        if rows.is_empty() {
            return Err(CryoError::Configuration("stability table has no rows".into()));
        }
        rows.sort_by(|a, b| a.upper.total_cmp(&b.upper));
        Ok(Self { rows })
    }

    /// Allowed absolute deviation (K) around `target`.
    ///
    /// Uses the first (tightest) row covering the target and falls back to
    /// the highest row.
    pub fn allowed_deviation(&self, target: f64) -> f64 {
        let row = self
            .rows
            .iter()
            .find(|row| row.upper >= target)
            .unwrap_or(&self.rows[self.rows.len() - 1]);
        match row.kind {
            DeviationKind::Value => row.deviation,
            DeviationKind::Fraction => row.deviation * target,
        }
    }

    /// Rows in ascending order.
    pub fn rows(&self) -> &[StabilityRow] {
        &self.rows
    }
}

impl TryFrom<Vec<StabilityRow>> for StabilityTable {
    type Error = CryoError;

    fn try_from(rows: Vec<StabilityRow>) -> CryoResult<Self> {
        Self::new(rows)
    }
}

impl From<StabilityTable> for Vec<StabilityRow> {
    fn from(table: StabilityTable) -> Self {
        table.rows
    }
}
