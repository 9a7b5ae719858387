//! Watermark resolution against the reference table
//!
//! Finds the first ordered-column value touched by rows updated after the
//! prior watermark (the prune boundary), the distinct value just below it
//! (the fallback continuation point) and the latest update value overall
//! (the watermark to persist once the cycle succeeds).

use crate::config::{DatasourceConfig, GlobalParameters};
use crate::db::SourceDatabase;
use crate::error::Result;
use crate::literal::{ColumnType, Quoting, ScalarValue};
use crate::watermark::WatermarkLiteral;
use tracing::{debug, info};

/// Continuation point below the boundary, if the reference table has one
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviousBoundary {
    Value(ScalarValue),
    NoLowerBound,
}

impl PreviousBoundary {
    pub fn value(&self) -> Option<&ScalarValue> {
        match self {
            PreviousBoundary::Value(value) => Some(value),
            PreviousBoundary::NoLowerBound => None,
        }
    }

    /// SQL rendering; the sentinel is `''` for quoted types and `numeric_lower_bound` otherwise.
    pub fn sql_literal(&self, column_type: ColumnType, numeric_lower_bound: i64) -> String {
        match self {
            PreviousBoundary::Value(value) => value.sql_literal(),
            PreviousBoundary::NoLowerBound => match column_type.quoting() {
                Quoting::Quoted => "''".to_string(),
                Quoting::Unquoted => numeric_lower_bound.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryResult {
    /// First ordered-column value with new data; `None` means nothing to do
    pub new_boundary: Option<ScalarValue>,
    pub previous_boundary: PreviousBoundary,
    /// Latest update value in the whole reference table
    pub completion_watermark: Option<ScalarValue>,
}

impl BoundaryResult {
    pub fn has_new_data(&self) -> bool {
        self.new_boundary.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct WatermarkResolver {
    reference_table: String,
    ordered_column: String,
    update_column: String,
    numeric_lower_bound: i64,
}

impl WatermarkResolver {
    pub fn new(
        reference_table: impl Into<String>,
        ordered_column: impl Into<String>,
        update_column: impl Into<String>,
    ) -> Self {
        Self {
            reference_table: reference_table.into(),
            ordered_column: ordered_column.into(),
            update_column: update_column.into(),
            numeric_lower_bound: i64::MIN,
        }
    }

    pub fn for_datasource(datasource: &DatasourceConfig, parameters: &GlobalParameters) -> Self {
        Self::new(
            &datasource.reference_table,
            &datasource.functional_ordered_column,
            &parameters.update_datetime_column,
        )
        .with_numeric_lower_bound(parameters.numeric_lower_bound)
    }

    pub fn with_numeric_lower_bound(mut self, numeric_lower_bound: i64) -> Self {
        self.numeric_lower_bound = numeric_lower_bound;
        self
    }

    /// SQL rendering of the continuation point below the boundary, `None` without new data.
    pub fn previous_literal(&self, result: &BoundaryResult) -> Option<String> {
        result.new_boundary.as_ref().map(|boundary| {
            result
                .previous_boundary
                .sql_literal(boundary.column_type(), self.numeric_lower_bound)
        })
    }

    pub fn boundary_sql(&self, prior: &WatermarkLiteral) -> String {
        format!(
            "SELECT min({}) FROM {} WHERE {} > {}",
            self.ordered_column,
            self.reference_table,
            self.update_column,
            prior.as_sql()
        )
    }

    pub fn previous_sql(&self, boundary: &ScalarValue) -> String {
        format!(
            "SELECT max({}) FROM {} WHERE {} < {}",
            self.ordered_column,
            self.reference_table,
            self.ordered_column,
            boundary.sql_literal()
        )
    }

    pub fn completion_sql(&self) -> String {
        format!("SELECT max({}) FROM {}", self.update_column, self.reference_table)
    }

    pub async fn resolve(
        &self,
        db: &mut dyn SourceDatabase,
        prior: &WatermarkLiteral,
    ) -> Result<BoundaryResult> {
        let new_boundary = db.query(&self.boundary_sql(prior)).await?.scalar();

        let previous_boundary = match &new_boundary {
            Some(boundary) => {
                match db.query(&self.previous_sql(boundary)).await?.scalar() {
                    // the boundary's type is authoritative for the whole ordered column
                    Some(previous) => PreviousBoundary::Value(ScalarValue::new(
                        previous.raw(),
                        boundary.column_type(),
                    )),
                    None => PreviousBoundary::NoLowerBound,
                }
            }
            None => PreviousBoundary::NoLowerBound,
        };

        let completion_watermark = db.query(&self.completion_sql()).await?.scalar();

        let result = BoundaryResult {
            new_boundary,
            previous_boundary,
            completion_watermark,
        };

        match (&result.new_boundary, self.previous_literal(&result)) {
            (Some(boundary), Some(previous)) => info!(
                table = %self.reference_table,
                boundary = %boundary,
                previous = %previous,
                "resolved incremental window"
            ),
            _ => debug!(table = %self.reference_table, prior = %prior, "no rows past the prior watermark"),
        }

        Ok(result)
    }
}
