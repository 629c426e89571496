// One-hot + min-max feature encoding. `FeatureEncoder::fit` builds the
// training matrix together with a `FittedSchema`; every later record goes
// through `FittedSchema::transform` and a `ColumnAligner` so its vector has
// exactly the training columns in the training order.
use std::collections::{BTreeMap, HashMap};

use clap::ValueEnum;
use ndarray::{Array1, Array2};
use tracing::{debug, warn};

use crate::error::{ForecastError, Result};

/// Read access to the named fields of a record being encoded.
pub trait FeatureSource {
    fn categorical(&self, column: &str) -> Option<&str>;
    fn numeric(&self, column: &str) -> Option<f64>;
}

/// What to do with a categorical value that never appeared during fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum UnknownCategoryPolicy {
    /// Fail the alignment.
    Error,
    /// Leave every indicator of that column at 0.
    #[default]
    ZeroFill,
    /// Use the closest known value: a case/whitespace-insensitive match if
    /// there is one, otherwise the column's most frequent training value.
    NearestFallback,
}

pub fn indicator_name(column: &str, value: &str) -> String {
    format!("{column}_{value}")
}

fn normalize(s: &str) -> String {
    s.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Min-max scaler over the numeric columns, fitted once on training data.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxScaler {
    min: Array1<f64>,
    max: Array1<f64>,
}

impl MinMaxScaler {
    /// Fits column-wise bounds over `data` (rows x numeric columns).
    pub fn fit(data: &Array2<f64>) -> Self {
        let k = data.ncols();
        let mut min = Array1::from_elem(k, f64::INFINITY);
        let mut max = Array1::from_elem(k, f64::NEG_INFINITY);
        for row in data.rows() {
            for (j, &v) in row.iter().enumerate() {
                min[j] = min[j].min(v);
                max[j] = max[j].max(v);
            }
        }
        MinMaxScaler { min, max }
    }

    /// Scales the `j`th numeric value. Values outside the fitted range are
    /// not clipped; a constant column maps to 0.
    pub fn scale(&self, j: usize, v: f64) -> f64 {
        let range = self.max[j] - self.min[j];
        if range > 0.0 {
            (v - self.min[j]) / range
        } else {
            0.0
        }
    }

    pub fn bounds(&self, j: usize) -> (f64, f64) {
        (self.min[j], self.max[j])
    }
}

/// Known values of one categorical column with their training frequency.
#[derive(Debug, Clone, PartialEq)]
pub struct CategoryLevels {
    column: String,
    counts: BTreeMap<String, usize>,
}

impl CategoryLevels {
    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.counts.keys().map(String::as_str)
    }

    /// Closest known value for an unseen one. Ties on frequency go to the
    /// lexically smallest value.
    pub fn nearest(&self, value: &str) -> Option<&str> {
        let wanted = normalize(value);
        if let Some(hit) = self.counts.keys().find(|known| normalize(known) == wanted) {
            return Some(hit.as_str());
        }
        let mut best: Option<(&str, usize)> = None;
        for (v, &n) in &self.counts {
            if best.map_or(true, |(_, m)| n > m) {
                best = Some((v.as_str(), n));
            }
        }
        best.map(|(v, _)| v)
    }
}

/// Column layout plus scaler established once from the training rows and
/// only read afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct FittedSchema {
    numeric: Vec<String>,
    levels: Vec<CategoryLevels>,
    columns: Vec<String>,
    index: HashMap<String, usize>,
    scaler: MinMaxScaler,
}

/// A record encoded against a schema before alignment: scaled numeric
/// values and the record's own categorical values.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRecord {
    pub numeric: Vec<(String, f64)>,
    pub categories: Vec<(String, String)>,
}

impl FittedSchema {
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn scaler(&self) -> &MinMaxScaler {
        &self.scaler
    }

    pub fn levels(&self, column: &str) -> Option<&CategoryLevels> {
        self.levels.iter().find(|l| l.column == column)
    }

    pub fn position(&self, column: &str) -> Option<usize> {
        self.index.get(column).copied()
    }

    /// Encodes a single record through the fitted scaler. Only the record's
    /// own categorical values are emitted; nothing is refitted.
    pub fn transform<R: FeatureSource>(&self, record: &R) -> Result<EncodedRecord> {
        let numeric = self
            .numeric
            .iter()
            .enumerate()
            .map(|(j, name)| {
                let raw = record
                    .numeric(name)
                    .ok_or_else(|| ForecastError::MissingColumn(name.clone()))?;
                Ok((name.clone(), self.scaler.scale(j, raw)))
            })
            .collect::<Result<Vec<_>>>()?;

        let categories = self
            .levels
            .iter()
            .map(|l| {
                let value = record
                    .categorical(&l.column)
                    .ok_or_else(|| ForecastError::MissingColumn(l.column.clone()))?;
                Ok((l.column.clone(), value.to_string()))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(EncodedRecord { numeric, categories })
    }

    /// `transform` followed by alignment under `policy`.
    pub fn encode<R: FeatureSource>(&self, record: &R, policy: UnknownCategoryPolicy) -> Result<Array1<f64>> {
        let encoded = self.transform(record)?;
        ColumnAligner::new(self, policy).align(&encoded)
    }
}

/// Builds the training matrix and its schema.
#[derive(Debug, Clone)]
pub struct FeatureEncoder {
    categorical: Vec<String>,
    numeric: Vec<String>,
}

impl FeatureEncoder {
    pub fn new(categorical: &[&str], numeric: &[&str]) -> Self {
        FeatureEncoder {
            categorical: categorical.iter().map(|s| s.to_string()).collect(),
            numeric: numeric.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Fit mode. Columns are the numeric ones first, then one indicator per
    /// distinct value of each categorical column (values in sorted order).
    pub fn fit<R: FeatureSource>(&self, rows: &[R]) -> Result<(Array2<f64>, FittedSchema)> {
        self.fit_with_levels(rows, rows)
    }

    /// Like `fit`, but the categorical levels come from `level_rows` while
    /// the scaler and the returned matrix use `rows` only. Every value in
    /// `rows` must also occur in `level_rows`.
    pub fn fit_with_levels<R: FeatureSource>(
        &self,
        rows: &[R],
        level_rows: &[R],
    ) -> Result<(Array2<f64>, FittedSchema)> {
        if rows.is_empty() {
            return Err(ForecastError::EmptyTrainingSet);
        }

        let mut raw = Array2::<f64>::zeros((rows.len(), self.numeric.len()));
        for (i, row) in rows.iter().enumerate() {
            for (j, name) in self.numeric.iter().enumerate() {
                raw[(i, j)] = row
                    .numeric(name)
                    .ok_or_else(|| ForecastError::MissingColumn(name.clone()))?;
            }
        }
        let scaler = MinMaxScaler::fit(&raw);

        let mut levels = Vec::with_capacity(self.categorical.len());
        for column in &self.categorical {
            let mut counts = BTreeMap::new();
            for row in level_rows {
                let value = row
                    .categorical(column)
                    .ok_or_else(|| ForecastError::MissingColumn(column.clone()))?;
                *counts.entry(value.to_string()).or_insert(0) += 1;
            }
            levels.push(CategoryLevels {
                column: column.clone(),
                counts,
            });
        }

        let mut columns = self.numeric.clone();
        for l in &levels {
            columns.extend(l.values().map(|v| indicator_name(&l.column, v)));
        }
        let index = columns.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect();

        let schema = FittedSchema {
            numeric: self.numeric.clone(),
            levels,
            columns,
            index,
            scaler,
        };

        let mut matrix = Array2::<f64>::zeros((rows.len(), schema.width()));
        for (i, row) in rows.iter().enumerate() {
            for j in 0..self.numeric.len() {
                matrix[(i, j)] = schema.scaler.scale(j, raw[(i, j)]);
            }
            for column in &self.categorical {
                let value = row
                    .categorical(column)
                    .ok_or_else(|| ForecastError::MissingColumn(column.clone()))?;
                let pos = schema
                    .position(&indicator_name(column, value))
                    .ok_or_else(|| ForecastError::UnknownCategory {
                        column: column.clone(),
                        value: value.to_string(),
                    })?;
                matrix[(i, pos)] = 1.0;
            }
        }

        debug!(rows = rows.len(), columns = schema.width(), "fitted feature schema");
        Ok((matrix, schema))
    }
}

/// Forces an encoded record onto the schema's columns and order.
pub struct ColumnAligner<'a> {
    schema: &'a FittedSchema,
    policy: UnknownCategoryPolicy,
}

impl<'a> ColumnAligner<'a> {
    pub fn new(schema: &'a FittedSchema, policy: UnknownCategoryPolicy) -> Self {
        ColumnAligner { schema, policy }
    }

    pub fn align(&self, encoded: &EncodedRecord) -> Result<Array1<f64>> {
        let mut out = Array1::<f64>::zeros(self.schema.width());

        for (name, v) in &encoded.numeric {
            let pos = self
                .schema
                .position(name)
                .ok_or_else(|| ForecastError::MissingColumn(name.clone()))?;
            out[pos] = *v;
        }

        for (column, value) in &encoded.categories {
            if let Some(pos) = self.schema.position(&indicator_name(column, value)) {
                out[pos] = 1.0;
                continue;
            }
            match self.policy {
                UnknownCategoryPolicy::ZeroFill => {
                    debug!(column = %column, value = %value, "unseen category left at zero");
                }
                UnknownCategoryPolicy::Error => {
                    return Err(ForecastError::UnknownCategory {
                        column: column.clone(),
                        value: value.clone(),
                    });
                }
                UnknownCategoryPolicy::NearestFallback => {
                    let substitute = self.schema.levels(column).and_then(|l| l.nearest(value));
                    match substitute.and_then(|s| self.schema.position(&indicator_name(column, s))) {
                        Some(pos) => {
                            warn!(column = %column, value = %value, substitute = ?substitute, "unseen category replaced");
                            out[pos] = 1.0;
                        }
                        None => {
                            debug!(column = %column, value = %value, "no fallback value, left at zero");
                        }
                    }
                }
            }
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Row {
        player: &'static str,
        venue: &'static str,
        inning: f64,
        avg: f64,
    }

    impl FeatureSource for Row {
        fn categorical(&self, column: &str) -> Option<&str> {
            match column {
                "batsman" => Some(self.player),
                "venue" => Some(self.venue),
                _ => None,
            }
        }

        fn numeric(&self, column: &str) -> Option<f64> {
            match column {
                "inning" => Some(self.inning),
                "career_avg" => Some(self.avg),
                _ => None,
            }
        }
    }

    fn row(player: &'static str, venue: &'static str, inning: f64, avg: f64) -> Row {
        Row { player, venue, inning, avg }
    }

    fn training() -> Vec<Row> {
        vec![
            row("Kohli", "Wankhede", 1.0, 30.0),
            row("Rohit", "Wankhede", 2.0, 20.0),
            row("Kohli", "Chepauk", 2.0, 30.0),
            row("Dhoni", "Wankhede", 1.0, 10.0),
        ]
    }

    fn encoder() -> FeatureEncoder {
        FeatureEncoder::new(&["batsman", "venue"], &["inning", "career_avg"])
    }

    #[test]
    fn fit_orders_numeric_then_sorted_indicators() {
        let (matrix, schema) = encoder().fit(&training()).unwrap();
        assert_eq!(
            schema.columns(),
            [
                "inning",
                "career_avg",
                "batsman_Dhoni",
                "batsman_Kohli",
                "batsman_Rohit",
                "venue_Chepauk",
                "venue_Wankhede"
            ]
        );
        assert_eq!(matrix.dim(), (4, 7));
        // Rohit, Wankhede, inning 2, avg 20
        assert_eq!(matrix.row(1).to_vec(), vec![1.0, 0.5, 0.0, 0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn fit_rejects_empty_table() {
        let rows: Vec<Row> = Vec::new();
        assert!(matches!(encoder().fit(&rows), Err(ForecastError::EmptyTrainingSet)));
    }

    #[test]
    fn training_rows_round_trip_through_transform_and_align() {
        let rows = training();
        let (matrix, schema) = encoder().fit(&rows).unwrap();
        for (i, r) in rows.iter().enumerate() {
            let v = schema.encode(r, UnknownCategoryPolicy::Error).unwrap();
            assert_eq!(v, matrix.row(i).to_owned());
        }
    }

    #[test]
    fn unseen_venue_keeps_schema_shape_with_zero_venue_columns() {
        let (_, schema) = encoder().fit(&training()).unwrap();
        let query = row("Kohli", "Eden Gardens", 1.0, 30.0);

        let encoded = schema.transform(&query).unwrap();
        let v = ColumnAligner::new(&schema, UnknownCategoryPolicy::ZeroFill)
            .align(&encoded)
            .unwrap();

        assert_eq!(v.len(), schema.width());
        for (name, value) in schema.columns().iter().zip(v.iter()) {
            if name.starts_with("venue_") {
                assert_eq!(*value, 0.0, "{name}");
            }
        }
        assert_eq!(v[schema.position("batsman_Kohli").unwrap()], 1.0);
    }

    #[test]
    fn query_with_subset_of_values_is_zero_padded() {
        let (_, schema) = encoder().fit(&training()).unwrap();
        let v = schema
            .encode(&row("Dhoni", "Chepauk", 2.0, 10.0), UnknownCategoryPolicy::Error)
            .unwrap();
        assert_eq!(v.to_vec(), vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn error_policy_rejects_unseen_value() {
        let (_, schema) = encoder().fit(&training()).unwrap();
        let err = schema
            .encode(&row("Gill", "Wankhede", 1.0, 0.0), UnknownCategoryPolicy::Error)
            .unwrap_err();
        match err {
            ForecastError::UnknownCategory { column, value } => {
                assert_eq!(column, "batsman");
                assert_eq!(value, "Gill");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn nearest_fallback_prefers_normalized_match_then_mode() {
        let (_, schema) = encoder().fit(&training()).unwrap();

        let v = schema
            .encode(&row("kohli ", "Eden Gardens", 1.0, 30.0), UnknownCategoryPolicy::NearestFallback)
            .unwrap();
        assert_eq!(v[schema.position("batsman_Kohli").unwrap()], 1.0);
        // Wankhede is the most common venue in training
        assert_eq!(v[schema.position("venue_Wankhede").unwrap()], 1.0);
        assert_eq!(v[schema.position("venue_Chepauk").unwrap()], 0.0);
    }

    #[test]
    fn mode_ties_go_to_smallest_value() {
        let (_, schema) = encoder().fit(&training()).unwrap();
        let levels = schema.levels("batsman").unwrap();
        // Kohli appears twice, the others once
        assert_eq!(levels.nearest("Gill"), Some("Kohli"));

        let tied = FeatureEncoder::new(&["batsman"], &["inning"])
            .fit(&[row("Rohit", "X", 1.0, 0.0), row("Dhoni", "X", 1.0, 0.0)])
            .unwrap()
            .1;
        assert_eq!(tied.levels("batsman").unwrap().nearest("Gill"), Some("Dhoni"));
    }

    #[test]
    fn scaler_is_not_refit_on_query() {
        let (_, schema) = encoder().fit(&training()).unwrap();
        let v = schema
            .encode(&row("Kohli", "Wankhede", 4.0, 40.0), UnknownCategoryPolicy::Error)
            .unwrap();
        assert_eq!(v[0], 3.0);
        assert!((v[1] - 1.5).abs() < 1e-12);
        assert_eq!(schema.scaler().bounds(1), (10.0, 30.0));
    }

    #[test]
    fn constant_numeric_column_scales_to_zero() {
        let rows = vec![row("Kohli", "Wankhede", 1.0, 5.0), row("Rohit", "Wankhede", 1.0, 7.0)];
        let (matrix, _) = encoder().fit(&rows).unwrap();
        assert_eq!(matrix.column(0).to_vec(), vec![0.0, 0.0]);
    }

    #[test]
    fn levels_can_come_from_a_wider_table_than_the_scaler() {
        let all = training();
        let fit_rows = vec![row("Kohli", "Wankhede", 1.0, 30.0), row("Rohit", "Wankhede", 2.0, 20.0)];
        let (matrix, schema) = encoder().fit_with_levels(&fit_rows, &all).unwrap();

        assert_eq!(matrix.dim(), (2, 7));
        assert!(schema.position("batsman_Dhoni").is_some());
        assert!(schema.position("venue_Chepauk").is_some());
        assert_eq!(schema.scaler().bounds(1), (20.0, 30.0));

        let v = schema
            .encode(&row("Dhoni", "Chepauk", 1.0, 10.0), UnknownCategoryPolicy::Error)
            .unwrap();
        assert_eq!(v[schema.position("batsman_Dhoni").unwrap()], 1.0);
    }

    #[test]
    fn fit_row_missing_from_level_table_is_rejected() {
        let levels = vec![row("Kohli", "Wankhede", 1.0, 30.0)];
        let rows = vec![row("Rohit", "Wankhede", 1.0, 20.0)];
        assert!(matches!(
            encoder().fit_with_levels(&rows, &levels),
            Err(ForecastError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn missing_field_is_reported() {
        let schema = FeatureEncoder::new(&["bowling_team"], &["inning"]).fit(&training());
        assert!(matches!(schema, Err(ForecastError::MissingColumn(c)) if c == "bowling_team"));
    }
}
