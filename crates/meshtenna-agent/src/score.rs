//! Antenna and location scoring.
//!
//! A score is a min-max normalization of an average metric onto 1..=10,
//! rounded to one decimal. RSSI compares antennas within a location; SNR
//! compares locations against each other, so its range is always taken
//! over every stored sample.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use meshtenna_common::models::{AntennaScore, LocationScore};

use crate::persistence::PersistenceQueue;
use crate::samples;
use crate::storage::{Query, Storage, Value};

pub const MIN_SCORE: f64 = 1.0;
pub const MAX_SCORE: f64 = 10.0;
/// Score when every sample in range has the same value.
pub const DEGENERATE_SCORE: f64 = 5.0;

/// RSSI range assumed when the scope has no samples.
pub const RSSI_FLOOR_DBM: f64 = -120.0;
pub const RSSI_CEILING_DBM: f64 = 0.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Rssi,
    Snr,
}

impl Metric {
    fn column(self) -> &'static str {
        match self {
            Metric::Rssi => "rssi",
            Metric::Snr => "snr",
        }
    }
}

/// Which samples an aggregate covers. `None` means "any".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scope<'a> {
    pub antenna: Option<&'a str>,
    pub location: Option<&'a str>,
}

impl<'a> Scope<'a> {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn location(location: Option<&'a str>) -> Self {
        Self {
            antenna: None,
            location,
        }
    }

    pub fn antenna_at(antenna: &'a str, location: Option<&'a str>) -> Self {
        Self {
            antenna: Some(antenna),
            location,
        }
    }

    fn filter(&self, sql: String) -> Query {
        let mut sql = sql;
        let mut params = Vec::new();
        if let Some(antenna) = self.antenna {
            sql.push_str(" AND antenna_name = ?");
            params.push(Value::from(antenna));
        }
        if let Some(location) = self.location {
            sql.push_str(" AND location = ?");
            params.push(Value::from(location));
        }
        Query { sql, params }
    }
}

/// Average and range a score is computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreAggregate {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreAggregate {
    pub fn score(&self) -> f64 {
        normalize(self.avg, self.min, self.max)
    }
}

/// Arithmetic mean, or 0 for no values.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Map `avg` from `min..=max` onto the 1..=10 score scale.
pub fn normalize(avg: f64, min: f64, max: f64) -> f64 {
    if max == min {
        return DEGENERATE_SCORE;
    }
    let raw = (avg - min) / (max - min) * 9.0 + 1.0;
    round1(raw).clamp(MIN_SCORE, MAX_SCORE)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    Name,
    Metric,
    #[default]
    Score,
}

impl std::str::FromStr for SortKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" | "antenna_name" | "location_name" => Ok(SortKey::Name),
            "metric" | "rssi" | "snr" => Ok(SortKey::Metric),
            "score" => Ok(SortKey::Score),
            other => Err(format!("unknown sort column: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortOrder {
    pub key: SortKey,
    pub descending: bool,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            key: SortKey::Score,
            descending: true,
        }
    }
}

impl SortOrder {
    fn apply(&self, ordering: Ordering) -> Ordering {
        if self.descending {
            ordering.reverse()
        } else {
            ordering
        }
    }

    pub fn sort_antennas(&self, rows: &mut [AntennaScore]) {
        rows.sort_by(|a, b| {
            self.apply(match self.key {
                SortKey::Name => a.antenna_name.cmp(&b.antenna_name),
                SortKey::Metric => a.avg_rssi.total_cmp(&b.avg_rssi),
                SortKey::Score => a.score.total_cmp(&b.score),
            })
        });
    }

    pub fn sort_locations(&self, rows: &mut [LocationScore]) {
        rows.sort_by(|a, b| {
            self.apply(match self.key {
                SortKey::Name => a.location.cmp(&b.location),
                SortKey::Metric => a.avg_snr.total_cmp(&b.avg_snr),
                SortKey::Score => a.score.total_cmp(&b.score),
            })
        });
    }
}

/// Computes scores from stored samples.
pub struct ScoreEngine<S> {
    queue: PersistenceQueue<S>,
}

impl<S: Storage> ScoreEngine<S> {
    pub fn new(queue: PersistenceQueue<S>) -> Self {
        Self { queue }
    }

    /// Mean of `metric` over the scope; 0 when nothing matches.
    pub async fn avg(&self, metric: Metric, scope: Scope<'_>) -> f64 {
        let query = scope.filter(format!(
            "SELECT {col} FROM results WHERE {col} IS NOT NULL",
            col = metric.column()
        ));
        let values: Vec<f64> = self
            .queue
            .read_all(query)
            .await
            .into_iter()
            .filter_map(|row| row.first().and_then(Value::as_f64))
            .collect();
        mean(&values)
    }

    /// Minimum and maximum of `metric` over the scope, if any samples exist.
    pub async fn range(&self, metric: Metric, scope: Scope<'_>) -> Option<(f64, f64)> {
        let query = scope.filter(format!(
            "SELECT MIN({col}), MAX({col}) FROM results WHERE 1=1",
            col = metric.column()
        ));
        let row = self.queue.read_one(query).await?;
        let min = row.first().and_then(Value::as_f64)?;
        let max = row.get(1).and_then(Value::as_f64)?;
        Some((min, max))
    }

    /// RSSI of one antenna, ranged against every antenna at the same
    /// location (or all locations when unfiltered).
    pub async fn rssi_aggregate(&self, antenna: &str, location: Option<&str>) -> ScoreAggregate {
        let avg = self.avg(Metric::Rssi, Scope::antenna_at(antenna, location)).await;
        let (min, max) = self
            .range(Metric::Rssi, Scope::location(location))
            .await
            .unwrap_or((RSSI_FLOOR_DBM, RSSI_CEILING_DBM));
        ScoreAggregate { avg, min, max }
    }

    pub async fn rssi_score(&self, antenna: &str, location: Option<&str>) -> f64 {
        self.rssi_aggregate(antenna, location).await.score()
    }

    /// SNR of one location, ranged against all locations.
    pub async fn snr_aggregate(&self, location: &str) -> Option<ScoreAggregate> {
        let avg = self.avg(Metric::Snr, Scope::location(Some(location))).await;
        let (min, max) = self.range(Metric::Snr, Scope::all()).await?;
        Some(ScoreAggregate { avg, min, max })
    }

    pub async fn snr_score(&self, location: &str) -> f64 {
        self.snr_aggregate(location)
            .await
            .map_or(DEGENERATE_SCORE, |agg| agg.score())
    }

    /// Rows of the antenna results table.
    pub async fn antenna_scores(&self, location: Option<&str>, order: SortOrder) -> Vec<AntennaScore> {
        let mut rows = Vec::new();
        for group in samples::antenna_groups(&self.queue, location).await {
            let agg = self.rssi_aggregate(&group.antenna_name, location).await;
            rows.push(AntennaScore {
                antenna_name: group.antenna_name,
                location: group.location,
                url: group.url,
                notes: group.notes,
                avg_rssi: agg.avg,
                score: agg.score(),
            });
        }
        order.sort_antennas(&mut rows);
        rows
    }

    /// Rows of the locations table.
    pub async fn location_scores(&self, order: SortOrder) -> Vec<LocationScore> {
        let mut rows = Vec::new();
        for location in samples::distinct_locations(&self.queue).await {
            let avg_snr = self.avg(Metric::Snr, Scope::location(Some(location.as_str()))).await;
            let score = self.snr_score(&location).await;
            let best_antenna = samples::best_antenna(&self.queue, &location).await;
            rows.push(LocationScore {
                location,
                avg_snr,
                score,
                best_antenna,
            });
        }
        order.sort_locations(&mut rows);
        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_of_nothing_is_zero() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[-60.0, -80.0, -100.0]), -80.0);
    }

    #[test]
    fn normalize_midpoint() {
        assert_eq!(normalize(-80.0, -100.0, -60.0), 5.5);
    }

    #[test]
    fn normalize_degenerate_range() {
        assert_eq!(normalize(-80.0, -80.0, -80.0), DEGENERATE_SCORE);
    }

    #[test]
    fn normalize_endpoints_and_clamping() {
        assert_eq!(normalize(-100.0, -100.0, -60.0), 1.0);
        assert_eq!(normalize(-60.0, -100.0, -60.0), 10.0);
        // An empty average (0) against a negative range clamps to the top.
        assert_eq!(normalize(0.0, -100.0, -60.0), 10.0);
        assert_eq!(normalize(-200.0, -100.0, -60.0), 1.0);
    }

    #[test]
    fn scores_stay_in_bounds() {
        for avg in [-500.0, -120.0, -90.5, -61.0, 0.0, 30.0] {
            let score = normalize(avg, -110.0, -70.0);
            assert!((MIN_SCORE..=MAX_SCORE).contains(&score), "{avg} -> {score}");
        }
    }

    #[test]
    fn rounds_to_one_decimal() {
        // (−87 − −100) / 40 × 9 + 1 = 3.925
        assert_eq!(normalize(-87.0, -100.0, -60.0), 3.9);
    }

    #[test]
    fn sort_defaults_to_score_descending() {
        let mut rows = vec![
            LocationScore {
                location: "a".into(),
                avg_snr: 1.0,
                score: 2.0,
                best_antenna: None,
            },
            LocationScore {
                location: "b".into(),
                avg_snr: 0.0,
                score: 9.0,
                best_antenna: None,
            },
        ];
        SortOrder::default().sort_locations(&mut rows);
        assert_eq!(rows[0].location, "b");

        SortOrder {
            key: SortKey::Name,
            descending: false,
        }
        .sort_locations(&mut rows);
        assert_eq!(rows[0].location, "a");
    }

    #[test]
    fn sort_key_parses_column_names() {
        assert_eq!("rssi".parse::<SortKey>(), Ok(SortKey::Metric));
        assert_eq!("antenna_name".parse::<SortKey>(), Ok(SortKey::Name));
        assert!("bogus".parse::<SortKey>().is_err());
    }
}
