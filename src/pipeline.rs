// Batch pipeline: aggregate -> encode -> tune -> fit, then scenario queries
// against the fitted schema and ensemble.
use linfa::Dataset;
use ndarray::{Array1, Array2};
use tracing::{info, warn};

use crate::encode::{FeatureEncoder, FeatureSource, FittedSchema, UnknownCategoryPolicy};
use crate::error::{ForecastError, Result};
use crate::io::{Delivery, Match};
use crate::model::{shuffled_indices, ElasticNetConfig, ElasticNetModel, Ensemble, EnsemblePrediction, GridSearch, ModelScore, SearchOutcome, TrainSet};
use crate::stats::{aggregate, Aggregates, BattingCareer, BattingInning, BowlingCareer, RecencyOrder};

pub const CATEGORICAL_COLUMNS: [&str; 4] = ["batsman", "batting_team", "bowling_team", "venue"];
pub const NUMERIC_COLUMNS: [&str; 2] = ["inning", "career_avg"];

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub recency: RecencyOrder,
    pub unknown_policy: UnknownCategoryPolicy,
    pub folds: usize,
    pub seed: u64,
    pub test_fraction: f64,
    pub parallel_search: bool,
    /// L2 strength of the two GLM members.
    pub glm_alpha: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            recency: RecencyOrder::MatchId,
            unknown_policy: UnknownCategoryPolicy::ZeroFill,
            folds: 5,
            seed: 42,
            test_fraction: 0.2,
            parallel_search: true,
            glm_alpha: 0.1,
        }
    }
}

/// One batting inning joined with the batter's career average.
#[derive(Debug, Clone, Copy)]
pub struct TrainingRow<'a> {
    pub inning: &'a BattingInning,
    pub career_average: f64,
}

impl FeatureSource for TrainingRow<'_> {
    fn categorical(&self, column: &str) -> Option<&str> {
        match column {
            "batsman" => Some(self.inning.batsman.as_str()),
            "batting_team" => Some(self.inning.batting_team.as_str()),
            "bowling_team" => Some(self.inning.bowling_team.as_str()),
            "venue" => Some(self.inning.venue.as_str()),
            _ => None,
        }
    }

    fn numeric(&self, column: &str) -> Option<f64> {
        match column {
            "inning" => Some(self.inning.inning as f64),
            "career_avg" => Some(self.career_average),
            _ => None,
        }
    }
}

/// A hypothetical match situation to predict runs for.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub player: String,
    pub batting_team: String,
    pub bowling_team: String,
    pub venue: String,
    pub inning: u32,
}

struct ScenarioRow<'a> {
    scenario: &'a Scenario,
    career_average: f64,
}

impl FeatureSource for ScenarioRow<'_> {
    fn categorical(&self, column: &str) -> Option<&str> {
        match column {
            "batsman" => Some(self.scenario.player.as_str()),
            "batting_team" => Some(self.scenario.batting_team.as_str()),
            "bowling_team" => Some(self.scenario.bowling_team.as_str()),
            "venue" => Some(self.scenario.venue.as_str()),
            _ => None,
        }
    }

    fn numeric(&self, column: &str) -> Option<f64> {
        match column {
            "inning" => Some(self.scenario.inning as f64),
            "career_avg" => Some(self.career_average),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScenarioPrediction {
    pub scenario: Scenario,
    pub prediction: EnsemblePrediction,
    pub batting: Option<BattingCareer>,
    /// `None` either for an unknown bowler or when no bowling data exists;
    /// see `bowling_available`.
    pub bowling: Option<BowlingCareer>,
    pub bowling_available: bool,
}

/// Everything produced by one training pass. Read-only afterwards.
pub struct TrainedPipeline {
    pub aggregates: Aggregates,
    pub schema: FittedSchema,
    pub ensemble: Ensemble,
    pub search: SearchOutcome,
    pub holdout: Vec<ModelScore>,
    pub policy: UnknownCategoryPolicy,
}

pub fn training_rows(aggregates: &Aggregates) -> Vec<TrainingRow<'_>> {
    aggregates
        .innings
        .iter()
        .map(|inning| TrainingRow {
            inning,
            career_average: aggregates.career_average(&inning.batsman).unwrap_or(0.0),
        })
        .collect()
}

fn validate(config: &PipelineConfig) -> Result<()> {
    if !(0.0..1.0).contains(&config.test_fraction) {
        return Err(ForecastError::Config(format!(
            "test fraction must be in [0, 1), got {}",
            config.test_fraction
        )));
    }
    if config.glm_alpha < 0.0 {
        return Err(ForecastError::Config("glm alpha must be non-negative".into()));
    }
    Ok(())
}

fn encode_rows<R: FeatureSource>(schema: &FittedSchema, rows: &[R], policy: UnknownCategoryPolicy) -> Result<Array2<f64>> {
    let mut matrix = Array2::<f64>::zeros((rows.len(), schema.width()));
    for (i, row) in rows.iter().enumerate() {
        matrix.row_mut(i).assign(&schema.encode(row, policy)?);
    }
    Ok(matrix)
}

fn targets(rows: &[TrainingRow<'_>]) -> Array1<f64> {
    rows.iter().map(|r| r.inning.total_runs as f64).collect()
}

pub fn train(deliveries: &[Delivery], matches: &[Match], config: &PipelineConfig) -> Result<TrainedPipeline> {
    validate(config)?;

    let aggregates = aggregate(deliveries, matches, config.recency);
    info!(
        innings = aggregates.innings.len(),
        batters = aggregates.batting.len(),
        bowling = aggregates.bowling.is_some(),
        "aggregated deliveries"
    );

    let (schema, ensemble, search, holdout) = {
        let rows = training_rows(&aggregates);
        if rows.is_empty() {
            return Err(ForecastError::EmptyTrainingSet);
        }

        let order = shuffled_indices(rows.len(), config.seed);
        let n_test = (rows.len() as f64 * config.test_fraction).ceil() as usize;
        let (test_idx, train_idx) = order.split_at(n_test.min(rows.len()));
        let train_rows: Vec<TrainingRow<'_>> = train_idx.iter().map(|&i| rows[i]).collect();
        let test_rows: Vec<TrainingRow<'_>> = test_idx.iter().map(|&i| rows[i]).collect();

        let encoder = FeatureEncoder::new(&CATEGORICAL_COLUMNS, &NUMERIC_COLUMNS);
        // levels cover the whole innings table, the scaler only the train split
        let (x, schema) = encoder.fit_with_levels(&train_rows, &rows)?;
        let train_set: TrainSet = Dataset::new(x, targets(&train_rows));
        info!(
            train = train_rows.len(),
            test = test_rows.len(),
            columns = schema.width(),
            "encoded training split"
        );

        let search = GridSearch::new(config.folds, config.seed, config.parallel_search).run(&train_set)?;

        let mut ensemble = Ensemble::standard(ElasticNetConfig::default(), config.glm_alpha);
        let tuned = ElasticNetModel::new(search.best);
        info!(penalty = tuned.config().penalty, l1_ratio = tuned.config().l1_ratio, "using tuned elastic net");
        ensemble.insert(Box::new(tuned));
        ensemble.fit(&train_set)?;
        info!(members = ensemble.len(), models = ?ensemble.names(), "ensemble fitted");

        let holdout = if test_rows.is_empty() {
            Vec::new()
        } else {
            let x_test = encode_rows(&schema, &test_rows, UnknownCategoryPolicy::Error)?;
            ensemble.evaluate(&Dataset::new(x_test, targets(&test_rows)))
        };

        (schema, ensemble, search, holdout)
    };

    Ok(TrainedPipeline {
        aggregates,
        schema,
        ensemble,
        search,
        holdout,
        policy: config.unknown_policy,
    })
}

impl TrainedPipeline {
    pub fn predict(&self, scenario: &Scenario) -> Result<ScenarioPrediction> {
        let career_average = match self.aggregates.career_average(&scenario.player) {
            Some(avg) => avg,
            None => {
                warn!(player = %scenario.player, "player has no recorded innings, career average set to 0");
                0.0
            }
        };

        let row = ScenarioRow {
            scenario,
            career_average,
        };
        let vector = self.schema.encode(&row, self.policy)?;
        let prediction = self.ensemble.predict(&vector)?;

        Ok(ScenarioPrediction {
            scenario: scenario.clone(),
            prediction,
            batting: self.aggregates.batting(&scenario.player).cloned(),
            bowling: self.aggregates.bowling(&scenario.player).cloned(),
            bowling_available: self.aggregates.bowling.is_some(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MatchId;

    fn ball(match_id: MatchId, inning: u32, batsman: &str, bowler: &str, runs: u32, out: bool) -> Delivery {
        let (batting, bowling) = if inning == 1 { ("Lions", "Tigers") } else { ("Tigers", "Lions") };
        Delivery {
            match_id,
            inning,
            batting_team: batting.into(),
            bowling_team: bowling.into(),
            batsman: batsman.into(),
            bowler: bowler.into(),
            batsman_runs: runs,
            total_runs: runs,
            player_dismissed: out.then(|| batsman.to_string()),
        }
    }

    fn season(with_dismissals: bool) -> (Vec<Delivery>, Vec<Match>) {
        let mut deliveries = Vec::new();
        let mut matches = Vec::new();
        for m in 1..=12u64 {
            matches.push(Match {
                id: m,
                venue: if m % 3 == 0 { "Chepauk".into() } else { "Wankhede".into() },
                date: None,
            });
            for b in 0..6u32 {
                deliveries.push(ball(m, 1, "Kohli", "Bumrah", (b + m as u32) % 5, false));
                deliveries.push(ball(m, 2, "Rohit", "Siraj", (b * 2 + m as u32) % 4, false));
            }
            deliveries.push(ball(m, 1, "Dhoni", "Bumrah", (m % 3) as u32, with_dismissals));
            deliveries.push(ball(m, 2, "Gill", "Siraj", 1, with_dismissals));
        }
        (deliveries, matches)
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            folds: 3,
            test_fraction: 0.25,
            ..PipelineConfig::default()
        }
    }

    fn scenario(player: &str, venue: &str) -> Scenario {
        Scenario {
            player: player.into(),
            batting_team: "Lions".into(),
            bowling_team: "Tigers".into(),
            venue: venue.into(),
            inning: 1,
        }
    }

    #[test]
    fn training_rows_carry_per_inning_career_average() {
        let (deliveries, matches) = season(false);
        let agg = aggregate(&deliveries, &matches, RecencyOrder::MatchId);
        let rows = training_rows(&agg);
        assert_eq!(rows.len(), agg.innings.len());
        for r in &rows {
            let expected = agg.batting(&r.inning.batsman).unwrap().career_average;
            assert_eq!(r.career_average, expected);
        }
    }

    #[test]
    fn end_to_end_prediction_uses_every_model() {
        let (deliveries, matches) = season(true);
        let trained = train(&deliveries, &matches, &config()).unwrap();

        assert_eq!(trained.ensemble.len(), 3);
        assert_eq!(trained.holdout.len(), 3);
        assert!(trained.schema.columns().iter().any(|c| c == "venue_Wankhede"));

        let out = trained.predict(&scenario("Kohli", "Wankhede")).unwrap();
        assert_eq!(out.prediction.per_model.len(), 3);
        assert!(out.prediction.failures.is_empty());
        assert!(out.prediction.mean.is_finite());
        assert!(out.batting.is_some());
        assert!(out.bowling_available);
    }

    #[test]
    fn bowling_absence_does_not_break_batting_path() {
        let (deliveries, matches) = season(false);
        let trained = train(&deliveries, &matches, &config()).unwrap();
        let out = trained.predict(&scenario("Kohli", "Wankhede")).unwrap();
        assert!(!out.bowling_available);
        assert!(out.bowling.is_none());
        assert!(out.batting.is_some());
    }

    #[test]
    fn unknown_venue_follows_configured_policy() {
        let (deliveries, matches) = season(true);

        let lenient = train(&deliveries, &matches, &config()).unwrap();
        assert!(lenient.predict(&scenario("Kohli", "Eden Gardens")).is_ok());

        let strict_config = PipelineConfig {
            unknown_policy: UnknownCategoryPolicy::Error,
            ..config()
        };
        let strict = train(&deliveries, &matches, &strict_config).unwrap();
        assert!(matches!(
            strict.predict(&scenario("Kohli", "Eden Gardens")),
            Err(ForecastError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn batter_with_single_inning_stays_in_schema_for_any_split() {
        let (mut deliveries, matches) = season(true);
        deliveries.push(ball(1, 2, "Rare", "Siraj", 4, false));

        for seed in 0..8 {
            let strict = PipelineConfig {
                seed,
                unknown_policy: UnknownCategoryPolicy::Error,
                ..config()
            };
            let trained = train(&deliveries, &matches, &strict).unwrap();
            assert!(trained.schema.position("batsman_Rare").is_some(), "seed {seed}");
            assert!(trained.schema.position("batting_team_Tigers").is_some(), "seed {seed}");

            let query = Scenario {
                batting_team: "Tigers".into(),
                bowling_team: "Lions".into(),
                inning: 2,
                ..scenario("Rare", "Wankhede")
            };
            let out = trained.predict(&query).unwrap();
            assert!(out.prediction.mean.is_finite(), "seed {seed}");
        }
    }

    #[test]
    fn training_is_reproducible_for_a_seed() {
        let (deliveries, matches) = season(true);
        let a = train(&deliveries, &matches, &config()).unwrap();
        let b = train(&deliveries, &matches, &config()).unwrap();
        assert_eq!(a.search, b.search);
        assert_eq!(a.schema, b.schema);
        let q = scenario("Rohit", "Chepauk");
        assert_eq!(a.predict(&q).unwrap().prediction, b.predict(&q).unwrap().prediction);
    }

    #[test]
    fn rejects_out_of_range_test_fraction() {
        let (deliveries, matches) = season(true);
        let bad = PipelineConfig {
            test_fraction: 1.0,
            ..config()
        };
        assert!(matches!(train(&deliveries, &matches, &bad), Err(ForecastError::Config(_))));
    }

    #[test]
    fn empty_input_is_an_error() {
        assert!(matches!(
            train(&[], &[], &config()),
            Err(ForecastError::EmptyTrainingSet)
        ));
    }
}
