// Train the regression ensemble and tune its elastic-net member.
use std::collections::BTreeMap;

use linfa::prelude::*;
use linfa::Dataset;
use linfa_elasticnet::ElasticNet;
use linfa_linear::{Link, TweedieRegressor};
use ndarray::{Array1, Array2, Axis, Ix1};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::error::{ForecastError, Result};

pub const LINEAR: &str = "linear";
pub const ELASTIC_NET: &str = "elastic_net";
pub const POISSON: &str = "poisson";

/// Feature matrix with one target per row.
pub type TrainSet = Dataset<f64, f64, Ix1>;

/// A regression model the ensemble can fit once and then query.
pub trait Regressor {
    fn name(&self) -> &str;
    fn fit(&mut self, train: &TrainSet) -> Result<()>;
    fn predict(&self, records: &Array2<f64>) -> Result<Array1<f64>>;
}

fn not_fitted(name: &str) -> ForecastError {
    ForecastError::model(name, "predict called before fit")
}

/// Gaussian GLM with identity link, i.e. ridge-penalised least squares.
/// The penalty keeps the one-hot design solvable even though each block of
/// indicators sums to one.
pub struct LinearModel {
    alpha: f64,
    fitted: Option<TweedieRegressor<f64>>,
}

impl LinearModel {
    pub fn new(alpha: f64) -> Self {
        LinearModel { alpha, fitted: None }
    }
}

impl Regressor for LinearModel {
    fn name(&self) -> &str {
        LINEAR
    }

    fn fit(&mut self, train: &TrainSet) -> Result<()> {
        let model = TweedieRegressor::params()
            .power(0.0)
            .link(Link::Identity)
            .alpha(self.alpha)
            .fit(train)
            .map_err(|e| ForecastError::model(LINEAR, e))?;
        self.fitted = Some(model);
        Ok(())
    }

    fn predict(&self, records: &Array2<f64>) -> Result<Array1<f64>> {
        let model = self.fitted.as_ref().ok_or_else(|| not_fitted(LINEAR))?;
        Ok(model.predict(records))
    }
}

/// Poisson GLM (log link); runs are non-negative counts.
pub struct PoissonModel {
    alpha: f64,
    fitted: Option<TweedieRegressor<f64>>,
}

impl PoissonModel {
    pub fn new(alpha: f64) -> Self {
        PoissonModel { alpha, fitted: None }
    }
}

impl Regressor for PoissonModel {
    fn name(&self) -> &str {
        POISSON
    }

    fn fit(&mut self, train: &TrainSet) -> Result<()> {
        let model = TweedieRegressor::params()
            .power(1.0)
            .link(Link::Log)
            .alpha(self.alpha)
            .fit(train)
            .map_err(|e| ForecastError::model(POISSON, e))?;
        self.fitted = Some(model);
        Ok(())
    }

    fn predict(&self, records: &Array2<f64>) -> Result<Array1<f64>> {
        let model = self.fitted.as_ref().ok_or_else(|| not_fitted(POISSON))?;
        Ok(model.predict(records))
    }
}

/// Hyperparameters of the tunable elastic-net member.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElasticNetConfig {
    pub penalty: f64,
    pub l1_ratio: f64,
}

impl Default for ElasticNetConfig {
    fn default() -> Self {
        ElasticNetConfig {
            penalty: 0.1,
            l1_ratio: 0.5,
        }
    }
}

pub struct ElasticNetModel {
    config: ElasticNetConfig,
    fitted: Option<ElasticNet<f64>>,
}

impl ElasticNetModel {
    pub fn new(config: ElasticNetConfig) -> Self {
        ElasticNetModel { config, fitted: None }
    }

    pub fn config(&self) -> ElasticNetConfig {
        self.config
    }
}

impl Regressor for ElasticNetModel {
    fn name(&self) -> &str {
        ELASTIC_NET
    }

    fn fit(&mut self, train: &TrainSet) -> Result<()> {
        let model = ElasticNet::params()
            .penalty(self.config.penalty)
            .l1_ratio(self.config.l1_ratio)
            .max_iterations(2000)
            .fit(train)
            .map_err(|e| ForecastError::model(ELASTIC_NET, e))?;
        self.fitted = Some(model);
        Ok(())
    }

    fn predict(&self, records: &Array2<f64>) -> Result<Array1<f64>> {
        let model = self.fitted.as_ref().ok_or_else(|| not_fitted(ELASTIC_NET))?;
        Ok(model.predict(records))
    }
}

/// Unweighted mean, `None` for no values.
pub fn ensemble_mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

pub fn mean_squared_error(pred: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    let diff = pred - truth;
    diff.mapv(|d| d * d).mean().unwrap_or(0.0)
}

/// Coefficient of determination; 0 when the targets have no variance.
pub fn r2_score(pred: &Array1<f64>, truth: &Array1<f64>) -> f64 {
    let Some(mean) = truth.mean() else {
        return 0.0;
    };
    let ss_res = (pred - truth).mapv(|d| d * d).sum();
    let ss_tot = truth.mapv(|t| (t - mean) * (t - mean)).sum();
    if ss_tot > 0.0 {
        1.0 - ss_res / ss_tot
    } else {
        0.0
    }
}

/// Result of one scenario query across the ensemble.
#[derive(Debug, Clone, PartialEq)]
pub struct EnsemblePrediction {
    pub per_model: BTreeMap<String, f64>,
    /// Models that could not produce a prediction, with the reason.
    pub failures: BTreeMap<String, String>,
    /// Mean over the models in `per_model` only.
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelScore {
    pub name: String,
    pub mse: f64,
    pub r2: f64,
}

/// Named regressors fitted together and queried side by side.
#[derive(Default)]
pub struct Ensemble {
    models: Vec<Box<dyn Regressor>>,
}

impl Ensemble {
    pub fn new() -> Self {
        Ensemble::default()
    }

    /// Linear, tuned elastic-net and Poisson members.
    pub fn standard(elastic_net: ElasticNetConfig, glm_alpha: f64) -> Self {
        Ensemble::new()
            .with_model(Box::new(LinearModel::new(glm_alpha)))
            .with_model(Box::new(ElasticNetModel::new(elastic_net)))
            .with_model(Box::new(PoissonModel::new(glm_alpha)))
    }

    /// Adds a model, replacing any existing one with the same name.
    pub fn with_model(mut self, model: Box<dyn Regressor>) -> Self {
        self.insert(model);
        self
    }

    pub fn insert(&mut self, model: Box<dyn Regressor>) {
        match self.models.iter().position(|m| m.name() == model.name()) {
            Some(i) => self.models[i] = model,
            None => self.models.push(model),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.models.iter().map(|m| m.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Fits every member. Any failure aborts the whole fit.
    pub fn fit(&mut self, train: &TrainSet) -> Result<()> {
        if self.is_empty() {
            return Err(ForecastError::Config("ensemble has no models".into()));
        }
        for model in self.models.iter_mut() {
            model.fit(train)?;
            debug!(model = model.name(), "fitted");
        }
        Ok(())
    }

    /// Predicts one aligned feature vector with every member separately. A
    /// failing member is reported in `failures` and left out of the mean.
    pub fn predict(&self, vector: &Array1<f64>) -> Result<EnsemblePrediction> {
        if self.is_empty() {
            return Err(ForecastError::NoPrediction { failed: 0 });
        }
        let records = vector.view().insert_axis(Axis(0)).to_owned();
        let mut per_model = BTreeMap::new();
        let mut failures = BTreeMap::new();

        for model in &self.models {
            let outcome = model.predict(&records).and_then(|p| {
                p.first()
                    .copied()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| ForecastError::model(model.name(), "no finite prediction"))
            });
            match outcome {
                Ok(v) => {
                    per_model.insert(model.name().to_string(), v);
                }
                Err(e) => {
                    warn!(model = model.name(), error = %e, "model prediction failed");
                    failures.insert(model.name().to_string(), e.to_string());
                }
            }
        }

        let values: Vec<f64> = per_model.values().copied().collect();
        let mean = ensemble_mean(&values).ok_or(ForecastError::NoPrediction {
            failed: failures.len(),
        })?;
        Ok(EnsemblePrediction {
            per_model,
            failures,
            mean,
        })
    }

    /// Holdout scores per member; members that fail to predict are skipped.
    pub fn evaluate(&self, test: &TrainSet) -> Vec<ModelScore> {
        let truth = test.targets();
        self.models
            .iter()
            .filter_map(|model| match model.predict(test.records()) {
                Ok(pred) => Some(ModelScore {
                    name: model.name().to_string(),
                    mse: mean_squared_error(&pred, truth),
                    r2: r2_score(&pred, truth),
                }),
                Err(e) => {
                    warn!(model = model.name(), error = %e, "skipping holdout score");
                    None
                }
            })
            .collect()
    }
}

/// Row indices `0..n` in a seeded random order.
pub fn shuffled_indices(n: usize, seed: u64) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..n).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    idx.shuffle(&mut rng);
    idx
}

/// Splits shuffled indices into `k` contiguous folds; the first `n % k`
/// folds take one extra row. Returns (train, validation) pairs.
pub fn kfold_indices(n: usize, k: usize, seed: u64) -> Vec<(Vec<usize>, Vec<usize>)> {
    let idx = shuffled_indices(n, seed);
    let base = n / k;
    let extra = n % k;
    let mut start = 0;
    (0..k)
        .map(|fold| {
            let len = base + usize::from(fold < extra);
            let valid = idx[start..start + len].to_vec();
            let train = idx[..start].iter().chain(&idx[start + len..]).copied().collect();
            start += len;
            (train, valid)
        })
        .collect()
}

pub fn subset(data: &TrainSet, rows: &[usize]) -> TrainSet {
    Dataset::new(
        data.records().select(Axis(0), rows),
        data.targets().select(Axis(0), rows),
    )
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidateScore {
    pub config: ElasticNetConfig,
    pub mse: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchOutcome {
    pub best: ElasticNetConfig,
    pub best_mse: f64,
    /// In grid order.
    pub scores: Vec<CandidateScore>,
}

/// K-fold cross-validated grid search over the elastic-net member.
#[derive(Debug, Clone)]
pub struct GridSearch {
    pub grid: Vec<ElasticNetConfig>,
    pub folds: usize,
    pub seed: u64,
    pub parallel: bool,
}

impl GridSearch {
    pub fn new(folds: usize, seed: u64, parallel: bool) -> Self {
        GridSearch {
            grid: Self::default_grid(),
            folds,
            seed,
            parallel,
        }
    }

    pub fn default_grid() -> Vec<ElasticNetConfig> {
        let mut grid = Vec::new();
        for &penalty in &[0.01, 0.1, 0.5, 1.0] {
            for &l1_ratio in &[0.0, 0.5, 1.0] {
                grid.push(ElasticNetConfig { penalty, l1_ratio });
            }
        }
        grid
    }

    /// Scores every candidate and keeps the lowest mean MSE. Ties go to the
    /// earlier grid entry so the pick does not depend on worker timing.
    pub fn run(&self, train: &TrainSet) -> Result<SearchOutcome> {
        let n = train.records().nrows();
        if self.grid.is_empty() {
            return Err(ForecastError::Config("empty hyperparameter grid".into()));
        }
        if self.folds < 2 || self.folds > n {
            return Err(ForecastError::Config(format!(
                "{} folds requested for {} training rows",
                self.folds, n
            )));
        }

        let folds = kfold_indices(n, self.folds, self.seed);
        let score = |config: &ElasticNetConfig| self.score(config, train, &folds);
        let scores: Vec<CandidateScore> = if self.parallel {
            self.grid.par_iter().map(score).collect::<Result<_>>()?
        } else {
            self.grid.iter().map(score).collect::<Result<_>>()?
        };

        let (_, best) = scores
            .iter()
            .enumerate()
            .min_by(|(i, a), (j, b)| a.mse.total_cmp(&b.mse).then(i.cmp(j)))
            .ok_or_else(|| ForecastError::Config("empty hyperparameter grid".into()))?;

        info!(
            penalty = best.config.penalty,
            l1_ratio = best.config.l1_ratio,
            mse = best.mse,
            "grid search finished"
        );
        Ok(SearchOutcome {
            best: best.config,
            best_mse: best.mse,
            scores,
        })
    }

    fn score(
        &self,
        config: &ElasticNetConfig,
        train: &TrainSet,
        folds: &[(Vec<usize>, Vec<usize>)],
    ) -> Result<CandidateScore> {
        let mut total = 0.0;
        for (fit_rows, valid_rows) in folds {
            let mut model = ElasticNetModel::new(*config);
            model.fit(&subset(train, fit_rows))?;
            let valid = subset(train, valid_rows);
            let pred = model.predict(valid.records())?;
            total += mean_squared_error(&pred, valid.targets());
        }
        let mse = total / folds.len() as f64;
        debug!(penalty = config.penalty, l1_ratio = config.l1_ratio, mse, "scored candidate");
        Ok(CandidateScore { config: *config, mse })
    }
}
