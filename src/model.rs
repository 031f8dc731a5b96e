//! Class-balanced logistic regression, cross-validated grid search and the
//! persisted model bundle

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use linfa::prelude::*;
use linfa::DatasetBase;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::data::{ensure_parent_dir, StandardScaler};
use crate::error::{ChurnError, ChurnResult};
use crate::metrics::roc_auc;

/// Regularization strengths searched by default
pub const DEFAULT_C_GRID: [f64; 4] = [0.01, 0.1, 1.0, 10.0];

/// Current on-disk bundle format
pub const BUNDLE_FORMAT_VERSION: u32 = 1;

/// Hyperparameters for a single logistic regression fit
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LogisticParams {
    /// Inverse regularization strength
    pub c: f64,
    /// Maximum Newton iterations
    pub max_iter: usize,
    /// Stop once the largest gradient component falls below this
    pub tolerance: f64,
    /// Weight samples inversely to their class frequency
    pub balanced: bool,
}

impl Default for LogisticParams {
    fn default() -> Self {
        Self {
            c: 1.0,
            max_iter: 1000,
            tolerance: 1e-6,
            balanced: true,
        }
    }
}

impl LogisticParams {
    pub fn with_c(mut self, c: f64) -> Self {
        self.c = c;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    fn validate(&self) -> ChurnResult<()> {
        if !(self.c.is_finite() && self.c > 0.0) {
            return Err(ChurnError::invalid_parameter("C", "must be a positive finite number"));
        }
        if self.max_iter == 0 {
            return Err(ChurnError::invalid_parameter("max_iter", "must be at least 1"));
        }
        Ok(())
    }
}

/// Fitted binary logistic classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChurnClassifier {
    /// Coefficients in scaled feature space
    pub coefficients: Array1<f64>,
    pub intercept: f64,
    /// Regularization strength the model was fit with
    pub c: f64,
    /// Newton iterations used
    pub n_iter: usize,
}

impl ChurnClassifier {
    pub fn n_features(&self) -> usize {
        self.coefficients.len()
    }

    /// Positive-class (churn) probability for each row of scaled features
    pub fn predict_proba(&self, records: ArrayView2<f64>) -> ChurnResult<Array1<f64>> {
        if records.ncols() != self.n_features() {
            return Err(ChurnError::ShapeMismatch {
                expected: self.n_features(),
                actual: records.ncols(),
            });
        }
        let margins = records.dot(&self.coefficients) + self.intercept;
        Ok(margins.mapv(sigmoid))
    }

    /// Hard 0/1 predictions at the 0.5 probability cut-off
    pub fn predict(&self, records: ArrayView2<f64>) -> ChurnResult<Array1<usize>> {
        Ok(self
            .predict_proba(records)?
            .mapv(|p| if p > 0.5 { 1 } else { 0 }))
    }
}

impl Fit<Array2<f64>, Array1<usize>, ChurnError> for LogisticParams {
    type Object = ChurnClassifier;

    fn fit(
        &self,
        dataset: &DatasetBase<Array2<f64>, Array1<usize>>,
    ) -> Result<Self::Object, ChurnError> {
        self.validate()?;
        let records = dataset.records();
        let targets = dataset.targets();
        if records.nrows() != targets.len() {
            return Err(ChurnError::LabelMismatch {
                rows: records.nrows(),
                labels: targets.len(),
            });
        }

        let y = targets.mapv(|t| t as f64);
        let weights = sample_weights(targets.view(), self.balanced)?;
        fit_newton(records.view(), y.view(), weights.view(), self)
    }
}

/// Class-balanced weights `n / (2 * n_class)`, or all ones
fn sample_weights(targets: ArrayView1<usize>, balanced: bool) -> ChurnResult<Array1<f64>> {
    let positives = targets.iter().filter(|&&t| t == 1).count();
    let negatives = targets.len() - positives;
    if positives == 0 || negatives == 0 {
        return Err(ChurnError::MissingClasses {
            positives,
            negatives,
        });
    }
    if !balanced {
        return Ok(Array1::ones(targets.len()));
    }

    let n = targets.len() as f64;
    let w_pos = n / (2.0 * positives as f64);
    let w_neg = n / (2.0 * negatives as f64);
    Ok(targets.mapv(|t| if t == 1 { w_pos } else { w_neg }))
}

/// Minimize `0.5 * ||w||^2 + C * sum_i s_i * logloss_i` with damped Newton steps.
/// The intercept is the last parameter and is not penalized.
fn fit_newton(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    s: ArrayView1<f64>,
    params: &LogisticParams,
) -> ChurnResult<ChurnClassifier> {
    let n_features = x.ncols();
    let mut theta = Array1::<f64>::zeros(n_features + 1);
    let mut loss = objective(x, y, s, theta.view(), params.c);
    let mut n_iter = 0;
    let mut converged = false;

    while n_iter < params.max_iter {
        let (w, b) = split_params(theta.view());
        let p = (x.dot(&w) + b).mapv(sigmoid);
        let residual = (&p - &y) * &s;

        let mut gradient = Array1::<f64>::zeros(n_features + 1);
        gradient
            .slice_mut(ndarray::s![..n_features])
            .assign(&(&w + &(x.t().dot(&residual) * params.c)));
        gradient[n_features] = params.c * residual.sum();

        if gradient.iter().fold(0.0_f64, |acc, g| acc.max(g.abs())) < params.tolerance {
            converged = true;
            break;
        }

        let curvature = &p * &(1.0 - &p) * &s * params.c;
        let hessian = newton_hessian(x, curvature.view());
        let step = cholesky_solve(&hessian, &gradient).ok_or(ChurnError::SingularSystem)?;

        // backtracking line search on the objective
        let directional = gradient.dot(&step);
        let mut t = 1.0;
        let mut accepted = false;
        for _ in 0..40 {
            let candidate = &theta - &(&step * t);
            let candidate_loss = objective(x, y, s, candidate.view(), params.c);
            if candidate_loss <= loss - 1e-4 * t * directional {
                theta = candidate;
                loss = candidate_loss;
                accepted = true;
                break;
            }
            t *= 0.5;
        }
        n_iter += 1;

        if !accepted {
            // no further decrease representable in floating point
            converged = true;
            break;
        }
    }

    if !converged {
        tracing::warn!(
            c = params.c,
            max_iter = params.max_iter,
            "logistic regression did not converge"
        );
    }

    let (w, b) = split_params(theta.view());
    Ok(ChurnClassifier {
        coefficients: w.to_owned(),
        intercept: b,
        c: params.c,
        n_iter,
    })
}

fn split_params(theta: ArrayView1<f64>) -> (ArrayView1<f64>, f64) {
    let n_features = theta.len() - 1;
    let intercept = theta[n_features];
    (theta.slice_move(ndarray::s![..n_features]), intercept)
}

fn objective(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    s: ArrayView1<f64>,
    theta: ArrayView1<f64>,
    c: f64,
) -> f64 {
    let (w, b) = split_params(theta);
    let margins = x.dot(&w) + b;
    let data_loss: f64 = margins
        .iter()
        .zip(y.iter())
        .zip(s.iter())
        .map(|((&m, &yi), &si)| {
            let l = if yi > 0.5 { log1p_exp(-m) } else { log1p_exp(m) };
            si * l
        })
        .sum();
    0.5 * w.dot(&w) + c * data_loss
}

/// Hessian of the penalized objective over `[w, b]`
fn newton_hessian(x: ArrayView2<f64>, curvature: ArrayView1<f64>) -> Array2<f64> {
    let n_features = x.ncols();
    let mut augmented = Array2::<f64>::ones((x.nrows(), n_features + 1));
    augmented
        .slice_mut(ndarray::s![.., ..n_features])
        .assign(&x);

    let weighted = &augmented * &curvature.insert_axis(Axis(1));
    let mut hessian = augmented.t().dot(&weighted);
    for j in 0..n_features {
        hessian[[j, j]] += 1.0;
    }
    hessian[[n_features, n_features]] += 1e-10;
    hessian
}

/// Solve `a * x = b` for symmetric positive definite `a`
fn cholesky_solve(a: &Array2<f64>, b: &Array1<f64>) -> Option<Array1<f64>> {
    let n = a.nrows();
    let mut l = Array2::<f64>::zeros((n, n));
    for i in 0..n {
        for j in 0..=i {
            let mut sum = a[[i, j]];
            for k in 0..j {
                sum -= l[[i, k]] * l[[j, k]];
            }
            if i == j {
                if sum <= 0.0 || !sum.is_finite() {
                    return None;
                }
                l[[i, i]] = sum.sqrt();
            } else {
                l[[i, j]] = sum / l[[j, j]];
            }
        }
    }

    // forward substitution: L z = b
    let mut z = Array1::<f64>::zeros(n);
    for i in 0..n {
        let mut sum = b[i];
        for k in 0..i {
            sum -= l[[i, k]] * z[k];
        }
        z[i] = sum / l[[i, i]];
    }

    // back substitution: L^T x = z
    let mut x = Array1::<f64>::zeros(n);
    for i in (0..n).rev() {
        let mut sum = z[i];
        for k in (i + 1)..n {
            sum -= l[[k, i]] * x[k];
        }
        x[i] = sum / l[[i, i]];
    }
    Some(x)
}

fn sigmoid(z: f64) -> f64 {
    if z >= 0.0 {
        1.0 / (1.0 + (-z).exp())
    } else {
        let e = z.exp();
        e / (1.0 + e)
    }
}

/// `ln(1 + e^x)` without overflow
fn log1p_exp(x: f64) -> f64 {
    if x > 0.0 {
        x + (-x).exp().ln_1p()
    } else {
        x.exp().ln_1p()
    }
}

/// Stratified k-fold split without shuffling.
///
/// Fold sizes per class come from dealing the class-sorted labels
/// round-robin over the folds, so the remainder of class 1 continues where
/// class 0 stopped. Within each class the samples keep their order and fill
/// the folds as contiguous blocks. Returns the validation indices of every
/// fold, each sorted ascending.
pub fn stratified_folds(targets: ArrayView1<usize>, k: usize) -> ChurnResult<Vec<Vec<usize>>> {
    if k < 2 {
        return Err(ChurnError::invalid_parameter("folds", "must be >= 2"));
    }

    let mut folds = vec![Vec::new(); k];
    let mut dealt = 0;
    for class in [0usize, 1] {
        let members: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|&(_, &t)| t == class)
            .map(|(i, _)| i)
            .collect();
        if members.len() < k {
            return Err(ChurnError::InsufficientData {
                required: k,
                actual: members.len(),
            });
        }

        let mut sizes = vec![0usize; k];
        for position in dealt..dealt + members.len() {
            sizes[position % k] += 1;
        }
        dealt += members.len();

        let mut start = 0;
        for (fold, size) in folds.iter_mut().zip(sizes) {
            fold.extend_from_slice(&members[start..start + size]);
            start += size;
        }
    }

    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    Ok(folds)
}

/// Cross-validated score of a single grid candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateScore {
    pub c: f64,
    pub fold_scores: Vec<f64>,
    pub mean_score: f64,
}

/// Outcome of the grid search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CvReport {
    pub folds: usize,
    pub best_c: f64,
    pub best_score: f64,
    pub candidates: Vec<CandidateScore>,
}

/// Grid search over `C` scored by mean ROC-AUC on stratified folds
#[derive(Debug, Clone)]
pub struct GridSearch {
    pub grid: Vec<f64>,
    pub folds: usize,
    pub base: LogisticParams,
}

impl Default for GridSearch {
    fn default() -> Self {
        Self {
            grid: DEFAULT_C_GRID.to_vec(),
            folds: 5,
            base: LogisticParams::default(),
        }
    }
}

impl GridSearch {
    /// Score every candidate, then refit the best one on the whole dataset
    ///
    /// # Arguments
    /// * `dataset` - Scaled training records with 0/1 targets
    ///
    /// # Returns
    /// * The refit classifier and the per-candidate report
    pub fn fit(
        &self,
        dataset: &DatasetBase<Array2<f64>, Array1<usize>>,
    ) -> ChurnResult<(ChurnClassifier, CvReport)> {
        if self.grid.is_empty() {
            return Err(ChurnError::invalid_parameter("grid", "must contain at least one value"));
        }

        let records = dataset.records();
        let targets = dataset.targets();
        let folds = stratified_folds(targets.view(), self.folds)?;

        let mut candidates = Vec::with_capacity(self.grid.len());
        for &c in &self.grid {
            let params = self.base.with_c(c);
            let mut fold_scores = Vec::with_capacity(folds.len());

            for validation in &folds {
                let training: Vec<usize> = (0..targets.len())
                    .filter(|i| validation.binary_search(i).is_err())
                    .collect();

                let train_set = Dataset::new(
                    records.select(Axis(0), &training),
                    targets.select(Axis(0), &training),
                );
                let model = params.fit(&train_set)?;

                let proba = model.predict_proba(records.select(Axis(0), validation).view())?;
                let truth = targets.select(Axis(0), validation);
                let score = roc_auc(&truth.to_vec(), &proba.to_vec())?;
                fold_scores.push(score);
            }

            let mean_score = fold_scores.iter().sum::<f64>() / fold_scores.len() as f64;
            tracing::debug!(c, mean_score, "grid candidate scored");
            candidates.push(CandidateScore {
                c,
                fold_scores,
                mean_score,
            });
        }

        // strictly greater keeps the earliest candidate on ties
        let best = candidates
            .iter()
            .skip(1)
            .fold(&candidates[0], |best, cand| {
                if cand.mean_score > best.mean_score {
                    cand
                } else {
                    best
                }
            })
            .clone();

        let model = self.base.with_c(best.c).fit(dataset)?;
        let report = CvReport {
            folds: self.folds,
            best_c: best.c,
            best_score: best.mean_score,
            candidates,
        };
        Ok((model, report))
    }
}

/// Scaler, classifier and feature schema persisted together
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelBundle {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Feature names in training order
    pub feature_names: Vec<String>,
    pub scaler: StandardScaler,
    pub classifier: ChurnClassifier,
    pub cv_report: CvReport,
}

impl ModelBundle {
    pub fn new(
        feature_names: Vec<String>,
        scaler: StandardScaler,
        classifier: ChurnClassifier,
        cv_report: CvReport,
    ) -> ChurnResult<Self> {
        let expected = feature_names.len();
        for actual in [scaler.n_features(), classifier.n_features()] {
            if actual != expected {
                return Err(ChurnError::ShapeMismatch { expected, actual });
            }
        }
        Ok(Self {
            format_version: BUNDLE_FORMAT_VERSION,
            created_at: Utc::now(),
            feature_names,
            scaler,
            classifier,
            cv_report,
        })
    }

    /// Churn probabilities for raw (unscaled) features in training order
    pub fn predict_proba(&self, raw: ArrayView2<f64>) -> ChurnResult<Array1<f64>> {
        let scaled = self.scaler.transform(raw)?;
        self.classifier.predict_proba(scaled.view())
    }

    pub fn save(&self, path: &Path) -> crate::Result<()> {
        ensure_parent_dir(path)?;
        let file =
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("Failed to write model bundle {}", path.display()))?;
        Ok(())
    }

    pub fn load(path: &Path) -> crate::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open model bundle {}", path.display()))?;
        let bundle: ModelBundle = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("Failed to parse model bundle {}", path.display()))?;

        if bundle.format_version != BUNDLE_FORMAT_VERSION {
            return Err(ChurnError::BundleVersion {
                found: bundle.format_version,
                expected: BUNDLE_FORMAT_VERSION,
            }
            .into());
        }
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Ix1};
    use tempfile::tempdir;

    fn create_test_dataset() -> Dataset<f64, usize, Ix1> {
        // two overlapping groups along the first feature, noise on the second
        let records = Array2::from_shape_vec(
            (20, 2),
            vec![
                -2.0, 0.3, -1.8, -0.2, -1.5, 0.1, -1.2, 0.4, -1.0, -0.5, //
                -0.8, 0.2, -0.5, -0.1, -0.3, 0.6, 0.2, -0.4, 0.4, 0.0, //
                -0.4, 0.1, 0.1, -0.3, 0.5, 0.2, 0.8, -0.6, 1.0, 0.5, //
                1.2, -0.1, 1.5, 0.3, 1.7, -0.2, 2.0, 0.4, 2.2, 0.0,
            ],
        )
        .unwrap();
        let targets = array![0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 1, 1, 1, 1, 1];
        Dataset::new(records, targets)
    }

    #[test]
    fn test_fit_separates_classes() {
        let dataset = create_test_dataset();
        let model = LogisticParams::default().fit(&dataset).unwrap();

        assert!(model.coefficients[0] > 0.0);
        let proba = model.predict_proba(dataset.records().view()).unwrap();
        assert!(proba.iter().all(|p| (0.0..=1.0).contains(p)));

        let auc = roc_auc(dataset.targets().as_slice().unwrap(), proba.as_slice().unwrap()).unwrap();
        assert!(auc > 0.9);
    }

    #[test]
    fn test_stronger_regularization_shrinks_coefficients() {
        let dataset = create_test_dataset();
        let weak = LogisticParams::default().with_c(10.0).fit(&dataset).unwrap();
        let strong = LogisticParams::default().with_c(0.01).fit(&dataset).unwrap();

        assert!(strong.coefficients[0].abs() < weak.coefficients[0].abs());
    }

    #[test]
    fn test_fit_requires_both_classes() {
        let dataset = Dataset::new(array![[1.0], [2.0]], array![1usize, 1]);
        let result = LogisticParams::default().fit(&dataset);
        assert!(matches!(result, Err(ChurnError::MissingClasses { .. })));
    }

    #[test]
    fn test_invalid_c() {
        let dataset = create_test_dataset();
        let result = LogisticParams::default().with_c(0.0).fit(&dataset);
        assert!(matches!(result, Err(ChurnError::InvalidParameter { .. })));
    }

    #[test]
    fn test_balanced_weights() {
        let weights = sample_weights(array![1usize, 0, 0, 0].view(), true).unwrap();
        assert_eq!(weights, array![2.0, 2.0 / 3.0, 2.0 / 3.0, 2.0 / 3.0]);
    }

    #[test]
    fn test_stratified_folds_cover_every_sample_once() {
        let targets = array![0usize, 1, 0, 0, 1, 0, 1, 0, 1, 1, 0, 0];
        let folds = stratified_folds(targets.view(), 3).unwrap();

        let mut seen: Vec<usize> = folds.iter().flatten().copied().collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());

        for fold in &folds {
            let positives = fold.iter().filter(|&&i| targets[i] == 1).count();
            let negatives = fold.len() - positives;
            assert!(positives >= 1 && negatives >= 2);
        }
    }

    #[test]
    fn test_stratified_fold_remainders_continue_across_classes() {
        let mut targets = vec![0usize; 12];
        targets.extend(vec![1usize; 8]);
        let targets = Array1::from(targets);

        let folds = stratified_folds(targets.view(), 5).unwrap();

        let positives: Vec<usize> = folds
            .iter()
            .map(|fold| fold.iter().filter(|&&i| targets[i] == 1).count())
            .collect();
        let negatives: Vec<usize> = folds.iter().zip(&positives).map(|(f, p)| f.len() - p).collect();
        assert_eq!(negatives, vec![3, 3, 2, 2, 2]);
        assert_eq!(positives, vec![1, 1, 2, 2, 2]);
        // positives fill the folds in order
        assert_eq!(folds[0], vec![0, 1, 2, 12]);
        assert_eq!(folds[4], vec![10, 11, 18, 19]);
    }

    #[test]
    fn test_stratified_folds_need_enough_members() {
        let targets = array![0usize, 0, 0, 0, 0, 1, 1];
        let result = stratified_folds(targets.view(), 5);
        assert!(matches!(
            result,
            Err(ChurnError::InsufficientData { required: 5, actual: 2 })
        ));
    }

    #[test]
    fn test_grid_search_is_deterministic() {
        let dataset = create_test_dataset();
        let search = GridSearch::default();

        let (model_a, report_a) = search.fit(&dataset).unwrap();
        let (model_b, report_b) = search.fit(&dataset).unwrap();

        assert_eq!(report_a.best_c, report_b.best_c);
        assert_eq!(report_a.best_score, report_b.best_score);
        assert_eq!(model_a, model_b);
        assert_eq!(report_a.candidates.len(), DEFAULT_C_GRID.len());
        assert!(report_a.candidates.iter().all(|c| c.fold_scores.len() == 5));
        assert!(DEFAULT_C_GRID.contains(&report_a.best_c));
    }

    #[test]
    fn test_cholesky_solve() {
        let a = array![[4.0, 2.0], [2.0, 3.0]];
        let b = array![2.0, 1.0];
        let x = cholesky_solve(&a, &b).unwrap();
        assert!((x[0] - 0.5).abs() < 1e-12);
        assert!(x[1].abs() < 1e-12);

        let singular = array![[1.0, 1.0], [1.0, 1.0]];
        assert!(cholesky_solve(&singular, &b).is_none());
    }

    #[test]
    fn test_bundle_round_trip_and_version_check() {
        let dataset = create_test_dataset();
        let scaler = StandardScaler::fit(dataset.records()).unwrap();
        let (classifier, report) = GridSearch::default().fit(&dataset).unwrap();
        let bundle = ModelBundle::new(
            vec!["tenure".into(), "charges".into()],
            scaler,
            classifier,
            report,
        )
        .unwrap();

        let dir = tempdir().unwrap();
        let path = dir.path().join("models").join("churn_bundle.json");
        bundle.save(&path).unwrap();
        let loaded = ModelBundle::load(&path).unwrap();
        assert_eq!(loaded.feature_names, bundle.feature_names);
        assert_eq!(loaded.classifier.c, bundle.classifier.c);

        let mut stale = bundle.clone();
        stale.format_version = 99;
        stale.save(&path).unwrap();
        let err = ModelBundle::load(&path).unwrap_err();
        assert!(err.to_string().contains("Unsupported model bundle version"));
    }

    #[test]
    fn test_bundle_rejects_shape_mismatch() {
        let dataset = create_test_dataset();
        let scaler = StandardScaler::fit(dataset.records()).unwrap();
        let (classifier, report) = GridSearch::default().fit(&dataset).unwrap();

        let result = ModelBundle::new(vec!["only_one".into()], scaler, classifier, report);
        assert!(matches!(result, Err(ChurnError::ShapeMismatch { .. })));
    }
}
