//! Coarse match selection.

use super::{CoarseMatch, CoarseMatcher, CoarseMatches, ConfidenceMatrix, RunPhase, TrainingInputs};
use crate::feature::{GridShape, PaddingMask};
use crate::trace::{trace_event, trace_span};
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{ArrayView1, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Grid of one image of one sample plus the extent of its valid region.
#[derive(Clone, Copy, Debug)]
struct ValidRegion {
    grid: GridShape,
    rows: usize,
    cols: usize,
}

impl ValidRegion {
    fn new(grid: GridShape, mask: Option<&PaddingMask>, b: usize) -> Self {
        let (rows, cols) = mask.map_or((grid.height, grid.width), |m| m.valid_extent(b));
        Self { grid, rows, cols }
    }

    /// False when token `idx` lies within `border` cells of the valid edge.
    fn clear_of_border(&self, idx: usize, border: usize) -> bool {
        if border == 0 {
            return true;
        }
        let (r, c) = self.grid.cell(idx);
        r >= border
            && c >= border
            && r < self.rows.saturating_sub(border)
            && c < self.cols.saturating_sub(border)
    }
}

fn lane_max(lane: ArrayView1<'_, f32>) -> f32 {
    lane.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v))
}

impl CoarseMatcher {
    /// Selects coarse matches from `conf`.
    ///
    /// `grid0`/`grid1` are the coarse grids of the two images; masks are the
    /// coarse padding masks. Output is ordered by `(batch, i)`; in the
    /// training phase the capped predictions are followed by ground-truth
    /// padding.
    pub fn select(
        &self,
        conf: &ConfidenceMatrix,
        grid0: GridShape,
        grid1: GridShape,
        mask0: Option<&PaddingMask>,
        mask1: Option<&PaddingMask>,
        phase: &RunPhase,
    ) -> DenseMatchResult<CoarseMatches> {
        let n = conf.batch();
        if conf.rows() != grid0.len() || conf.cols() != grid1.len() {
            return Err(DenseMatchError::shape(
                "coarse_matching",
                "confidence matrix",
                &[n, grid0.len(), grid1.len()],
                &[n, conf.rows(), conf.cols()],
            ));
        }
        if let Some(mask) = mask0 {
            mask.check_against("coarse_matching", n, grid0)?;
        }
        if let Some(mask) = mask1 {
            mask.check_against("coarse_matching", n, grid1)?;
        }

        let _span = trace_span!("coarse_select", batch = n).entered();
        let flat0 = mask0.map(PaddingMask::flatten);
        let flat1 = mask1.map(PaddingMask::flatten);
        let sample = |b: usize| {
            self.select_sample(
                conf.sample(b),
                b,
                ValidRegion::new(grid0, mask0, b),
                ValidRegion::new(grid1, mask1, b),
                flat0.as_ref().map(|m| m.row(b)),
                flat1.as_ref().map(|m| m.row(b)),
            )
        };

        #[cfg(feature = "rayon")]
        let per_sample: Vec<Vec<CoarseMatch>> = if self.parallel {
            (0..n).into_par_iter().map(sample).collect()
        } else {
            (0..n).map(sample).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let per_sample: Vec<Vec<CoarseMatch>> = (0..n).map(sample).collect();

        let predicted: CoarseMatches = per_sample.into_iter().flatten().collect();
        trace_event!("coarse_matches", count = predicted.len());

        match phase {
            RunPhase::Inference => Ok(predicted),
            RunPhase::Training(inputs) => {
                self.apply_training_policy(predicted, conf, mask0, mask1, inputs)
            }
        }
    }

    fn select_sample(
        &self,
        conf: ArrayView2<'_, f32>,
        b: usize,
        region0: ValidRegion,
        region1: ValidRegion,
        valid0: Option<ArrayView1<'_, bool>>,
        valid1: Option<ArrayView1<'_, bool>>,
    ) -> Vec<CoarseMatch> {
        let threshold = self.config.threshold;
        let border = self.config.border_rm;
        let col_max: Vec<f32> = conf.axis_iter(Axis(1)).map(lane_max).collect();

        let mut out = Vec::new();
        for (i, row) in conf.axis_iter(Axis(0)).enumerate() {
            if !valid0.map_or(true, |m| m[i]) || !region0.clear_of_border(i, border) {
                continue;
            }
            let row_max = lane_max(row);
            if !(row_max > threshold) {
                continue;
            }
            let hit = row.iter().enumerate().find(|&(j, &c)| {
                c == row_max
                    && c == col_max[j]
                    && valid1.map_or(true, |m| m[j])
                    && region1.clear_of_border(j, border)
            });
            if let Some((j, &confidence)) = hit {
                out.push(CoarseMatch {
                    batch: b,
                    i,
                    j,
                    confidence,
                    ground_truth: false,
                });
            }
        }
        out
    }

    /// Caps the predictions and pads them with ground-truth pairs.
    fn apply_training_policy(
        &self,
        predicted: CoarseMatches,
        conf: &ConfidenceMatrix,
        mask0: Option<&PaddingMask>,
        mask1: Option<&PaddingMask>,
        inputs: &TrainingInputs,
    ) -> DenseMatchResult<CoarseMatches> {
        let n = conf.batch();
        let max_candidates = match (mask0, mask1) {
            (Some(m0), Some(m1)) => (0..n)
                .map(|b| {
                    let (h0, w0) = m0.valid_extent(b);
                    let (h1, w1) = m1.valid_extent(b);
                    (h0 * w0).min(h1 * w1)
                })
                .sum(),
            _ => n * conf.rows().max(conf.cols()),
        };
        let percent = f64::from(self.config.train_coarse_percent);
        let num_train = (max_candidates as f64 * percent) as usize;
        let pad_min = self.config.train_pad_num_gt_min;
        if pad_min >= num_train {
            return Err(DenseMatchError::config(format!(
                "match_coarse: train_pad_num_gt_min {pad_min} must be below the training match budget {num_train}"
            )));
        }
        for pair in &inputs.ground_truth {
            if pair.batch >= n || pair.i >= conf.rows() || pair.j >= conf.cols() {
                return Err(DenseMatchError::shape(
                    "coarse_matching",
                    "ground-truth pair",
                    &[n, conf.rows(), conf.cols()],
                    &[pair.batch, pair.i, pair.j],
                ));
            }
        }

        let mut rng = StdRng::seed_from_u64(inputs.seed);
        let num_pred = predicted.len();
        let keep = num_train - pad_min;
        let mut out = CoarseMatches::with_capacity(num_train.max(num_pred));
        if num_pred <= keep {
            for m in predicted.iter() {
                out.push(m);
            }
        } else {
            for _ in 0..keep {
                if let Some(m) = predicted.get(rng.random_range(0..num_pred)) {
                    out.push(m);
                }
            }
        }

        let gt = &inputs.ground_truth;
        if !gt.is_empty() {
            let num_gt = num_train.saturating_sub(num_pred).max(pad_min);
            for _ in 0..num_gt {
                let pair = gt[rng.random_range(0..gt.len())];
                out.push(CoarseMatch {
                    batch: pair.batch,
                    i: pair.i,
                    j: pair.j,
                    confidence: 0.0,
                    ground_truth: true,
                });
            }
        }
        trace_event!("coarse_training_matches", predicted = num_pred, kept = out.len());
        Ok(out)
    }
}

/// Keeps the matches whose confidence is the maximum of both its row and its column.
pub fn mutual_nearest_filter(conf: &ConfidenceMatrix, matches: &CoarseMatches) -> CoarseMatches {
    matches
        .iter()
        .filter(|m| {
            let sample = conf.sample(m.batch);
            let c = sample[[m.i, m.j]];
            c == lane_max(sample.row(m.i)) && c == lane_max(sample.column(m.j))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::mutual_nearest_filter;
    use crate::coarse::{
        CoarseMatch, CoarseMatcher, CoarseMatches, CoarsePair, ConfidenceMatrix, RunPhase,
        TrainingInputs,
    };
    use crate::config::CoarseMatchConfig;
    use crate::feature::{GridShape, PaddingMask};
    use crate::DenseMatchError;
    use ndarray::Array3;

    fn matcher(border_rm: usize) -> CoarseMatcher {
        CoarseMatcher::from_config(&CoarseMatchConfig {
            threshold: 0.2,
            border_rm,
            ..CoarseMatchConfig::default()
        })
    }

    fn diagonal(batch: usize, grid: GridShape) -> ConfidenceMatrix {
        let n = grid.len();
        ConfidenceMatrix::new(Array3::from_shape_fn((batch, n, n), |(_, i, j)| {
            if i == j {
                0.9
            } else {
                0.01
            }
        }))
    }

    #[test]
    fn border_cells_are_removed() {
        let grid = GridShape::new(6, 6);
        let matches = matcher(2)
            .select(&diagonal(1, grid), grid, grid, None, None, &RunPhase::Inference)
            .unwrap();
        let cells: Vec<_> = matches.iter().map(|m| grid.cell(m.i)).collect();
        assert_eq!(cells, vec![(2, 2), (2, 3), (3, 2), (3, 3)]);
    }

    #[test]
    fn threshold_is_exclusive() {
        let grid = GridShape::new(3, 3);
        let conf = ConfidenceMatrix::new(Array3::from_elem((1, 9, 9), 0.2));
        let matches = matcher(0)
            .select(&conf, grid, grid, None, None, &RunPhase::Inference)
            .unwrap();
        assert!(matches.is_empty());
    }

    #[test]
    fn ties_keep_the_first_column() {
        let grid = GridShape::new(1, 3);
        let conf = ConfidenceMatrix::new(Array3::from_elem((1, 3, 3), 0.5));
        let matches = matcher(0)
            .select(&conf, grid, grid, None, None, &RunPhase::Inference)
            .unwrap();
        assert_eq!(matches.len(), 3);
        assert!(matches.iter().all(|m| m.j == 0));
    }

    #[test]
    fn padding_moves_the_far_border_and_masks_exclude_cells() {
        let grid = GridShape::new(8, 8);
        let mask = PaddingMask::from_valid_extents(grid, &[GridShape::new(6, 6)]).unwrap();
        let matches = matcher(2)
            .select(
                &diagonal(1, grid),
                grid,
                grid,
                Some(&mask),
                Some(&mask),
                &RunPhase::Inference,
            )
            .unwrap();
        let cells: Vec<_> = matches.iter().map(|m| grid.cell(m.i)).collect();
        assert_eq!(cells, vec![(2, 2), (2, 3), (3, 2), (3, 3)]);
        let flat = mask.flatten();
        assert!(matches.iter().all(|m| flat[[0, m.i]] && flat[[0, m.j]]));
    }

    #[test]
    fn fully_padded_sample_yields_nothing() {
        let grid = GridShape::new(6, 6);
        let mask =
            PaddingMask::from_valid_extents(grid, &[GridShape::new(6, 6), GridShape::new(0, 0)])
                .unwrap();
        let matches = matcher(1)
            .select(
                &diagonal(2, grid),
                grid,
                grid,
                Some(&mask),
                Some(&mask),
                &RunPhase::Inference,
            )
            .unwrap();
        assert_eq!(matches.count_in_sample(0), 16);
        assert_eq!(matches.count_in_sample(1), 0);
    }

    #[test]
    fn mutual_nearest_filter_is_idempotent() {
        let conf = ConfidenceMatrix::new(Array3::from_shape_vec(
            (1, 2, 2),
            vec![0.9, 0.8, 0.95, 0.1],
        )
        .unwrap());
        let all: CoarseMatches = (0..2)
            .flat_map(|i| (0..2).map(move |j| (i, j)))
            .map(|(i, j)| CoarseMatch {
                batch: 0,
                i,
                j,
                confidence: conf.get(0, i, j),
                ground_truth: false,
            })
            .collect();
        let once = mutual_nearest_filter(&conf, &all);
        let twice = mutual_nearest_filter(&conf, &once);
        assert_eq!(once, twice);
        assert_eq!(once.len(), 1);
        assert_eq!((once.i_ids()[0], once.j_ids()[0]), (1, 0));
    }

    #[test]
    fn training_caps_predictions_and_pads_ground_truth() {
        let grid = GridShape::new(10, 10);
        let cfg = CoarseMatchConfig {
            threshold: 0.2,
            border_rm: 0,
            train_coarse_percent: 0.5,
            train_pad_num_gt_min: 20,
            ..CoarseMatchConfig::default()
        };
        let phase = RunPhase::Training(TrainingInputs {
            ground_truth: vec![CoarsePair { batch: 0, i: 3, j: 4 }],
            seed: 9,
        });
        let matches = CoarseMatcher::from_config(&cfg)
            .select(&diagonal(1, grid), grid, grid, None, None, &phase)
            .unwrap();
        // budget 50: 30 sampled predictions plus max(50 - 100, 20) padded pairs
        assert_eq!(matches.len(), 50);
        let flags = matches.ground_truth_flags();
        assert_eq!(flags.iter().filter(|&&g| g).count(), 20);
        assert!(matches
            .iter()
            .filter(|m| m.ground_truth)
            .all(|m| m.confidence == 0.0 && m.i == 3 && m.j == 4));
    }

    #[test]
    fn training_budget_must_exceed_padding() {
        let grid = GridShape::new(4, 4);
        let phase = RunPhase::Training(TrainingInputs::default());
        let err = matcher(0)
            .select(&diagonal(1, grid), grid, grid, None, None, &phase)
            .unwrap_err();
        assert!(matches!(err, DenseMatchError::InvalidConfig { .. }));
    }
}
