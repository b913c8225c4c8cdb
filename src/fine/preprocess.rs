//! Local window cropping around coarse matches.

use crate::coarse::CoarseMatches;
use crate::config::MatcherConfig;
use crate::feature::{FeatureMap, GridShape};
use crate::nn::Linear;
use crate::params::{ParamLoader, ParamSpec};
use crate::trace::{trace_event, trace_span};
use crate::util::{DenseMatchError, DenseMatchResult};
use ndarray::{s, Array1, Array2, Array3, ArrayView3, ArrayView4, Axis};
#[cfg(feature = "rayon")]
use rayon::prelude::*;

/// Fine feature windows of every coarse match, batched across samples.
///
/// `win0`/`win1` are `(M, W*W, C_fine)` with window positions in row-major
/// order; `valid0`/`valid1` are `(M, W*W)` and mark positions that fall
/// inside the fine map. `origins[m]` is `(batch, index within the sample)`.
#[derive(Clone, Debug, PartialEq)]
pub struct FineWindows {
    pub win0: Array3<f32>,
    pub win1: Array3<f32>,
    pub valid0: Array2<bool>,
    pub valid1: Array2<bool>,
    pub origins: Vec<(usize, usize)>,
    pub window_size: usize,
}

impl FineWindows {
    /// Number of windows (`M`).
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }

    fn empty(window_size: usize, channels: usize) -> Self {
        let ww = window_size * window_size;
        Self {
            win0: Array3::zeros((0, ww, channels)),
            win1: Array3::zeros((0, ww, channels)),
            valid0: Array2::from_elem((0, ww), false),
            valid1: Array2::from_elem((0, ww), false),
            origins: Vec::new(),
            window_size,
        }
    }
}

/// Projection of the coarse match tokens fused into each window.
#[derive(Clone, Debug)]
struct CoarseFusion {
    down_proj: Linear,
    merge_feat: Linear,
}

/// Crops `W x W` fine windows centred on each coarse match.
#[derive(Clone, Debug)]
pub struct FinePreprocess {
    window_size: usize,
    stride: usize,
    d_model: usize,
    fusion: Option<CoarseFusion>,
    parallel: bool,
}

/// Crops one window from a `(C, H, W)` map; positions outside are zero and invalid.
fn crop_window(
    map: ArrayView3<'_, f32>,
    center: (usize, usize),
    window_size: usize,
) -> (Array2<f32>, Array1<bool>) {
    let (c, h, w) = map.dim();
    let half = (window_size / 2) as isize;
    let mut tokens = Array2::<f32>::zeros((window_size * window_size, c));
    let mut valid = Array1::from_elem(window_size * window_size, false);
    for dy in 0..window_size {
        let y = center.0 as isize + dy as isize - half;
        if y < 0 || y >= h as isize {
            continue;
        }
        for dx in 0..window_size {
            let x = center.1 as isize + dx as isize - half;
            if x < 0 || x >= w as isize {
                continue;
            }
            let k = dy * window_size + dx;
            tokens
                .row_mut(k)
                .assign(&map.slice(s![.., y as usize, x as usize]));
            valid[k] = true;
        }
    }
    (tokens, valid)
}

impl FinePreprocess {
    /// Parameters of the coarse fusion, empty when it is disabled.
    pub fn param_specs(config: &MatcherConfig) -> Vec<ParamSpec> {
        let cc = config.coarse.d_model;
        let cf = config.fine.d_model;
        if !config.fine.concat_coarse_feat {
            return Vec::new();
        }
        let mut specs = ParamSpec::linear("fine_preprocess.down_proj", cc, cf, true);
        specs.extend(ParamSpec::linear("fine_preprocess.merge_feat", 2 * cf, cf, true));
        specs
    }

    pub fn load(loader: &mut ParamLoader<'_>, config: &MatcherConfig) -> DenseMatchResult<Self> {
        let cc = config.coarse.d_model;
        let cf = config.fine.d_model;
        let fusion = if config.fine.concat_coarse_feat {
            Some(CoarseFusion {
                down_proj: loader.linear("fine_preprocess.down_proj", cc, cf, true)?,
                merge_feat: loader.linear("fine_preprocess.merge_feat", 2 * cf, cf, true)?,
            })
        } else {
            None
        };
        Ok(Self {
            window_size: config.fine.window_size,
            stride: config.coarse_to_fine_stride(),
            d_model: cf,
            fusion,
            parallel: false,
        })
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    pub fn window_size(&self) -> usize {
        self.window_size
    }

    pub fn is_parallel(&self) -> bool {
        self.parallel
    }

    fn check_stride(&self, fine: &FeatureMap, grid: GridShape) -> DenseMatchResult<()> {
        if fine.channels() != self.d_model {
            return Err(DenseMatchError::shape(
                "fine_preprocess",
                "fine channels",
                &[self.d_model],
                &[fine.channels()],
            ));
        }
        let expected = [grid.height * self.stride, grid.width * self.stride];
        if fine.height() != expected[0] || fine.width() != expected[1] {
            return Err(DenseMatchError::shape(
                "fine_preprocess",
                "fine map size",
                &expected,
                &[fine.height(), fine.width()],
            ));
        }
        Ok(())
    }

    /// Crops the windows of every match.
    ///
    /// `coarse0`/`coarse1` are the enhanced coarse tokens `(N, L, C_coarse)`
    /// and `(N, S, C_coarse)`; they are only read when coarse fusion is on.
    #[allow(clippy::too_many_arguments)]
    pub fn forward(
        &self,
        fine0: &FeatureMap,
        fine1: &FeatureMap,
        coarse0: ArrayView3<'_, f32>,
        coarse1: ArrayView3<'_, f32>,
        grid0: GridShape,
        grid1: GridShape,
        matches: &CoarseMatches,
    ) -> DenseMatchResult<FineWindows> {
        self.check_stride(fine0, grid0)?;
        self.check_stride(fine1, grid1)?;
        if fine0.batch() != fine1.batch() {
            return Err(DenseMatchError::shape(
                "fine_preprocess",
                "batch size",
                &[fine0.batch()],
                &[fine1.batch()],
            ));
        }
        if let Some(m) = matches.iter().find(|m| {
            m.batch >= fine0.batch() || m.i >= grid0.len() || m.j >= grid1.len()
        }) {
            return Err(DenseMatchError::shape(
                "fine_preprocess",
                "coarse match",
                &[fine0.batch(), grid0.len(), grid1.len()],
                &[m.batch, m.i, m.j],
            ));
        }

        if let Some(fusion) = &self.fusion {
            let cc = fusion.down_proj.in_features();
            for (tokens, n) in [(coarse0.view(), grid0.len()), (coarse1.view(), grid1.len())] {
                let (nb, l, c) = tokens.dim();
                if nb != fine0.batch() || l != n || c != cc {
                    return Err(DenseMatchError::shape(
                        "fine_preprocess",
                        "coarse tokens",
                        &[fine0.batch(), n, cc],
                        &[nb, l, c],
                    ));
                }
            }
        }

        let _span = trace_span!("fine_preprocess", matches = matches.len()).entered();
        if matches.is_empty() {
            return Ok(FineWindows::empty(self.window_size, self.d_model));
        }

        let map0 = fine0.view();
        let map1 = fine1.view();
        let crop = |k: usize| {
            let b = matches.batch_ids()[k];
            let (r0, c0) = grid0.cell(matches.i_ids()[k]);
            let (r1, c1) = grid1.cell(matches.j_ids()[k]);
            let center0 = (r0 * self.stride, c0 * self.stride);
            let center1 = (r1 * self.stride, c1 * self.stride);
            (
                crop_window(sample_of(map0, b), center0, self.window_size),
                crop_window(sample_of(map1, b), center1, self.window_size),
            )
        };

        #[cfg(feature = "rayon")]
        let crops: Vec<_> = if self.parallel {
            (0..matches.len()).into_par_iter().map(crop).collect()
        } else {
            (0..matches.len()).map(crop).collect()
        };
        #[cfg(not(feature = "rayon"))]
        let crops: Vec<_> = (0..matches.len()).map(crop).collect();

        let m = matches.len();
        let ww = self.window_size * self.window_size;
        let mut windows = FineWindows::empty(self.window_size, self.d_model);
        windows.win0 = Array3::zeros((m, ww, self.d_model));
        windows.win1 = Array3::zeros((m, ww, self.d_model));
        windows.valid0 = Array2::from_elem((m, ww), false);
        windows.valid1 = Array2::from_elem((m, ww), false);
        for (k, ((t0, v0), (t1, v1))) in crops.into_iter().enumerate() {
            windows.win0.index_axis_mut(Axis(0), k).assign(&t0);
            windows.win1.index_axis_mut(Axis(0), k).assign(&t1);
            windows.valid0.row_mut(k).assign(&v0);
            windows.valid1.row_mut(k).assign(&v1);
        }

        let mut per_sample = vec![0usize; fine0.batch()];
        windows.origins = matches
            .batch_ids()
            .iter()
            .map(|&b| {
                let idx = per_sample[b];
                per_sample[b] += 1;
                (b, idx)
            })
            .collect();

        if let Some(fusion) = &self.fusion {
            let gather = |tokens: ArrayView3<'_, f32>, ids: &[usize]| {
                let c = tokens.dim().2;
                let mut out = Array2::<f32>::zeros((m, c));
                for (k, (&b, &idx)) in matches.batch_ids().iter().zip(ids).enumerate() {
                    out.row_mut(k).assign(&tokens.slice(s![b, idx, ..]));
                }
                out
            };
            let down0 = fusion.down_proj.forward_2d(gather(coarse0, matches.i_ids()).view());
            let down1 = fusion.down_proj.forward_2d(gather(coarse1, matches.j_ids()).view());
            windows.win0 = fuse(&fusion.merge_feat, &windows.win0, &down0);
            windows.win1 = fuse(&fusion.merge_feat, &windows.win1, &down1);
        }

        trace_event!("fine_windows", count = m, window = self.window_size);
        Ok(windows)
    }
}

fn sample_of(map: ArrayView4<'_, f32>, b: usize) -> ArrayView3<'_, f32> {
    map.index_axis_move(Axis(0), b)
}

/// `merge_feat([window, broadcast(coarse)])` for every window.
fn fuse(merge_feat: &Linear, windows: &Array3<f32>, coarse: &Array2<f32>) -> Array3<f32> {
    let (m, ww, cf) = windows.dim();
    let mut cat = Array3::<f32>::zeros((m, ww, 2 * cf));
    cat.slice_mut(s![.., .., ..cf]).assign(windows);
    for (mut dst, token) in cat.outer_iter_mut().zip(coarse.outer_iter()) {
        dst.slice_mut(s![.., cf..]).assign(&token);
    }
    merge_feat.forward(cat.view())
}

#[cfg(test)]
mod tests {
    use super::FinePreprocess;
    use crate::coarse::{CoarseMatch, CoarseMatches};
    use crate::config::MatcherConfig;
    use crate::feature::{FeatureMap, GridShape};
    use crate::params::{ParamLoader, StateDict};
    use ndarray::Array3;

    fn config(concat: bool) -> MatcherConfig {
        let mut cfg = MatcherConfig::default();
        cfg.coarse.d_model = 8;
        cfg.coarse.nhead = 2;
        cfg.fine.d_model = 4;
        cfg.fine.nhead = 2;
        cfg.fine.window_size = 5;
        cfg.fine.concat_coarse_feat = concat;
        cfg
    }

    fn preprocess(cfg: &MatcherConfig) -> FinePreprocess {
        let dict = StateDict::initialize(&FinePreprocess::param_specs(cfg), 5);
        let mut loader = ParamLoader::new(&dict);
        let pre = FinePreprocess::load(&mut loader, cfg).unwrap();
        loader.finish().unwrap();
        pre
    }

    fn coded_fine(grid: GridShape) -> FeatureMap {
        // channel 0 = y, channel 1 = x
        FeatureMap::from_fn((1, 4, grid.height * 4, grid.width * 4), |(_, c, y, x)| match c {
            0 => y as f32,
            1 => x as f32,
            _ => 1.0,
        })
        .unwrap()
    }

    fn single(i: usize, j: usize) -> CoarseMatches {
        std::iter::once(CoarseMatch {
            batch: 0,
            i,
            j,
            confidence: 0.9,
            ground_truth: false,
        })
        .collect()
    }

    #[test]
    fn window_is_centred_on_the_scaled_cell() {
        let cfg = config(false);
        let grid = GridShape::new(4, 4);
        let fine = coded_fine(grid);
        let coarse = Array3::<f32>::zeros((1, 16, 8));
        let matches = single(grid.index(1, 2), grid.index(2, 1));
        let w = preprocess(&cfg)
            .forward(&fine, &fine, coarse.view(), coarse.view(), grid, grid, &matches)
            .unwrap();
        assert_eq!(w.win0.dim(), (1, 25, 4));
        assert_eq!((w.win0[[0, 12, 0]], w.win0[[0, 12, 1]]), (4.0, 8.0));
        assert_eq!((w.win1[[0, 12, 0]], w.win1[[0, 12, 1]]), (8.0, 4.0));
        assert_eq!((w.win0[[0, 0, 0]], w.win0[[0, 0, 1]]), (2.0, 6.0));
        assert!(w.valid0.iter().all(|&v| v));
        assert_eq!(w.origins, vec![(0, 0)]);
    }

    #[test]
    fn border_window_is_zero_filled_and_marked_invalid() {
        let cfg = config(false);
        let grid = GridShape::new(4, 4);
        let fine = coded_fine(grid);
        let coarse = Array3::<f32>::zeros((1, 16, 8));
        let w = preprocess(&cfg)
            .forward(&fine, &fine, coarse.view(), coarse.view(), grid, grid, &single(0, 0))
            .unwrap();
        let valid = w.valid0.row(0);
        assert_eq!(valid.iter().filter(|&&v| v).count(), 9);
        assert!(!valid[0]);
        assert!(valid[12]);
        assert_eq!(w.win0[[0, 0, 2]], 0.0);
        assert_eq!(w.win0[[0, 12, 2]], 1.0);
    }

    #[test]
    fn coarse_fusion_keeps_window_shape() {
        let cfg = config(true);
        let grid = GridShape::new(3, 3);
        let fine = coded_fine(grid);
        let coarse = Array3::from_shape_fn((1, 9, 8), |(_, l, c)| (l + c) as f32 * 0.1);
        let w = preprocess(&cfg)
            .forward(&fine, &fine, coarse.view(), coarse.view(), grid, grid, &single(4, 4))
            .unwrap();
        assert_eq!(w.win0.dim(), (1, 25, 4));
        assert_eq!(w.win1.dim(), (1, 25, 4));
    }

    #[test]
    fn no_matches_give_empty_windows() {
        let cfg = config(true);
        let grid = GridShape::new(3, 3);
        let fine = coded_fine(grid);
        let coarse = Array3::<f32>::zeros((1, 9, 8));
        let w = preprocess(&cfg)
            .forward(&fine, &fine, coarse.view(), coarse.view(), grid, grid, &CoarseMatches::new())
            .unwrap();
        assert!(w.is_empty());
        assert_eq!(w.win0.dim(), (0, 25, 4));
    }

    #[test]
    fn fine_map_must_match_the_stride() {
        let cfg = config(false);
        let grid = GridShape::new(3, 3);
        let fine = coded_fine(GridShape::new(3, 2));
        let coarse = Array3::<f32>::zeros((1, 9, 8));
        assert!(preprocess(&cfg)
            .forward(&fine, &fine, coarse.view(), coarse.view(), grid, grid, &single(4, 4))
            .is_err());
    }
}
