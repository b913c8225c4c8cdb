use densematch::params::{ParamLoader, StateDict};
use densematch::{
    CoarseMatch, CoarseMatches, FeatureMap, FineMatcher, FinePreprocess, GridShape, MatcherConfig,
};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn fine_config(concat: bool) -> MatcherConfig {
    let mut cfg = MatcherConfig::default();
    cfg.coarse.d_model = 8;
    cfg.coarse.nhead = 2;
    cfg.fine.d_model = 4;
    cfg.fine.nhead = 2;
    cfg.fine.window_size = 5;
    cfg.fine.concat_coarse_feat = concat;
    cfg
}

fn preprocess(cfg: &MatcherConfig, seed: u64) -> FinePreprocess {
    let dict = StateDict::initialize(&FinePreprocess::param_specs(cfg), seed);
    let mut loader = ParamLoader::new(&dict);
    let pre = FinePreprocess::load(&mut loader, cfg).unwrap();
    loader.finish().unwrap();
    pre
}

fn corner_matches(grid: GridShape) -> CoarseMatches {
    let last = grid.len() - 1;
    [(0, 0), (0, last), (last, 0), (last, last), (5, 6)]
        .into_iter()
        .map(|(i, j)| CoarseMatch {
            batch: 0,
            i,
            j,
            confidence: 1.0,
            ground_truth: false,
        })
        .collect()
}

#[test]
fn boundary_windows_keep_offsets_in_range() {
    let cfg = fine_config(true);
    let pre = preprocess(&cfg, 3);
    let grid = GridShape::new(4, 4);
    let mut rng = StdRng::seed_from_u64(8);
    let fine0 = FeatureMap::from_fn((1, 4, 16, 16), |_| rng.random_range(-2.0f32..2.0)).unwrap();
    let fine1 = FeatureMap::from_fn((1, 4, 16, 16), |_| rng.random_range(-2.0f32..2.0)).unwrap();
    let coarse = Array3::from_shape_fn((1, 16, 8), |(_, i, c)| ((i + c) % 3) as f32);
    let matches = corner_matches(grid);

    let windows = pre
        .forward(
            &fine0,
            &fine1,
            coarse.view(),
            coarse.view(),
            grid,
            grid,
            &matches,
        )
        .unwrap();
    assert_eq!(windows.len(), 5);
    assert_eq!(windows.win0.dim(), (5, 25, 4));
    assert_eq!(windows.valid0.row(0).iter().filter(|&&v| v).count(), 9);
    assert_eq!(windows.valid1.row(2).iter().filter(|&&v| v).count(), 9);
    assert_eq!(windows.valid1.row(3).iter().filter(|&&v| v).count(), 25);
    assert_eq!(windows.origins[4], (0, 4));

    let out = FineMatcher::new(5)
        .forward(windows.win0.view(), windows.win1.view(), windows.valid1.view())
        .unwrap();
    assert_eq!(out.offsets.dim(), (5, 2));
    assert!(out.offsets.iter().all(|v| (-1.0..=1.0).contains(v)));
    assert!(out.std.iter().all(|v| v.is_finite() && *v > 0.0));
}

#[test]
fn out_of_map_positions_never_attract_the_match() {
    // Every in-map score is negative, so zero-filled padding would win if it
    // were not excluded.
    let cfg = fine_config(false);
    let pre = preprocess(&cfg, 0);
    let grid = GridShape::new(3, 3);
    let constant = |value: f32| {
        FeatureMap::from_fn((1, 4, 12, 12), |(_, c, _, _)| if c == 0 { value } else { 0.0 })
            .unwrap()
    };
    let fine0 = constant(1.0);
    let fine1 = constant(-1.0);
    let coarse = Array3::<f32>::zeros((1, 9, 8));
    let matches: CoarseMatches = [CoarseMatch {
        batch: 0,
        i: 0,
        j: 0,
        confidence: 0.9,
        ground_truth: false,
    }]
    .into_iter()
    .collect();

    let windows = pre
        .forward(&fine0, &fine1, coarse.view(), coarse.view(), grid, grid, &matches)
        .unwrap();
    let out = FineMatcher::new(5)
        .forward(windows.win0.view(), windows.win1.view(), windows.valid1.view())
        .unwrap();
    // Uniform over the in-map quadrant: columns and rows {0, 0.5, 1}.
    assert!((out.offsets[[0, 0]] - 0.5).abs() < 1e-5);
    assert!((out.offsets[[0, 1]] - 0.5).abs() < 1e-5);
}

#[test]
fn centre_peaked_window_has_zero_offset() {
    let ww = 9;
    let mut win1 = Array3::<f32>::zeros((2, ww, 3));
    let mut win0 = Array3::<f32>::zeros((2, ww, 3));
    for m in 0..2 {
        win0[[m, ww / 2, 1]] = 6.0;
        win1[[m, ww / 2, 1]] = 6.0;
        for k in 0..ww {
            win1[[m, k, 2]] = 0.5;
        }
    }
    let valid = Array2::from_elem((2, ww), true);
    let out = FineMatcher::new(3)
        .forward(win0.view(), win1.view(), valid.view())
        .unwrap();
    for m in 0..2 {
        assert!(out.offsets[[m, 0]].abs() < 1e-4);
        assert!(out.offsets[[m, 1]].abs() < 1e-4);
    }
}

#[test]
fn window_size_mismatch_is_reported() {
    let win = Array3::<f32>::zeros((1, 9, 4));
    let valid = Array2::from_elem((1, 9), true);
    assert!(FineMatcher::new(5)
        .forward(win.view(), win.view(), valid.view())
        .is_err());
}
