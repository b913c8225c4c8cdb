use densematch::params::ParamSpec;
use densematch::{
    DenseMatchError, DenseMatcher, FeatureMap, GridShape, ImageView, MatcherConfig, PaddingMask,
    PositionEncodingSine, StateDict,
};
use ndarray::{Array3, Array4, ArrayD, IxDyn};

fn small_config() -> MatcherConfig {
    MatcherConfig::from_json_str(
        r#"{
            "coarse": {
                "d_model": 8,
                "nhead": 2,
                "temp_bug_fix": true,
                "layer_order": ["self", "cross"],
                "attention_variant": "linear"
            },
            "match_coarse": { "mode": "sinkhorn", "threshold": 0.1 },
            "fine": { "d_model": 4, "nhead": 2, "window_size": 3 }
        }"#,
    )
    .unwrap()
}

#[test]
fn image_view_rejects_invalid_dimensions() {
    let data = [0u8; 4];

    let err = ImageView::from_slice(&data, 0, 1).err().unwrap();
    assert_eq!(
        err,
        DenseMatchError::InvalidDimensions {
            width: 0,
            height: 1,
        }
    );

    assert!(ImageView::new(&data, 2, 2, 2).is_ok());

    let err = ImageView::new(&data[..3], 2, 2, 2).err().unwrap();
    assert_eq!(err, DenseMatchError::BufferTooSmall { needed: 4, got: 3 });
}

#[test]
fn feature_map_rejects_empty_dimensions() {
    assert!(FeatureMap::new(Array4::zeros((1, 4, 0, 3))).is_err());
    assert!(matches!(
        FeatureMap::new(Array4::zeros((0, 4, 2, 3))),
        Err(DenseMatchError::ShapeMismatch { .. })
    ));
    let map = FeatureMap::new(Array4::zeros((2, 4, 3, 5))).unwrap();
    assert_eq!(map.grid(), GridShape::new(3, 5));
    assert_eq!(map.to_tokens().dim(), (2, 15, 4));
}

#[test]
fn tokens_are_row_major() {
    let map = FeatureMap::from_fn((1, 2, 3, 4), |(_, c, y, x)| (c * 100 + y * 10 + x) as f32)
        .unwrap();
    let tokens = map.to_tokens();
    let grid = map.grid();
    for idx in 0..grid.len() {
        let (r, c) = grid.cell(idx);
        assert_eq!(grid.index(r, c), idx);
        assert_eq!(tokens[[0, idx, 0]], (r * 10 + c) as f32);
        assert_eq!(tokens[[0, idx, 1]], (100 + r * 10 + c) as f32);
    }
}

#[test]
fn padding_mask_extents_follow_valid_region() {
    let grid = GridShape::new(6, 8);
    let mask =
        PaddingMask::from_valid_extents(grid, &[GridShape::new(6, 8), GridShape::new(4, 5)])
            .unwrap();
    assert_eq!(mask.valid_extent(0), (6, 8));
    assert_eq!(mask.valid_extent(1), (4, 5));
    let flat = mask.flatten();
    assert!(flat[[1, grid.index(3, 4)]]);
    assert!(!flat[[1, grid.index(3, 5)]]);
    assert!(!flat[[1, grid.index(4, 0)]]);

    let empty = PaddingMask::new(Array3::from_elem((1, 6, 8), false)).unwrap();
    assert_eq!(empty.valid_extent(0), (0, 0));
}

#[test]
fn positional_table_must_cover_the_grid() {
    let pe = PositionEncodingSine::new(8, (4, 4), true).unwrap();
    let map = FeatureMap::new(Array4::zeros((1, 8, 5, 4))).unwrap();
    assert_eq!(
        pe.encode(&map).err(),
        Some(DenseMatchError::ExceedsMaxShape {
            height: 5,
            width: 4,
            max_height: 4,
            max_width: 4,
        })
    );
}

#[test]
fn state_dict_loads_from_json() {
    let cfg = small_config();
    let dict = DenseMatcher::initial_state_dict(&cfg, 11).unwrap();
    let json = serde_json::to_string(&dict).unwrap();
    let parsed: StateDict = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, dict);
    assert!(parsed.get("coarse_matching.bin_score").is_some());
    DenseMatcher::from_state_dict(cfg, parsed).unwrap();
}

#[test]
fn loading_is_strict_for_matcher_parameters() {
    let cfg = small_config();
    let dict = DenseMatcher::initial_state_dict(&cfg, 2).unwrap();

    let mut missing = StateDict::new();
    for name in dict.names().filter(|n| *n != "loftr_fine.layers.1.merge.weight") {
        missing.insert(name, dict.get(name).unwrap().clone());
    }
    assert_eq!(
        DenseMatcher::from_state_dict(cfg.clone(), missing).err(),
        Some(DenseMatchError::MissingParameter {
            name: "loftr_fine.layers.1.merge.weight".to_owned(),
        })
    );

    let mut reshaped = dict.clone();
    reshaped.insert("loftr_coarse.layers.0.q_proj.weight", ArrayD::zeros(IxDyn(&[8, 4])));
    assert!(matches!(
        DenseMatcher::from_state_dict(cfg.clone(), reshaped),
        Err(DenseMatchError::ParameterShape { .. })
    ));

    let mut extra = dict.clone();
    extra.insert("loftr_coarse.layers.2.q_proj.weight", ArrayD::zeros(IxDyn(&[8, 8])));
    assert!(matches!(
        DenseMatcher::from_state_dict(cfg.clone(), extra),
        Err(DenseMatchError::UnexpectedParameter { .. })
    ));

    let mut with_backbone = dict;
    with_backbone.insert("backbone.layer1.conv.weight", ArrayD::zeros(IxDyn(&[4, 1, 3, 3])));
    DenseMatcher::from_state_dict(cfg, with_backbone).unwrap();
}

#[test]
fn param_specs_cover_every_stage() {
    let cfg = small_config();
    let specs: Vec<ParamSpec> = DenseMatcher::param_specs(&cfg);
    let coarse = specs.iter().filter(|s| s.name.starts_with("loftr_coarse.")).count();
    let fine = specs.iter().filter(|s| s.name.starts_with("loftr_fine.")).count();
    // 6 linear weights and 2 norms (weight + bias) per layer, 2 layers each.
    assert_eq!(coarse, 2 * 10);
    assert_eq!(fine, 2 * 10);
    assert_eq!(
        specs.iter().filter(|s| s.name.starts_with("fine_preprocess.")).count(),
        4
    );
}

#[test]
fn invalid_config_is_rejected_before_loading() {
    let mut cfg = small_config();
    cfg.fine.nhead = 3;
    assert!(matches!(
        DenseMatcher::with_random_weights(cfg, 0),
        Err(DenseMatchError::InvalidConfig { .. })
    ));
}
