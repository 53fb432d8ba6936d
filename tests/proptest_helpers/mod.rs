#![allow(dead_code)]

use nalgebra::Vector3;
use proptest::prelude::*;
use proptest::strategy::BoxedStrategy;
use proptest::test_runner::{Config as ProptestConfig, FileFailurePersistence};

pub const EPS_ORTHO: f64 = 1e-9;

pub fn proptest_config() -> ProptestConfig {
    let cases = std::env::var("PROPTEST_CASES")
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(64);

    let mut config = ProptestConfig::with_failure_persistence(FileFailurePersistence::WithSource(
        "proptest-regressions",
    ));
    config.cases = cases;
    config.max_shrink_iters = 1024;
    config
}

/// Quaternions `[w, x, y, z]` of arbitrary (non-vanishing) norm.
pub fn arb_quaternion() -> BoxedStrategy<[f64; 4]> {
    prop::array::uniform4(-10.0f64..10.0)
        .prop_filter("quaternion norm too small", |q| {
            q.iter().map(|v| v * v).sum::<f64>().sqrt() > 1e-3
        })
        .boxed()
}

pub fn arb_translation() -> BoxedStrategy<[f64; 3]> {
    prop::array::uniform3(-100.0f64..100.0).boxed()
}

/// Camera positions with at least two distinct entries.
pub fn arb_positions(max_len: usize) -> BoxedStrategy<Vec<Vector3<f64>>> {
    prop::collection::vec(prop::array::uniform3(-50.0f64..50.0), 2..=max_len)
        .prop_map(|raw| raw.into_iter().map(Vector3::from).collect::<Vec<_>>())
        .prop_filter("positions must not all coincide", |positions| {
            positions
                .iter()
                .any(|p| (p - positions[0]).norm() > 1e-6)
        })
        .boxed()
}

/// Positions built from a few repeated locations, which pushes the median
/// distance towards zero.
pub fn arb_clustered_positions() -> BoxedStrategy<Vec<Vector3<f64>>> {
    (
        prop::array::uniform3(-5.0f64..5.0),
        prop::array::uniform3(-5.0f64..5.0),
        1usize..6,
        1usize..3,
    )
        .prop_filter("locations must differ", |(a, b, _, _)| {
            (Vector3::from(*a) - Vector3::from(*b)).norm() > 1e-3
        })
        .prop_map(|(a, b, n_a, n_b)| {
            let mut out = vec![Vector3::from(a); n_a];
            out.extend(std::iter::repeat(Vector3::from(b)).take(n_b));
            out
        })
        .boxed()
}
