//! Property tests for the geometry substrate.

use proptest::prelude::*;

use pdfsandwich_core::geometry::{Matrix, Point};

fn arb_matrix() -> impl Strategy<Value = Matrix> {
    (
        -10.0f64..10.0,
        -10.0f64..10.0,
        -10.0f64..10.0,
        -10.0f64..10.0,
        -1000.0f64..1000.0,
        -1000.0f64..1000.0,
    )
        .prop_map(|(a, b, c, d, e, f)| Matrix::new(a, b, c, d, e, f))
}

fn arb_point() -> impl Strategy<Value = Point> {
    (-1000.0f64..1000.0, -1000.0f64..1000.0).prop_map(|(x, y)| Point::new(x, y))
}

proptest! {
    /// Identity is neutral on both sides of composition.
    #[test]
    fn identity_is_neutral(m in arb_matrix(), p in arb_point()) {
        let left = m.then(&Matrix::identity()).apply(p);
        let right = Matrix::identity().then(&m).apply(p);
        let direct = m.apply(p);
        prop_assert!((left.x - direct.x).abs() < 1e-6);
        prop_assert!((right.y - direct.y).abs() < 1e-6);
    }

    /// Composition agrees with sequential application.
    #[test]
    fn composition_matches_sequential_apply(
        m1 in arb_matrix(),
        m2 in arb_matrix(),
        p in arb_point(),
    ) {
        let composed = m1.then(&m2).apply(p);
        let sequential = m2.apply(m1.apply(p));
        prop_assert!((composed.x - sequential.x).abs() < 1e-6);
        prop_assert!((composed.y - sequential.y).abs() < 1e-6);
    }

    /// Rotation preserves distances from the origin.
    #[test]
    fn rotation_is_an_isometry(angle in -3.14f64..3.14, p in arb_point()) {
        let rotated = Matrix::rotation(angle).apply(p);
        let before = (p.x * p.x + p.y * p.y).sqrt();
        let after = (rotated.x * rotated.x + rotated.y * rotated.y).sqrt();
        prop_assert!((before - after).abs() < 1e-6);
    }

    /// The unit-square area equals the product of axis scales for
    /// axis-aligned scaling matrices.
    #[test]
    fn scaling_area_is_product(sx in 0.01f64..100.0, sy in 0.01f64..100.0) {
        let m = Matrix::scaling(sx, sy);
        prop_assert!((m.unit_area() - sx * sy).abs() < 1e-6);
        prop_assert!((m.x_scale() - sx).abs() < 1e-9);
        prop_assert!((m.y_scale() - sy).abs() < 1e-9);
    }

    /// Page-rotation matrices are involutive in the right combinations:
    /// rotating by r then by 360-r lands back on the identity action.
    #[test]
    fn page_rotation_round_trips(p in arb_point()) {
        let w = 612.0;
        let h = 792.0;
        let to = Matrix::for_page_rotation(90, w, h);
        let back = Matrix::for_page_rotation(270, h, w);
        let round = to.then(&back).apply(p);
        prop_assert!((round.x - p.x).abs() < 1e-6);
        prop_assert!((round.y - p.y).abs() < 1e-6);
    }
}
