use ndarray::Array1;

use levelct::{CoverTree, CoverTreeBuilder, Metric};

// In this example, we fill a tree with 1000 random points in a
// 50-dimensional Euclidean space and query it for nearest neighbours,
// both on its own and fused with an insertion.
fn vectors() {
    let mut rng = oorandom::Rand64::new(0);
    let points: Vec<Array1<f64>> = (0..1000)
        .map(|_| Array1::from_shape_simple_fn(50, || rng.rand_float()))
        .collect();

    let mut ct = CoverTreeBuilder::new(Metric::Euclidean)
        .seed(0)
        .build_from(points)
        .unwrap();

    // Search 10 nearest neighbours for a query point.
    let query = Array1::from_shape_simple_fn(50, || rng.rand_float());
    let result = ct.knn(&query, 10).unwrap();
    println!("nearest distance: {}", result.neighbours()[0].dist());

    // Query 10 nearest neighbours and insert the query in one descent.
    let _ = ct.knn_insert(query, 10).unwrap();

    // Search for 10 query points at once.
    let queries: Vec<Array1<f64>> = (0..10)
        .map(|_| Array1::from_shape_simple_fn(50, || rng.rand_float()))
        .collect();
    let _ = ct.knn_batch(&queries, 10).unwrap();
}

// The distance function can be any closure over an opaque point type;
// here: 1-D points under absolute difference.
fn scalars() {
    let mut ct = CoverTree::new(|a: &f64, b: &f64| (a - b).abs());

    for p in vec![0.0, 1.0, 2.0, 3.5] {
        ct.insert(p).unwrap();
    }

    println!("2.0 sits at level {:?}", ct.find(&2.0).unwrap());

    let result = ct.knn(&1.6, 2).unwrap();
    for n in result.neighbours() {
        println!("point {} at distance {}", n.point(), n.dist());
    }
}

fn main() {
    vectors();
    scalars();
}
