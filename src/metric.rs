use crate::Scalar;
use ndarray::{Array1, ArrayView1};

use ndarray_linalg::Norm;
use ndarray_stats::DeviationExt;

/// Distance oracle over an arbitrary point type.
///
/// The tree treats the oracle as a black box: it must return a
/// non-negative number and is assumed, but never checked, to be
/// symmetric and to respect the triangle inequality. A zero distance
/// means the two points are the same point.
pub trait Distance<P> {
    /// Calculate the distance between two points.
    fn distance(&self, a: &P, b: &P) -> Scalar;
}

impl<P, F> Distance<P> for F
where
    F: Fn(&P, &P) -> Scalar,
{
    fn distance(&self, a: &P, b: &P) -> Scalar {
        self(a, b)
    }
}

/// Enum for built-in distance functions over dense vectors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Metric {
    /// L-1 or Manhattan distance. See [\[Wikipedia\]](https://en.wikipedia.org/wiki/Taxicab_geometry).
    Manhattan,
    /// L-2 or Euclidean distance. See [\[Wikipedia\]](https://en.wikipedia.org/wiki/Euclidean_distance)
    Euclidean,
    /// L-inf or Chebyshev distance. See [\[Wikipedia\]](https://en.wikipedia.org/wiki/Chebyshev_distance)
    Chebyshev,
    /// Angular distance: the angle between two vectors, normalised to ```[0, 1]```.
    Angular,
}

impl Metric {
    /// Calculate the distance between two points.
    pub fn distance(&self, a: ArrayView1<'_, Scalar>, b: ArrayView1<'_, Scalar>) -> Scalar {
        match self {
            Metric::Manhattan => a.l1_dist(&b).unwrap(),
            Metric::Euclidean => a.l2_dist(&b).unwrap() as Scalar,
            Metric::Chebyshev => a.linf_dist(&b).unwrap(),
            Metric::Angular => {
                let mut dot = a.dot(&b) / (a.norm_l2() * b.norm_l2());
                // floating point issue (e.g. 1.0000000000000002).
                if dot > 1. {
                    dot = 1.;
                } else if dot < -1. {
                    dot = -1.;
                }

                dot.acos() / std::f64::consts::PI
            }
        }
    }
}

impl Distance<Array1<Scalar>> for Metric {
    fn distance(&self, a: &Array1<Scalar>, b: &Array1<Scalar>) -> Scalar {
        Metric::distance(self, a.view(), b.view())
    }
}
