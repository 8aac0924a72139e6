use linfa::Float;
use ndarray::{Array1, Array2, ArrayBase, Axis, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// A structure to store (n, xdim) matrix data and its mean and standard deviation vectors.
#[derive(Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub(crate) struct NormalizedData<F: Float> {
    /// normalized data
    pub data: Array2<F>,
    /// mean vector computed from data
    pub mean: Array1<F>,
    /// standard deviation vector computed from data
    pub std: Array1<F>,
}

impl<F: Float> Clone for NormalizedData<F> {
    fn clone(&self) -> NormalizedData<F> {
        NormalizedData {
            data: self.data.to_owned(),
            mean: self.mean.to_owned(),
            std: self.std.to_owned(),
        }
    }
}

impl<F: Float> NormalizedData<F> {
    /// Constructor
    pub fn new(x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> NormalizedData<F> {
        let (data, mean, std) = normalize(x);
        NormalizedData { data, mean, std }
    }

    /// Dimension of data points
    pub fn ncols(&self) -> usize {
        self.data.ncols()
    }

    /// Maps `x` given in original units to the normalized space
    pub fn apply(&self, x: &ArrayBase<impl Data<Elem = F>, Ix2>) -> Array2<F> {
        (x - &self.mean) / &self.std
    }
}

/// Centers and scales each column of `x`, a zero standard deviation being replaced by 1
pub fn normalize<F: Float>(
    x: &ArrayBase<impl Data<Elem = F>, Ix2>,
) -> (Array2<F>, Array1<F>, Array1<F>) {
    let n = F::cast(x.nrows().max(1));
    let x_mean = x.sum_axis(Axis(0)) / n;
    let ddof = if x.nrows() > 1 { F::one() } else { F::zero() };
    let mut x_std = x.std_axis(Axis(0), ddof);
    x_std.mapv_inplace(|v| if v == F::zero() { F::one() } else { v });
    let xnorm = (x - &x_mean) / &x_std;

    (xnorm, x_mean, x_std)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_normalized_data() {
        let x = array![[1., 5.], [2., 5.], [3., 5.]];
        let xnorm = NormalizedData::new(&x);
        assert_abs_diff_eq!(xnorm.mean, array![2., 5.]);
        // constant column keeps a unit scale
        assert_abs_diff_eq!(xnorm.std, array![1., 1.]);
        assert_abs_diff_eq!(xnorm.data, array![[-1., 0.], [0., 0.], [1., 0.]]);
        assert_abs_diff_eq!(xnorm.apply(&array![[4., 6.]]), array![[2., 1.]]);
        assert_eq!(xnorm.ncols(), 2);
    }
}
