use ndarray::{Array, Array1, Array2, LinalgScalar};
use ndarray_linalg::Scalar;

use crate::Result;

/// Compute the outer product of two one-dimensional vectors of length (m x 1) and (n x 1)
///
/// The outer product is the (m x n) matrix whose elements are products of elements in the first
/// vector with those in the second. The solver uses it to expand a per-observation uncertainty
/// vector into a covariance matrix.
///
/// # Examples
///
/// ```
/// use circweigh::math::outer_product;
/// use ndarray::{arr1, arr2, Array1};
///
/// let u: Array1<f64> = arr1(&[1., 2., 3.]);
/// let v = arr1(&[4., 5., 6.]);
/// let outer_product = outer_product(&u, &v).unwrap();
///
/// let expected = arr2(&[[4., 5., 6.], [8., 10., 12.], [12., 15., 18.]]);
/// assert_eq!(outer_product, expected);
///```
pub fn outer_product<T: LinalgScalar>(u: &Array1<T>, v: &Array1<T>) -> Result<Array2<T>> {
    let u: Array2<T> = u.clone().into_shape((u.len(), 1))?;
    let v: Array2<T> = v.clone().into_shape((1, v.len()))?;

    Ok(ndarray::linalg::kron(&u, &v))
}

/// Generate the drift columns for reading times `t`: powers `t^1 .. t^order`.
///
/// This is a Vandermonde matrix with its constant column removed — the
/// constant offsets live in the group-indicator columns of a drift design
/// matrix, so the time block starts at the linear term. The result is
/// `(t.len() x order)`; `order = 0` yields a matrix with zero columns.
///
/// # Panics
///
/// Panics if `order` cannot be converted to `i32`, which cannot happen for
/// the drift orders in use (0..=3).
///
/// # Examples
///
/// ```
/// use circweigh::math::time_powers;
/// use ndarray::arr2;
///
/// let times: Vec<f64> = vec![2., 3.];
/// let powers = time_powers(&times, 2).unwrap();
///
/// let expected = arr2(&[[2., 4.], [3., 9.]]);
/// assert_eq!(powers, expected);
/// ```
pub fn time_powers<T: Copy + Scalar>(t: &[T], order: usize) -> Result<Array2<T>> {
    let vals = t.iter().flat_map(|ti| {
        (1..=order).map(|i| ti.powi(i32::try_from(i).expect("{i} doesn't fit in `i32`")))
    });

    Ok(Array::from_iter(vals).into_shape((t.len(), order))?)
}

#[cfg(test)]
mod tests {
    use super::outer_product;
    use super::time_powers;

    use ndarray::Array;
    use ndarray_rand::rand::SeedableRng;
    use ndarray_rand::rand_distr::Uniform;
    use ndarray_rand::{rand::Rng, RandomExt};
    use rand_isaac::isaac64::Isaac64Rng;

    #[test]
    fn outer_products_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let m = rng.gen::<u8>() as usize;
        let n = rng.gen::<u8>() as usize;
        let u = Array::random_using(m, Uniform::new(0., 10.), &mut rng);
        let v = Array::random_using(n, Uniform::new(0., 10.), &mut rng);

        let outer = outer_product(&u, &v).unwrap();

        for ii in 0..m {
            for jj in 0..n {
                approx::assert_relative_eq!(outer[[ii, jj]], u[ii] * v[jj]);
            }
        }
    }

    #[test]
    fn time_power_matrices_are_generated_correctly() {
        let seed = 40;
        let mut rng = Isaac64Rng::seed_from_u64(seed);
        let num_readings = 12;
        let order = 3;

        let times = (0..num_readings).map(|_| rng.gen()).collect::<Vec<f64>>();

        let powers = time_powers(&times, order).unwrap();

        for (ii, time) in times.iter().enumerate() {
            for jj in 0..order {
                let expected = time.powi(i32::try_from(jj + 1).unwrap());
                let actual = powers[[ii, jj]];
                approx::assert_relative_eq!(expected, actual);
            }
        }
    }

    #[test]
    fn zero_order_time_powers_have_no_columns() {
        let times = vec![0., 1., 2.];
        let powers = time_powers(&times, 0).unwrap();
        assert_eq!(powers.dim(), (3, 0));
    }
}
