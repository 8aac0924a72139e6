use linfa::prelude::Float;
use log::debug;
use ndarray::{arr1, Array1, Zip};

pub(crate) struct CobylaParams {
    pub rhobeg: f64,
    pub ftol_rel: f64,
    pub maxeval: usize,
}

impl Default for CobylaParams {
    fn default() -> Self {
        CobylaParams {
            rhobeg: 0.5,
            ftol_rel: 1e-4,
            maxeval: 200,
        }
    }
}

/// Optimize gp hyper parameters given an initial guess and bounds with cobyla
pub(crate) fn optimize_params<ObjF, F>(
    objfn: ObjF,
    param0: &Array1<F>,
    bounds: &[(F, F)],
    cobyla: CobylaParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
    F: Float,
{
    use cobyla::{minimize, Func, StopTols};

    let cons: Vec<&dyn Func<()>> = vec![];
    let param0: Vec<f64> = param0.iter().map(into_f64).collect();

    let bounds: Vec<_> = bounds
        .iter()
        .map(|(lo, up)| (into_f64(lo), into_f64(up)))
        .collect();

    match minimize(
        |x, u| objfn(x, None, u),
        &param0,
        &bounds,
        &cons,
        (),
        cobyla.maxeval,
        cobyla::RhoBeg::All(cobyla.rhobeg),
        Some(StopTols {
            ftol_rel: cobyla.ftol_rel,
            ..StopTols::default()
        }),
    ) {
        Ok((_, x_opt, fval)) => {
            let params_opt = arr1(&x_opt);
            let fval = if f64::is_nan(fval) {
                f64::INFINITY
            } else {
                fval
            };
            (fval, params_opt)
        }
        Err((status, x_opt, _)) => {
            log::warn!("ERROR Cobyla optimizer in GP status={status:?}");
            (f64::INFINITY, arr1(&x_opt))
        }
    }
}

pub(crate) struct AdamParams {
    pub learning_rate: f64,
    pub max_iters: usize,
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
}

impl AdamParams {
    pub fn new(learning_rate: f64, max_iters: usize) -> Self {
        AdamParams {
            learning_rate,
            max_iters,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// Minimizes with Adam steps projected on the bounds. `objgrad` returns the
/// objective and its gradient, or `None` when they cannot be evaluated, which
/// stops the descent. Returns the best point visited.
pub(crate) fn adam_minimize<G>(
    mut objgrad: G,
    param0: &Array1<f64>,
    bounds: &[(f64, f64)],
    adam: AdamParams,
) -> (f64, Array1<f64>)
where
    G: FnMut(&Array1<f64>) -> Option<(f64, Array1<f64>)>,
{
    let mut x = param0.to_owned();
    let mut m = Array1::<f64>::zeros(x.len());
    let mut v = Array1::<f64>::zeros(x.len());
    let mut best = (f64::INFINITY, x.to_owned());
    for iter in 1..=adam.max_iters {
        let (fval, grad) = match objgrad(&x) {
            Some(eval) => eval,
            None => {
                debug!("Adam stopped at iteration {iter}: objective not available");
                break;
            }
        };
        if fval < best.0 {
            best = (fval, x.to_owned());
        }
        m = &m * adam.beta1 + &grad * (1. - adam.beta1);
        v = &v * adam.beta2 + &grad.mapv(|g| g * g) * (1. - adam.beta2);
        let m_hat_scale = 1. / (1. - adam.beta1.powi(iter as i32));
        let v_hat_scale = 1. / (1. - adam.beta2.powi(iter as i32));
        Zip::from(&mut x)
            .and(&m)
            .and(&v)
            .and(bounds)
            .for_each(|xi, &mi, &vi, &(lo, up)| {
                let step = adam.learning_rate * mi * m_hat_scale
                    / ((vi * v_hat_scale).sqrt() + adam.eps);
                *xi = (*xi - step).max(lo).min(up);
            });
    }
    if let Some((fval, _)) = objgrad(&x) {
        if fval < best.0 {
            best = (fval, x);
        }
    }
    debug!("Adam best objective {}", best.0);
    best
}

#[inline(always)]
fn into_f64<F: Float>(v: &F) -> f64 {
    v.to_f64().unwrap_or(f64::NAN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_cobyla_quadratic() {
        let objfn = |x: &[f64], _gradient: Option<&mut [f64]>, _params: &mut ()| -> f64 {
            (x[0] - 0.5).powi(2) + (x[1] + 1.).powi(2)
        };
        let (fmin, xopt) = optimize_params(
            objfn,
            &array![0., 0.],
            &[(-2., 2.), (-2., 2.)],
            CobylaParams {
                ftol_rel: 1e-10,
                ..CobylaParams::default()
            },
        );
        assert_abs_diff_eq!(xopt, array![0.5, -1.], epsilon = 1e-3);
        assert!(fmin < 1e-5);
    }

    #[test]
    fn test_adam_projected_on_bounds() {
        // unconstrained minimum at (1, 5), upper bound 2 on the second component
        let objgrad = |x: &Array1<f64>| {
            let f = (x[0] - 1.).powi(2) + (x[1] - 5.).powi(2);
            Some((f, array![2. * (x[0] - 1.), 2. * (x[1] - 5.)]))
        };
        let (fmin, xopt) = adam_minimize(
            objgrad,
            &array![0., 0.],
            &[(-3., 3.), (-3., 2.)],
            AdamParams::new(0.05, 1000),
        );
        assert_abs_diff_eq!(xopt, array![1., 2.], epsilon = 1e-2);
        assert_abs_diff_eq!(fmin, 9., epsilon = 1e-2);
    }

    #[test]
    fn test_adam_stops_without_objective() {
        let mut calls = 0;
        let objgrad = |x: &Array1<f64>| {
            calls += 1;
            if calls > 3 {
                None
            } else {
                Some((x[0] * x[0], array![2. * x[0]]))
            }
        };
        let (fmin, xopt) = adam_minimize(objgrad, &array![1.], &[(-2., 2.)], AdamParams::new(0.1, 100));
        assert!(fmin < 1.);
        assert!(xopt[0] < 1.);
    }
}
