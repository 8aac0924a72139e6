use linfa::prelude::*;
use ndarray::{Array, Array1, Array2, Axis};
use skigp_gp::correlation_models::Matern52Corr;
use skigp_gp::{HyperOptimizer, SkiGaussianProcess};

fn xsinx(x: &Array2<f64>) -> Array1<f64> {
    x.column(0).mapv(|v| (v - 3.5) * ((v - 3.5) / 2.).sin())
}

fn main() {
    env_logger::init();

    let xtrain = Array::linspace(0., 25., 500).insert_axis(Axis(1));
    let ytrain = xsinx(&xtrain);

    let gp = SkiGaussianProcess::<f64, Matern52Corr>::params(Matern52Corr::default())
        .grid_size(300)
        .optimizer(HyperOptimizer::Adam {
            learning_rate: 0.1,
            max_iters: 50,
        })
        .fit(&Dataset::new(xtrain, ytrain))
        .expect("SKI GP fitting");
    println!("{gp}");

    let xtest = Array::linspace(0., 25., 11).insert_axis(Axis(1));
    let (mean, variance) = gp.predict_valvar(&xtest).expect("SKI GP prediction");
    let expected = xsinx(&xtest);
    for i in 0..xtest.nrows() {
        println!(
            "x = {:5.2}  y = {:8.4}  pred = {:8.4} +/- {:.2e}",
            xtest[[i, 0]],
            expected[i],
            mean[i],
            variance[i].sqrt()
        );
    }

    let samples = gp
        .sample_posterior(&xtest, 20, 3)
        .expect("SKI GP sampling");
    println!("posterior samples:\n{samples:.4}");
}
