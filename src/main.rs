use clap::{Parser, Subcommand, ValueEnum};
use logigam::data::{DEFAULT_TARGET_COLUMN, load_prediction_data, load_training_data};
use logigam::{GamConfig, IntervalSpec, LogisticGam, PerFeature, SolverKind, TrainedModel};
use ndarray::Array1;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::process;

#[derive(Parser)]
#[command(
    name = "logigam",
    about = "Train and apply logistic GAMs",
    long_about = "Fits logistic generalized additive models with penalized B-spline smooths \
                 for every feature column of a TSV file, and applies them to new data."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Solver {
    /// QR + SVD with rank truncation
    Stable,
    /// Direct inverse of the penalized Hessian
    Direct,
}

impl From<Solver> for SolverKind {
    fn from(solver: Solver) -> Self {
        match solver {
            Solver::Stable => SolverKind::Stable,
            Solver::Direct => SolverKind::Direct,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model from a TSV file with a binary response column
    #[command(about = "Train a logistic GAM (outputs: model.toml)")]
    Train {
        /// Path to the training TSV file
        training_data: String,

        /// Name of the 0/1 response column; every other column is a feature
        #[arg(long, default_value = DEFAULT_TARGET_COLUMN)]
        target: String,

        /// Smoothing strength, one value for all features or one per feature
        #[arg(long, value_delimiter = ',', default_value = "0.6")]
        lam: Vec<f64>,

        /// Interior knots for continuous features, one value or one per feature
        #[arg(long, value_delimiter = ',', default_value = "20")]
        n_knots: Vec<usize>,

        /// Spline order (degree + 1), one value or one per feature
        #[arg(long, value_delimiter = ',', default_value = "4")]
        spline_order: Vec<usize>,

        /// Maximum number of IRLS iterations
        #[arg(long, default_value = "100")]
        n_iter: usize,

        /// Convergence tolerance on the relative coefficient change
        #[arg(long, default_value = "1e-5")]
        tol: f64,

        /// Penalized least-squares strategy
        #[arg(long, value_enum, default_value = "stable")]
        solver: Solver,

        /// Seed for feature typing and the degrees-of-freedom estimator
        #[arg(long)]
        seed: Option<u64>,

        /// Where to write the trained model
        #[arg(long, default_value = "model.toml")]
        output: String,
    },

    /// Apply a trained model to new data
    #[command(about = "Apply a trained model to new data (outputs: predictions.tsv)")]
    Infer {
        /// Path to the TSV file with the same feature columns used in training
        test_data: String,

        /// Path to the trained model file (.toml)
        #[arg(long)]
        model: String,

        /// Response column to ignore if present
        #[arg(long, default_value = DEFAULT_TARGET_COLUMN)]
        target: String,

        /// Two-sided coverage of the reported confidence interval
        #[arg(long, default_value = "0.95")]
        width: f64,

        /// Where to write the predictions
        #[arg(long, default_value = "predictions.tsv")]
        output: String,
    },
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Train {
            training_data,
            target,
            lam,
            n_knots,
            spline_order,
            n_iter,
            tol,
            solver,
            seed,
            output,
        } => {
            let mut config = GamConfig::default()
                .with_lam(per_feature(lam))
                .with_n_knots(per_feature(n_knots))
                .with_spline_order(per_feature(spline_order))
                .with_n_iter(n_iter)
                .with_tol(tol)
                .with_solver(solver.into());
            if let Some(seed) = seed {
                config = config.with_seed(seed);
            }
            train_command(&training_data, &target, config, &output)
        }
        Commands::Infer {
            test_data,
            model,
            target,
            width,
            output,
        } => infer_command(&test_data, &model, &target, width, &output),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

/// A single value is broadcast; several are taken per feature.
fn per_feature<T>(mut values: Vec<T>) -> PerFeature<T> {
    if values.len() == 1 {
        PerFeature::Broadcast(values.remove(0))
    } else {
        PerFeature::PerFeature(values)
    }
}

fn train_command(
    training_data_path: &str,
    target: &str,
    config: GamConfig,
    output_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading training data from: {}", training_data_path);
    let data = load_training_data(training_data_path, target)?;
    println!(
        "Loaded {} samples with {} features: {}",
        data.y.len(),
        data.features.names.len(),
        data.features.names.join(", ")
    );

    println!("Training model...");
    let mut gam = LogisticGam::new(config);
    let report = gam.fit(data.features.x.view(), &data.features.storage, data.y.view())?;

    if report.converged() {
        println!("Converged after {} iterations.", report.iterations);
    } else {
        println!(
            "Did not converge after {} iterations; saving the last coefficients.",
            report.iterations
        );
    }
    let nll = report.neg_log_likelihood_history();
    let change = report.coefficient_change_history();
    for (iter, (nll, change)) in nll.iter().zip(&change).enumerate() {
        log::debug!("Iteration {}: nll {:.6e}, change {:.3e}", iter + 1, nll, change);
    }
    if let Some(accuracy) = report.accuracy_history().last() {
        println!("Training accuracy: {:.4}", accuracy);
    }
    if let (Some(nll), Some(change)) = (nll.last(), change.last()) {
        println!(
            "Final negative log-likelihood: {:.4}, coefficient change: {:.3e}",
            nll, change
        );
    }
    if let (Some(aic), Some(aicc)) = (report.aic, report.aicc) {
        println!("AIC: {:.4}, AICc: {:.4}", aic, aicc);
    }

    let model = gam
        .model()?
        .clone()
        .with_feature_names(data.features.names)?;
    model.save(output_path)?;
    println!("Model saved to: {}", output_path);
    Ok(())
}

fn infer_command(
    test_data_path: &str,
    model_path: &str,
    target: &str,
    width: f64,
    output_path: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Loading model from: {}", model_path);
    let model = TrainedModel::load(model_path)?;
    println!("Model expects {} features", model.num_features());

    println!("Loading test data from: {}", test_data_path);
    let data = load_prediction_data(test_data_path, target, &model.feature_names)?;
    println!("Loaded {} samples for prediction", data.x.nrows());

    println!("Generating predictions...");
    let predictions = model.predict_proba(data.x.view())?;
    let intervals = if model.statistics.is_some() {
        Some(model.confidence_intervals(data.x.view(), &IntervalSpec::Width(width), -1)?)
    } else {
        println!("Model did not converge during training; skipping confidence intervals.");
        None
    };

    save_predictions(&predictions, intervals.as_deref(), output_path)?;
    println!("Predictions saved to: {}", output_path);
    Ok(())
}

fn save_predictions(
    predictions: &Array1<f64>,
    intervals: Option<&[Array1<f64>]>,
    output_path: &str,
) -> Result<(), std::io::Error> {
    let mut file = BufWriter::new(File::create(output_path)?);
    match intervals {
        Some([lower, upper]) => {
            writeln!(file, "prediction\tlower\tupper")?;
            for ((p, lo), hi) in predictions.iter().zip(lower).zip(upper) {
                writeln!(file, "{:.6}\t{:.6}\t{:.6}", p, lo, hi)?;
            }
        }
        _ => {
            writeln!(file, "prediction")?;
            for p in predictions {
                writeln!(file, "{:.6}", p)?;
            }
        }
    }
    file.flush()
}
