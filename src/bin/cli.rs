//! Command-line front end: train, test and run shape predictors.
//!
//! Usage:
//!   landmark-ert train faces/training.xml -o model.bin
//!   landmark-ert train faces/training.xml -o model.dat --config options.json -v
//!   landmark-ert test faces/testing.xml model.bin --per-stage
//!   landmark-ert predict face.jpg model.dat --rect 100,80,200,200 --json

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use landmark_ert::{
    load_image_dataset, stage_error_curve, test_shape_predictor, BoundingBox, ErrorNormalization,
    GrayImage, PaddingMode, ShapePredictor, TrainingOptions,
};
use serde::Serialize;

#[derive(Parser, Debug)]
#[command(name = "landmark-ert")]
#[command(author, version, about = "Ensemble-of-regression-trees shape predictor", long_about = None)]
struct Cli {
    /// Show progress output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Train a shape predictor on an imglab XML dataset
    Train(TrainArgs),
    /// Measure the landmark error of a model on an imglab XML dataset
    Test(TestArgs),
    /// Predict landmarks for one object in an image
    Predict(PredictArgs),
}

#[derive(clap::Args, Debug)]
struct TrainArgs {
    /// Training dataset (imglab XML)
    dataset: PathBuf,

    /// Output model; `.dat`/`.dat.bz2` writes dlib's format
    #[arg(short, long)]
    output: PathBuf,

    /// JSON file with training options; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    cascade_depth: Option<u32>,
    #[arg(long)]
    tree_depth: Option<u32>,
    #[arg(long)]
    num_trees_per_cascade_level: Option<u32>,
    #[arg(long)]
    nu: Option<f64>,
    #[arg(long)]
    oversampling_amount: Option<u32>,
    #[arg(long)]
    oversampling_translation_jitter: Option<f64>,
    #[arg(long)]
    feature_pool_size: Option<u32>,
    #[arg(long)]
    feature_pool_region_padding: Option<f64>,
    #[arg(long)]
    lambda_param: Option<f64>,
    #[arg(long)]
    num_test_splits: Option<u32>,
    #[arg(long, value_enum)]
    padding_mode: Option<PaddingArg>,
    #[arg(long)]
    random_seed: Option<String>,
    /// Worker threads, 0 for all cores
    #[arg(long)]
    num_threads: Option<usize>,
}

#[derive(clap::Args, Debug)]
struct TestArgs {
    /// Test dataset (imglab XML)
    dataset: PathBuf,

    /// Model file (native or dlib)
    model: PathBuf,

    #[arg(long, value_enum, default_value_t = NormalizationArg::BoxDiagonal)]
    normalization: NormalizationArg,

    /// Left eye landmarks for inter-ocular normalization, e.g. `36-41`
    #[arg(long, default_value = "36-41")]
    left_eye: String,

    /// Right eye landmarks for inter-ocular normalization, e.g. `42-47`
    #[arg(long, default_value = "42-47")]
    right_eye: String,

    /// Report the error after every cascade stage
    #[arg(long)]
    per_stage: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[derive(clap::Args, Debug)]
struct PredictArgs {
    /// Input image file
    image: PathBuf,

    /// Model file (native or dlib)
    model: PathBuf,

    /// Object bounding box as `x,y,width,height`
    #[arg(long)]
    rect: String,

    /// Output as JSON
    #[arg(long)]
    json: bool,

    /// Output file (default: stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum PaddingArg {
    LandmarkRelative,
    BoundingBoxRelative,
}

impl From<PaddingArg> for PaddingMode {
    fn from(arg: PaddingArg) -> Self {
        match arg {
            PaddingArg::LandmarkRelative => PaddingMode::LandmarkRelative,
            PaddingArg::BoundingBoxRelative => PaddingMode::BoundingBoxRelative,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum NormalizationArg {
    Pixels,
    BoxDiagonal,
    InterOcular,
}

/// Output structure for `test --json`
#[derive(Serialize)]
struct TestOutput {
    dataset: String,
    model: String,
    normalization: ErrorNormalization,
    mean_error: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    stage_errors: Option<Vec<f64>>,
}

/// Output structure for `predict --json`
#[derive(Serialize)]
struct PredictOutput {
    image: String,
    width: u32,
    height: u32,
    bounding_box: BoundingBox,
    landmarks: Vec<[f32; 2]>,
}

fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::INFO
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Command::Train(args) => run_train(args, cli.verbose),
        Command::Test(args) => run_test(args),
        Command::Predict(args) => run_predict(args),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn training_options(args: &TrainArgs, verbose: bool) -> Result<TrainingOptions, Box<dyn std::error::Error>> {
    let mut options: TrainingOptions = match &args.config {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => TrainingOptions::default(),
    };

    macro_rules! override_option {
        ($($field:ident),+ $(,)?) => {
            $(if let Some(value) = args.$field.clone() {
                options.$field = value;
            })+
        };
    }
    override_option!(
        cascade_depth,
        tree_depth,
        num_trees_per_cascade_level,
        nu,
        oversampling_amount,
        oversampling_translation_jitter,
        feature_pool_size,
        feature_pool_region_padding,
        lambda_param,
        num_test_splits,
        random_seed,
        num_threads,
    );
    if let Some(mode) = args.padding_mode {
        options.padding_mode = mode.into();
    }
    options.be_verbose |= verbose;
    Ok(options)
}

fn run_train(args: TrainArgs, verbose: bool) -> Result<(), Box<dyn std::error::Error>> {
    let options = training_options(&args, verbose)?;
    let model = landmark_ert::train(&args.dataset, &args.output, options)?;

    println!(
        "Trained {} landmarks, {} stages, {} trees -> {}",
        model.num_landmarks(),
        model.num_cascade_stages(),
        model.num_trees(),
        args.output.display()
    );
    Ok(())
}

/// Parse a landmark list such as `36-41` or `36,37,39`.
fn parse_landmarks(spec: &str) -> Result<Vec<usize>, Box<dyn std::error::Error>> {
    let mut out = Vec::new();
    for part in spec.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => out.extend(lo.trim().parse::<usize>()?..=hi.trim().parse::<usize>()?),
            None => out.push(part.parse()?),
        }
    }
    Ok(out)
}

fn run_test(args: TestArgs) -> Result<(), Box<dyn std::error::Error>> {
    let normalization = match args.normalization {
        NormalizationArg::Pixels => ErrorNormalization::Pixels,
        NormalizationArg::BoxDiagonal => ErrorNormalization::BoxDiagonal,
        NormalizationArg::InterOcular => ErrorNormalization::InterOcular {
            left: parse_landmarks(&args.left_eye)?,
            right: parse_landmarks(&args.right_eye)?,
        },
    };

    let model = ShapePredictor::open(&args.model)?;
    let dataset = load_image_dataset(&args.dataset)?;

    let stage_errors = if args.per_stage {
        Some(stage_error_curve(&model, &dataset, &normalization)?)
    } else {
        None
    };
    let mean_error = match stage_errors.as_ref().and_then(|c| c.last()) {
        Some(&last) => last,
        None => test_shape_predictor(&model, dataset.images(), dataset.objects(), &normalization)?,
    };

    if args.json {
        let output = TestOutput {
            dataset: args.dataset.display().to_string(),
            model: args.model.display().to_string(),
            normalization,
            mean_error,
            stage_errors,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Dataset: {} ({} objects)", args.dataset.display(), dataset.num_objects());
    println!("Mean error: {:.6}", mean_error);
    if let Some(curve) = stage_errors {
        println!("\nPer-stage error:");
        for (k, error) in curve.iter().enumerate() {
            let label = if k == 0 { "mean shape".to_string() } else { format!("stage {}", k) };
            println!("  {:>10}: {:.6}", label, error);
        }
    }
    Ok(())
}

fn parse_rect(spec: &str) -> Result<BoundingBox, Box<dyn std::error::Error>> {
    let values = spec
        .split(',')
        .map(|v| v.trim().parse::<f32>())
        .collect::<Result<Vec<_>, _>>()?;
    match values.as_slice() {
        &[x, y, w, h] if w > 0.0 && h > 0.0 => Ok(BoundingBox::new(x, y, w, h)),
        _ => Err(format!("invalid rectangle {:?}, expected x,y,width,height", spec).into()),
    }
}

fn run_predict(args: PredictArgs) -> Result<(), Box<dyn std::error::Error>> {
    let rect = parse_rect(&args.rect)?;
    let model = ShapePredictor::open(&args.model)?;

    let gray_img = image::open(&args.image)?.to_luma8();
    let (width, height) = gray_img.dimensions();
    let gray = GrayImage::from(gray_img);

    let landmarks = landmark_ert::predict(&gray, &rect, &model);

    let output_str = if args.json {
        let output = PredictOutput {
            image: args.image.display().to_string(),
            width,
            height,
            bounding_box: rect,
            landmarks: landmarks.points.iter().map(|p| [p.x, p.y]).collect(),
        };
        serde_json::to_string_pretty(&output)?
    } else {
        let mut s = format!(
            "Image: {} ({}x{})\nLandmarks: {} points\n",
            args.image.display(),
            width,
            height,
            landmarks.num_landmarks()
        );
        for (i, p) in landmarks.points.iter().enumerate() {
            s.push_str(&format!("  {:>3}: ({:.1}, {:.1})\n", i, p.x, p.y));
        }
        s
    };

    if let Some(ref path) = args.output {
        std::fs::write(path, &output_str)?;
    } else {
        println!("{}", output_str);
    }
    Ok(())
}
