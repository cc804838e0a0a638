use clap::Parser;
use liquid_frame::{
    error::LiquidError,
    frame::{ColumnData, Frame},
    hex::Comparison,
    kv::Key,
    Cloud, CloudConfig,
};
use log::Level;
use rand::{rngs::StdRng, Rng, SeedableRng};

/// Starts a cloud in this process, scores randomly generated predictions
/// against randomly generated actual values and prints the confusion matrix,
/// the mean squared error and the rollups of every column.
#[derive(Parser)]
#[command(version = "0.1", about)]
struct Opts {
    /// The number of nodes in the cloud
    #[arg(short = 'n', long = "nodes", default_value_t = 3)]
    nodes: usize,
    /// The number of worker threads per node, every core if not given
    #[arg(short = 't', long = "threads")]
    threads: Option<usize>,
    /// The number of rows per chunk
    #[arg(short = 'c', long = "chunk_rows", default_value_t = 10_000)]
    chunk_rows: u64,
    /// The number of rows to generate
    #[arg(short = 'r', long = "rows", default_value_t = 100_000)]
    rows: usize,
    /// The fraction of predictions that are wrong
    #[arg(short = 'e', long = "error_rate", default_value_t = 0.2)]
    error_rate: f64,
    /// Seeds the generated data
    #[arg(short = 's', long = "seed", default_value_t = 42)]
    seed: u64,
    /// The log level
    #[arg(short = 'l', long = "level", default_value = "info")]
    level: Level,
}

const LEVELS: [&str; 4] = ["cat", "dog", "emu", "owl"];

fn classes(rng: &mut StdRng, rows: usize, error_rate: f64) -> (ColumnData, ColumnData) {
    let mut actual = Vec::with_capacity(rows);
    let mut predicted = Vec::with_capacity(rows);
    for _ in 0..rows {
        let a = LEVELS[rng.gen_range(0..LEVELS.len())];
        let p = if rng.gen_bool(error_rate) {
            LEVELS[rng.gen_range(0..LEVELS.len())]
        } else {
            a
        };
        actual.push(Some(a));
        // the predictions never use the last level
        predicted.push(if p == LEVELS[3] { None } else { Some(p) });
    }
    (
        ColumnData::categorical(&actual),
        ColumnData::categorical(&predicted),
    )
}

fn reals(rng: &mut StdRng, rows: usize) -> (ColumnData, ColumnData) {
    let actual: Vec<f64> = (0..rows)
        .map(|_| rng.gen_range(-100.0..100.0))
        .collect();
    let predicted = actual
        .iter()
        .map(|x| Some(*x + rng.gen_range(-1.0f64..1.0)))
        .collect();
    (
        ColumnData::Numeric(actual.into_iter().map(Some).collect()),
        ColumnData::Numeric(predicted),
    )
}

/// The wrong-prediction fraction must be a probability
fn check_error_rate(error_rate: f64) -> Result<f64, LiquidError> {
    if (0.0..=1.0).contains(&error_rate) {
        Ok(error_rate)
    } else {
        Err(LiquidError::Config(format!(
            "the error rate must be between 0 and 1, got {}",
            error_rate
        )))
    }
}

#[tokio::main]
async fn main() -> Result<(), LiquidError> {
    let opts: Opts = Opts::parse();
    let error_rate = check_error_rate(opts.error_rate)?;
    if let Err(e) = simple_logger::init_with_level(opts.level) {
        eprintln!("Could not start logging: {}", e);
    }
    let mut config = CloudConfig::default()
        .with_nodes(opts.nodes)
        .with_chunk_rows(opts.chunk_rows);
    if let Some(threads) = opts.threads {
        config = config.with_threads(threads);
    }
    let cloud = Cloud::new(config)?;
    let mut rng = StdRng::seed_from_u64(opts.seed);

    let (actual, predicted) = classes(&mut rng, opts.rows, error_rate);
    let actual_class = cloud.new_column("actual_class", actual).await?;
    let predicted_class = cloud.new_column("predicted_class", predicted).await?;
    let cm = Comparison::compute(&cloud, &actual_class.key, &predicted_class.key).await?;
    println!("{}\n", cm);

    let (actual, predicted) = reals(&mut rng, opts.rows);
    let actual_value = cloud.new_column("actual_value", actual).await?;
    let predicted_value = cloud.new_column("predicted_value", predicted).await?;
    let mse = Comparison::compute(&cloud, &actual_value.key, &predicted_value.key).await?;
    println!("{}\n", mse);

    let mut frame = Frame::new(Key::new("scores", 0));
    for column in [&actual_class, &predicted_class, &actual_value, &predicted_value] {
        let name = column.key.name.clone();
        frame.add(&name, column)?;
    }
    cloud.put_frame(&frame).await?;
    for (name, column) in frame.names().iter().zip(frame.columns(cloud.kv()).await?) {
        let r = cloud.rollups(&column).await?;
        println!(
            "{:>16} {:>12} {:>8} rows {:>8} NAs  min {:>10.3}  max {:>10.3}  \
             mean {:>10.3}  sigma {:>10.3}",
            name,
            column.kind.to_string(),
            r.rows,
            r.na_cnt,
            r.min(),
            r.max(),
            r.mean,
            r.sigma
        );
    }
    println!("checksum {:016x}", cloud.checksum(&frame).await?);
    cloud.delete_frame(&frame.key).await?;
    Ok(())
}
