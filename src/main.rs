//! Load deliveries and matches, train the ensemble and predict runs for one
//! batting scenario.
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use plotters::prelude::*;
use tracing::info;

mod encode;
mod error;
mod io;
mod model;
mod pipeline;
mod stats;

use encode::UnknownCategoryPolicy;
use io::{load_deliveries, load_matches};
use pipeline::{train, PipelineConfig, Scenario, ScenarioPrediction, TrainedPipeline};
use stats::RecencyOrder;

#[derive(Debug, Parser)]
#[command(name = "runs_forecast", about = "Predict a batter's runs from ball-by-ball history")]
struct Cli {
    /// Ball-by-ball CSV
    #[arg(long, default_value = "deliveries.csv")]
    deliveries: PathBuf,

    /// Match CSV with id and venue
    #[arg(long, default_value = "matches.csv")]
    matches: PathBuf,

    #[arg(long)]
    player: String,

    #[arg(long)]
    batting_team: String,

    #[arg(long)]
    bowling_team: String,

    #[arg(long)]
    venue: String,

    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    inning: u32,

    /// Handling of a player/team/venue never seen in training
    #[arg(long, value_enum, default_value_t = UnknownCategoryPolicy::ZeroFill)]
    unknown_category: UnknownCategoryPolicy,

    /// Ordering used for the last-5-matches figures
    #[arg(long, value_enum, default_value_t = RecencyOrder::MatchId)]
    recency: RecencyOrder,

    #[arg(long, default_value_t = 5)]
    folds: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    #[arg(long, default_value_t = 0.2)]
    test_fraction: f64,

    /// Run the hyperparameter search on one thread
    #[arg(long)]
    sequential_search: bool,

    /// Write a bar chart of the per-model predictions to this PNG
    #[arg(long)]
    plot: Option<PathBuf>,
}

impl Cli {
    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            recency: self.recency,
            unknown_policy: self.unknown_category,
            folds: self.folds,
            seed: self.seed,
            test_fraction: self.test_fraction,
            parallel_search: !self.sequential_search,
            ..PipelineConfig::default()
        }
    }

    fn scenario(&self) -> Scenario {
        Scenario {
            player: self.player.clone(),
            batting_team: self.batting_team.clone(),
            bowling_team: self.bowling_team.clone(),
            venue: self.venue.clone(),
            inning: self.inning,
        }
    }
}

fn init_tracing() -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("runs_forecast=info,warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;

    Ok(())
}

/// Draws a horizontal bar per model plus one for the ensemble mean and saves
/// it as a PNG.
fn plot_predictions(path: &Path, out: &ScenarioPrediction) -> anyhow::Result<()> {
    let mut bars: Vec<(String, f64)> = out
        .prediction
        .per_model
        .iter()
        .map(|(name, v)| (name.clone(), *v))
        .collect();
    bars.push(("mean".to_string(), out.prediction.mean));
    let count = bars.len();

    let min_x = bars.iter().map(|(_, v)| *v).fold(0.0_f64, f64::min);
    let max_x = bars.iter().map(|(_, v)| *v).fold(0.0_f64, f64::max);
    let pad = ((max_x - min_x) * 0.1).max(1.0);
    let x_range = (min_x - pad)..(max_x + pad);

    let root = BitMapBackend::new(path, (900, 400)).into_drawing_area();
    root.fill(&WHITE)?;

    let caption = format!(
        "{} vs {} at {}",
        out.scenario.player, out.scenario.bowling_team, out.scenario.venue
    );
    let mut chart = ChartBuilder::on(&root)
        .caption(caption, ("sans-serif", 22))
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(120)
        .build_cartesian_2d(x_range, 0..count)?;

    chart
        .configure_mesh()
        .disable_mesh()
        .y_labels(count)
        .y_label_formatter(&|idx| bars.get(*idx).map(|(n, _)| n.clone()).unwrap_or_default())
        .x_desc("Predicted runs")
        .draw()?;

    chart.draw_series(bars.iter().enumerate().map(|(i, (name, v))| {
        let start = 0.0_f64.min(*v);
        let end = 0.0_f64.max(*v);
        let color = if name == "mean" { RED.mix(0.6) } else { BLUE.mix(0.5) };
        Rectangle::new([(start, i), (end, i + 1)], color.filled())
    }))?;

    root.present()?;
    Ok(())
}

fn print_report(trained: &TrainedPipeline, out: &ScenarioPrediction) {
    println!(
        "Tuned elastic net: penalty {} l1_ratio {} (cv mse {:.3})",
        trained.search.best.penalty, trained.search.best.l1_ratio, trained.search.best_mse
    );
    println!("\nHoldout scores:");
    for score in &trained.holdout {
        println!("{:<14} mse {:>9.3}  r2 {:>7.3}", score.name, score.mse, score.r2);
    }

    println!("\nPredicted runs for {}:", out.scenario.player);
    for (name, v) in &out.prediction.per_model {
        println!("{:<14} {:>8.2}", name, v);
    }
    for (name, reason) in &out.prediction.failures {
        println!("{:<14} failed: {}", name, reason);
    }
    println!("{:<14} {:>8.2}", "mean", out.prediction.mean);

    match &out.batting {
        Some(b) => println!(
            "\nAverage {:.2}  strike rate {:.2}  last 5 matches: {} runs",
            b.average, b.strike_rate, b.last5_runs
        ),
        None => println!("\nNo batting record for {}", out.scenario.player),
    }
    match (&out.bowling, out.bowling_available) {
        (Some(b), _) => println!(
            "Economy {:.2}  wickets {}  last 5 matches: {} wickets",
            b.economy, b.wickets, b.last5_wickets
        ),
        (None, true) => println!("No bowling record for {}", out.scenario.player),
        (None, false) => println!("Bowling figures unavailable"),
    }
}

fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();

    info!(path = %cli.deliveries.display(), "loading deliveries");
    let deliveries = load_deliveries(&cli.deliveries)
        .with_context(|| format!("reading {}", cli.deliveries.display()))?;
    let matches = load_matches(&cli.matches)
        .with_context(|| format!("reading {}", cli.matches.display()))?;
    info!(deliveries = deliveries.len(), matches = matches.len(), "loaded input");

    let trained = train(&deliveries, &matches, &cli.pipeline_config())?;
    let out = trained.predict(&cli.scenario())?;
    print_report(&trained, &out);

    if let Some(path) = &cli.plot {
        plot_predictions(path, &out)?;
        println!("Wrote {}", path.display());
    }

    Ok(())
}
