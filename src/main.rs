use clap::{Parser, Subcommand};
use forecaster::{
    commands::{evaluate, forecast_all, import_closes, predict, train},
    config::ForecastSettings,
    context::{CapabilityProbe, ExecutionContext, HostProbe},
};
use log::info;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "forecaster")]
#[command(about = "Multi-horizon price growth forecasting")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Pre-train on market tickers, fine-tune on targets and save the weights
    Train {
        /// Target tickers to fine-tune on (all snapshot tickers when omitted)
        #[arg(value_delimiter = ',', num_args = 0..)]
        tickers: Vec<String>,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
    },
    /// Forecast 1M/6M/1Y growth with the trainable predictor
    Predict {
        /// Tickers to forecast (all snapshot tickers when omitted)
        #[arg(value_delimiter = ',', num_args = 0..)]
        tickers: Vec<String>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Write JSON here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Run both pretrained models over the tickers and emit forecast records
    ForecastAll {
        #[arg(value_delimiter = ',', num_args = 0..)]
        tickers: Vec<String>,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Report forecast accuracy on a synthetic series
    Evaluate {
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Convert a `{ticker: [closes]}` JSON file into a market data snapshot
    ImportCloses {
        /// JSON file with close prices per ticker
        input: PathBuf,
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

fn resolve_market_data_path(path: Option<PathBuf>) -> PathBuf {
    path.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE))
}

fn detect_context(settings: &ForecastSettings) -> anyhow::Result<ExecutionContext> {
    HostProbe {
        preferred_device: settings.execution_device.clone(),
        worker_threads: settings.worker_threads,
    }
    .detect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let settings = ForecastSettings::from_env()?;
    info!("Starting forecaster. Forecasts are not financial advice.");

    match cli.command {
        Commands::Train { tickers, data_file } => {
            let market_data_path = resolve_market_data_path(data_file);
            train::run(&settings, detect_context(&settings)?, &market_data_path, &tickers).await?;
        }
        Commands::Predict {
            tickers,
            data_file,
            output,
        } => {
            let market_data_path = resolve_market_data_path(data_file);
            let context = detect_context(&settings)?;
            predict::run(&settings, context, &market_data_path, &tickers, output).await?;
        }
        Commands::ForecastAll {
            tickers,
            data_file,
            output,
        } => {
            let market_data_path = resolve_market_data_path(data_file);
            let context = detect_context(&settings)?;
            forecast_all::run(&settings, context, &market_data_path, &tickers, output).await?;
        }
        Commands::Evaluate { seed } => {
            evaluate::run(&settings, detect_context(&settings)?, seed).await?;
        }
        Commands::ImportCloses { input, output } => {
            let output_path = resolve_market_data_path(output);
            import_closes::run(&input, &output_path).await?;
        }
    }

    Ok(())
}
