//! `stratguard run`: load a strategy file through the full pipeline and
//! execute one operation over a price file.
//!
//! With `--source-type builtin` the file holds the JSON parameters of a
//! registered class instead of code.
//!
//! The price file is either a JSON array of closes or an object of OHLCV
//! columns where only `close` is required:
//!
//! ```json
//! {"close": [10.0, 10.4, 10.1], "volume": [900, 1200, 800]}
//! ```

use super::{audit_logger, read_source};
use crate::formatters::{format_output, risk_badge};
use crate::{ExitCode, OutputFormat};
use anyhow::{Context, Result};
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stratguard_core::{
    GuardConfig, MarketData, ResourceUsage, Signals, SourceType, StrategyId, StrategyOp,
    StrategySourceRecord,
};
use stratguard_loader::{
    ConfigLoader, DynamicCodeLoader, InstanceMetadata, StrategyCache, StrategyRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Inputs of one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Strategy source file, or a JSON parameters object for `builtin`
    pub file: PathBuf,
    /// Class to load from the file
    pub class_name: String,
    /// Price file
    pub data: PathBuf,
    /// Operation method name
    pub op: String,
    /// Strategy id recorded in the audit log; the file stem when absent
    pub id: Option<String>,
    /// `ai`, `custom` or `builtin`
    pub source_type: String,
    /// Sanitizer mode
    pub strict_mode: bool,
}

/// Successful run.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    /// Loaded strategy
    pub metadata: InstanceMetadata,
    /// Operation executed
    pub operation: StrategyOp,
    /// Bars in the input
    pub bars: usize,
    /// Resources consumed
    pub usage: ResourceUsage,
    /// Values keyed by bar index
    pub output: Signals,
}

#[derive(Debug, Serialize)]
struct FailureView<'a> {
    stage: &'static str,
    error: String,
    violations: &'a [stratguard_core::Violation],
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PriceFile {
    Closes(Vec<f64>),
    Columns {
        close: Vec<f64>,
        open: Option<Vec<f64>>,
        high: Option<Vec<f64>>,
        low: Option<Vec<f64>>,
        volume: Option<Vec<f64>>,
    },
}

/// Reads market data from a JSON price file.
pub fn read_prices(path: &Path) -> Result<MarketData> {
    let text = read_source(path)?;
    let parsed: PriceFile = serde_json::from_str(&text)
        .with_context(|| format!("{} is not a price array or OHLCV object", path.display()))?;
    let data = match parsed {
        PriceFile::Closes(closes) => MarketData::from_closes(closes),
        PriceFile::Columns {
            close,
            open,
            high,
            low,
            volume,
        } => {
            let n = close.len();
            MarketData::new(
                open.unwrap_or_else(|| close.clone()),
                high.unwrap_or_else(|| close.clone()),
                low.unwrap_or_else(|| close.clone()),
                close,
                volume.unwrap_or_else(|| vec![0.0; n]),
            )
            .with_context(|| format!("invalid columns in {}", path.display()))?
        }
    };
    Ok(data)
}

/// Loads and executes the strategy, printing the output or the failure.
pub async fn run(args: RunArgs, config: &GuardConfig, format: OutputFormat) -> Result<ExitCode> {
    let source = read_source(&args.file)?;
    let op: StrategyOp = args.op.parse().context("invalid --op")?;
    let source_type: SourceType = args.source_type.parse().context("invalid --source-type")?;
    let data = Arc::new(read_prices(&args.data)?);
    let id = args.id.clone().unwrap_or_else(|| {
        args.file
            .file_stem()
            .map_or_else(|| "strategy".to_string(), |s| s.to_string_lossy().into_owned())
    });
    let record = StrategySourceRecord::new(
        StrategyId::new(id),
        source,
        args.class_name.as_str(),
        source_type,
    );

    let audit = audit_logger(config);
    let cache = StrategyCache::new(config.max_cache_size, config.cache_ttl(), config.cache_shards);
    let loaded = if source_type.is_dynamic() {
        let loader = DynamicCodeLoader::new(config, audit.clone(), cache)
            .context("failed to start the sandbox engine")?;
        loader.load(&record, args.strict_mode).await
    } else {
        let registry = Arc::new(StrategyRegistry::with_builtins());
        debug!(classes = ?registry.names().collect::<Vec<_>>(), "builtin registry");
        ConfigLoader::new(registry, audit.clone(), cache, config.limits())
            .load(&record)
            .await
    };

    let outcome = match loaded {
        Ok(instance) => {
            let cancel = CancellationToken::new();
            let on_interrupt = cancel.clone();
            let interrupt = tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupted, cancelling execution");
                    on_interrupt.cancel();
                }
            });
            let result = instance.execute(op, Arc::clone(&data), cancel).await;
            interrupt.abort();
            result
                .map(|invocation| RunView {
                    metadata: instance.metadata().clone(),
                    operation: op,
                    bars: data.len(),
                    usage: invocation.usage,
                    output: invocation.output,
                })
                .map_err(|err| ("execute", err))
        }
        Err(err) => Err(("load", err)),
    };

    if !audit.flush() {
        warn!("audit log did not flush before exit");
    }

    match outcome {
        Ok(view) => {
            debug!(values = view.output.len(), "run complete");
            match format {
                OutputFormat::Json => println!("{}", format_output(&view, format)?),
                OutputFormat::Pretty => print_pretty(&view)?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Err((stage, err)) => {
            let violations = err.report().map_or(&[][..], |r| r.violations());
            let failure = FailureView {
                stage,
                error: err.to_string(),
                violations,
            };
            match format {
                OutputFormat::Json => println!("{}", format_output(&failure, format)?),
                OutputFormat::Pretty => {
                    eprintln!("{} {stage} failed: {err}", "error:".red().bold());
                    for v in violations {
                        eprintln!("  {v}");
                    }
                }
            }
            Ok(ExitCode::for_error(&err))
        }
    }
}

fn print_pretty(view: &RunView) -> Result<()> {
    let meta = &view.metadata;
    println!(
        "{} {} ({}) risk {}",
        view.operation.method_name().bold(),
        meta.class_name,
        meta.strategy_id,
        risk_badge(meta.risk_level)
    );
    for warning in &meta.warnings {
        println!("  {} {warning}", "warning:".yellow());
    }
    println!(
        "  {} values over {} bars, {} us, fuel {}",
        view.output.len(),
        view.bars,
        view.usage.elapsed_us,
        view.usage.fuel_consumed
    );
    println!("{}", format_output(&view.output, OutputFormat::Pretty)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use stratguard_core::Field;
    use tempfile::NamedTempFile;

    fn json_file(text: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_read_closes_array() {
        let file = json_file("[1.0, 2.0, 3.5]");
        let data = read_prices(file.path()).unwrap();
        assert_eq!(data.len(), 3);
        assert_eq!(data.series(Field::High), &[1.0, 2.0, 3.5]);
    }

    #[test]
    fn test_read_columns_with_defaults() {
        let file = json_file(r#"{"close": [1.0, 2.0], "volume": [10.0, 20.0]}"#);
        let data = read_prices(file.path()).unwrap();
        assert_eq!(data.series(Field::Volume), &[10.0, 20.0]);
        assert_eq!(data.series(Field::Open), &[1.0, 2.0]);
    }

    #[test]
    fn test_read_columns_of_unequal_length() {
        let file = json_file(r#"{"close": [1.0, 2.0], "high": [1.0]}"#);
        assert!(read_prices(file.path()).is_err());
    }
}
