//! Loaders that turn strategy source records into executable instances.
//!
//! [`LoaderFactory`] is the entry point. It fetches records from a
//! [`SourceStore`](stratguard_core::traits::SourceStore) and dispatches them:
//!
//! - `ai` and `custom` records go to the [`DynamicCodeLoader`]: the code is
//!   sanitized, compiled to WASM inside a namespace built from the
//!   permission policy, checked against the strategy contract, and bound to
//!   the sandbox.
//! - `builtin` records go to the [`ConfigLoader`]: a registered native
//!   class is instantiated with validated JSON parameters.
//!
//! Both loaders share a [`StrategyCache`] keyed by content hash, class and
//! sanitizer mode, and record every step in the audit log.
//!
//! # Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use stratguard_core::traits::SourceStore;
//! use stratguard_core::{GuardConfig, MarketData, SourceType, StrategyId};
//! use stratguard_loader::LoaderFactory;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn demo(store: Arc<dyn SourceStore>) -> stratguard_core::Result<()> {
//! let config = GuardConfig::from_file("stratguard.toml")?;
//! let factory = LoaderFactory::new(&config, store)?;
//!
//! let instance = factory.load(SourceType::Custom, &StrategyId::new("breakout")).await?;
//! let data = Arc::new(MarketData::from_closes(vec![10.0, 10.5, 11.2]));
//! let signals = instance.generate_signals(data, CancellationToken::new()).await?;
//! println!("{} signals", signals.len());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs, missing_debug_implementations)]

pub mod builtin;
pub mod cache;
pub mod config_loader;
pub mod dynamic;
pub mod factory;
pub mod instance;
pub mod params;
pub mod stage;

mod trail;

pub use builtin::{Momentum, MovingAverageCross, StrategyRegistry};
pub use cache::{CacheKey, CacheOutcome, CacheStats, CachedClass, LoaderKind, StrategyCache};
pub use config_loader::ConfigLoader;
pub use dynamic::DynamicCodeLoader;
pub use factory::{BatchLoad, LoaderFactory};
pub use instance::{InstanceMetadata, LoadedStrategyInstance};
pub use params::{ParamKind, ParamSpec, ParamValue, Params};
pub use stage::{LoadFailure, LoadStage};
