use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("no engine plugin found; set IRIS_ENGINE_PLUGIN or install one next to the executable")]
    NotFound,

    #[error("failed to open plugin {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin {path} has no symbol {symbol}: {source}")]
    MissingSymbol {
        path: PathBuf,
        symbol: &'static str,
        #[source]
        source: libloading::Error,
    },

    #[error("plugin entry point returned null")]
    NullEntry,

    #[error("ABI mismatch: host={host} plugin={plugin}")]
    AbiMismatch { host: u32, plugin: u32 },
}
