//! Host side of the engine plugin ABI: find the shared library, check its ABI
//! version, and drive its vtable through [`iris_abi::NativeEngine`].

mod engine;
mod error;
mod loader;
mod locate;

pub use engine::PluginEngine;
pub use error::PluginError;
pub use loader::{load_plugin, load_plugin_once, LoadedPlugin};
pub use locate::{locate_plugin_binary, ENV_ENGINE_PLUGIN, PLUGIN_LIB_NAME};
