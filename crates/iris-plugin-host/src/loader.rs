use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use iris_abi::ffi::{EngineApi, EngineEntryFn, ENGINE_ENTRY_SYMBOL, IRIS_ABI_VERSION};
use libloading::Library;

use crate::error::PluginError;
use crate::locate::locate_plugin_binary;

pub struct LoadedPlugin {
    // Keeps `api` valid; must outlive every use of it.
    _lib: Library,
    pub(crate) api: &'static EngineApi,
    path: PathBuf,
}

// SAFETY: the vtable is immutable static data inside the library, and the
// engine behind it is only ever driven from one thread at a time.
unsafe impl Send for LoadedPlugin {}
unsafe impl Sync for LoadedPlugin {}

impl LoadedPlugin {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn abi_version(&self) -> u32 {
        self.api.info.abi_version
    }
}

static PLUGIN: OnceLock<Result<Arc<LoadedPlugin>, PluginError>> = OnceLock::new();

/// Locate and open the plugin on first call; later calls share the result.
pub fn load_plugin_once() -> Result<Arc<LoadedPlugin>, &'static PluginError> {
    PLUGIN
        .get_or_init(|| {
            let path = locate_plugin_binary().ok_or(PluginError::NotFound)?;
            load_plugin(&path).map(Arc::new)
        })
        .as_ref()
        .map(Arc::clone)
}

pub fn load_plugin(path: &Path) -> Result<LoadedPlugin, PluginError> {
    // SAFETY: loading runs the library's initializers; we trust the plugin.
    let lib = unsafe { Library::new(path) }.map_err(|source| PluginError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let plugin = init_loaded(lib, path)?;
    tracing::info!(
        path = %path.display(),
        abi = plugin.abi_version(),
        "engine plugin loaded"
    );
    Ok(plugin)
}

fn init_loaded(lib: Library, path: &Path) -> Result<LoadedPlugin, PluginError> {
    let entry: EngineEntryFn = unsafe {
        *lib.get::<EngineEntryFn>(ENGINE_ENTRY_SYMBOL.as_bytes())
            .map_err(|source| PluginError::MissingSymbol {
                path: path.to_path_buf(),
                symbol: ENGINE_ENTRY_SYMBOL,
                source,
            })?
    };

    let api_ptr = unsafe { entry() };
    if api_ptr.is_null() {
        return Err(PluginError::NullEntry);
    }

    let api = unsafe { &*api_ptr };
    if api.info.abi_version != IRIS_ABI_VERSION {
        return Err(PluginError::AbiMismatch {
            host: IRIS_ABI_VERSION,
            plugin: api.info.abi_version,
        });
    }

    Ok(LoadedPlugin {
        _lib: lib,
        api,
        path: path.to_path_buf(),
    })
}
