use std::env;
use std::path::PathBuf;

/// Absolute path of the engine plugin library. Wins over every other source.
pub const ENV_ENGINE_PLUGIN: &str = "IRIS_ENGINE_PLUGIN";

/// Base name of the library looked up next to the executable
/// (`libiris_engine.so`, `iris_engine.dll`, ...).
pub const PLUGIN_LIB_NAME: &str = "iris_engine";

pub fn locate_plugin_binary() -> Option<PathBuf> {
    let explicit = env::var_os(ENV_ENGINE_PLUGIN).map(PathBuf::from);
    let exe_dir = env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from));
    resolve(explicit, exe_dir)
}

fn resolve(explicit: Option<PathBuf>, exe_dir: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(p) = explicit {
        if p.exists() {
            tracing::debug!(path = %p.display(), "{ENV_ENGINE_PLUGIN} set");
            return Some(p);
        }
        tracing::warn!(
            path = %p.display(),
            "{ENV_ENGINE_PLUGIN} points to a missing file"
        );
    }

    let p = exe_dir?.join(libloading::library_filename(PLUGIN_LIB_NAME));
    if p.exists() {
        tracing::debug!(path = %p.display(), "engine plugin next to executable");
        return Some(p);
    }
    None
}
