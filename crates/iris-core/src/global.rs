//! Process-wide coordinator. Installed once; lives until exit.

use once_cell::sync::OnceCell;

use crate::coordinator::RequestCoordinator;
use crate::error::Result;

static COORDINATOR: OnceCell<RequestCoordinator> = OnceCell::new();

/// Install `coordinator` as the process-wide instance.
/// If one is already installed, `coordinator` is handed back.
pub fn install(
    coordinator: RequestCoordinator,
) -> std::result::Result<&'static RequestCoordinator, RequestCoordinator> {
    COORDINATOR
        .try_insert(coordinator)
        .map_err(|(_, rejected)| rejected)
}

pub fn coordinator() -> Option<&'static RequestCoordinator> {
    COORDINATOR.get()
}

/// First caller builds it; everyone else gets the same instance.
pub fn get_or_try_init<F>(init: F) -> Result<&'static RequestCoordinator>
where
    F: FnOnce() -> Result<RequestCoordinator>,
{
    COORDINATOR.get_or_try_init(init)
}
