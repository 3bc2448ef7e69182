use std::sync::Arc;

use crate::server::registry::RegistryCatalog;
use crate::server::settings::Settings;

/// Shared application state for HTTP handlers.
///
/// The registry catalog is read-only after startup, so it can be shared
/// across concurrent admission requests without synchronization.
#[derive(Clone)]
pub struct AppState {
    pub catalog: Arc<RegistryCatalog>,
}

impl AppState {
    pub fn new(settings: &Settings) -> Self {
        let catalog = RegistryCatalog::new(
            &settings.registry.account_id,
            &settings.registry.region,
            &settings.registry.registries,
        );
        Self {
            catalog: Arc::new(catalog),
        }
    }
}
