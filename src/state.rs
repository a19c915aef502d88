use std::sync::Arc;

use crate::config::Settings;
use crate::store::Store;

/// Shared by every worker through `web::Data`.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub settings: Settings,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, settings: Settings) -> Self {
        AppState { store, settings }
    }
}
