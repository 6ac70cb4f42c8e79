use std::sync::Arc;

use sbx_db::{CredentialStore, ProjectStore};

use crate::config::AppConfig;
use crate::lifecycle::LifecycleManager;
use crate::session::SessionOpener;
use crate::vault::CredentialVault;

#[derive(Clone)]
pub struct AppState {
    pub projects: Arc<dyn ProjectStore>,
    pub credentials: Arc<dyn CredentialStore>,
    pub lifecycle: Arc<LifecycleManager>,
    pub sessions: Arc<dyn SessionOpener>,
    pub vault: Option<CredentialVault>,
    pub config: AppConfig,
}
