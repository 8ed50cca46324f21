use std::sync::Arc;

use corral::models::ModelManager;
use corral::scheduler::Scheduler;
use corral::tokens::TokenStore;

pub struct AppState {
    pub models: Arc<ModelManager>,
    pub scheduler: Arc<Scheduler>,
    pub tokens: TokenStore,
    pub require_token: bool,
}
