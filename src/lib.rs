use config::Config;
use sessions::SessionStore;

pub mod cache;
pub mod config;
pub mod error;
pub mod result;
pub mod routes;
pub mod sessions;
pub mod store;
pub mod utils;

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub sessions: SessionStore,
}
