pub mod routes;

pub use routes::*;

use crate::models::Config;
use crate::storage::LedgerDb;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: LedgerDb,
    pub config: Config,
}
