pub mod auth;
pub mod error;
pub mod handlers;
pub mod router;
pub mod state;
pub mod testing;

pub use error::AppError;
pub use state::{build_state, AppState};
