pub mod calls;
pub mod database;
pub mod error;
pub mod messages;
pub mod pairings;
pub mod presence;
pub mod schema;
pub mod settings;
pub mod tokens;

pub use database::Database;
pub use error::StoreError;
