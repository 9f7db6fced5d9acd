mod schema;
mod store;

pub use store::{SqliteStateStore, StoreError};
