pub mod models;
pub mod store;

pub use models::{OrderFilter, RowFilter, Table};
pub use store::MarketDb;
