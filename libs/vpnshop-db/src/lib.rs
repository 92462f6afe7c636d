pub mod db;
pub mod memory;
pub mod models;
pub mod repositories;
pub mod store;

pub use db::init_db;
pub use sqlx;
