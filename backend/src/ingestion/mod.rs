pub mod model;
pub mod recovery;
pub mod repository;
pub mod repository_sqlx;
pub mod store;
