pub mod config;
pub mod database;
pub mod job_repository;
pub mod seen_repository;

pub use config::DatabaseConfig;
pub use database::Database;
pub use job_repository::JobRepository;
pub use seen_repository::SeenJobRepository;
