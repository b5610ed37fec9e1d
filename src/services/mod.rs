pub mod coordinator;
pub mod memory_store;
pub mod mirror;
pub mod preprocess;
pub mod redis_store;
pub mod store;
