pub mod config;
pub mod error;
pub mod imaging;
pub mod inference;
pub mod routes;
pub mod storage;
