pub mod model_client;
pub mod models;
