use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use std::sync::Arc;
use vision_relay::config::AppConfig;
use vision_relay::imaging::preprocessor::ImagePreprocessor;
use vision_relay::inference::model_client::ModelClient;
use vision_relay::routes::{configure_routes, AppState};
use vision_relay::storage::s3_service::S3Service;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = AppConfig::from_env().map_err(|e| {
        log::error!("Invalid configuration: {}", e);
        std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
    })?;

    if !config.store.has_credentials() {
        log::warn!("Object storage credentials are empty; /api/recognize will fail until they are set.");
    }
    if config.model.api_key.is_empty() {
        log::warn!("MODEL_API_KEY is empty; model calls will fail until it is set.");
    }

    let s3_service = S3Service::from_config(&config.store).await;
    let model_client = Arc::new(ModelClient::new(&config.model, &config.prompts));

    let state = web::Data::new(AppState {
        preprocessor: ImagePreprocessor::new(&config.image),
        store: Arc::new(s3_service),
        vision: model_client.clone(),
        chat: model_client,
        store_credentials: config.store.has_credentials(),
    });

    log::info!(
        "Uploading to bucket {} via {}, public domain {}",
        config.store.bucket,
        config.store.endpoint,
        config.store.domain
    );
    log::info!(
        "Models: vision={} chat={} at {}",
        config.model.vision_model,
        config.model.chat_model,
        config.model.base_url
    );
    if let Some(dir) = &config.static_dir {
        log::info!("Serving static files from {} under /static", dir);
    }

    let bind_address = config.bind_address();
    let static_dir = config.static_dir.clone();

    log::info!("Starting server on {}", bind_address);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(vec!["GET", "POST", "OPTIONS"])
                    .allowed_headers(vec![
                        actix_web::http::header::ACCEPT,
                        actix_web::http::header::CONTENT_TYPE,
                    ])
                    .max_age(3600),
            )
            .app_data(state.clone())
            .configure(|cfg| configure_routes(cfg, static_dir.clone()))
    })
    .bind(&bind_address)?
    .run()
    .await
}
