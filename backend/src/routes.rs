use actix_files::Files;
use actix_web::error::JsonPayloadError;
use actix_web::http::header::ContentType;
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use futures::FutureExt;
use shared::{HealthResponse, RecognizeRequest, RecognizeResponse, ServiceInfo};
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use url::form_urlencoded;

use crate::error::{AppError, MALFORMED_IMAGE, MISSING_IMAGE, MISSING_TEXT};
use crate::imaging::preprocessor::ImagePreprocessor;
use crate::inference::model_client::{ChatModel, VisionModel};
use crate::storage::s3_service::ObjectStore;

const MAX_JSON_BODY: usize = 20 * 1024 * 1024;

/// Everything a handler needs; built once in `main` and shared read-only across workers.
pub struct AppState {
    pub preprocessor: ImagePreprocessor,
    pub store: Arc<dyn ObjectStore>,
    pub vision: Arc<dyn VisionModel>,
    pub chat: Arc<dyn ChatModel>,
    pub store_credentials: bool,
}

pub fn configure_routes(cfg: &mut web::ServiceConfig, static_dir: Option<String>) {
    cfg.app_data(json_config())
        .service(web::resource("/").route(web::get().to(index)))
        .service(web::resource("/api/health").route(web::get().to(health)))
        .service(web::resource("/api/recognize").route(web::post().to(recognize_image)))
        .service(web::resource("/api/chat").route(web::get().to(chat)));

    if let Some(dir) = static_dir {
        cfg.service(Files::new("/static", dir).index_file("index.html"));
    }

    cfg.default_service(web::to(not_found));
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(MAX_JSON_BODY)
        .content_type_required(false)
        .error_handler(|err, req| {
            log::warn!("Rejected body for {}: {}", req.path(), err);
            let app_error = match err {
                JsonPayloadError::Overflow { .. } | JsonPayloadError::OverflowKnownLength { .. } => {
                    AppError::Validation("image payload too large")
                }
                _ => AppError::Validation(MISSING_IMAGE),
            };
            app_error.into()
        })
}

/// Runs one request pipeline, turning a panic anywhere inside it into a generic 500.
async fn guarded<F, T>(operation: &'static str, pipeline: F) -> Result<T, AppError>
where
    F: Future<Output = Result<T, AppError>>,
{
    let result = match AssertUnwindSafe(pipeline).catch_unwind().await {
        Ok(result) => result,
        Err(_) => {
            log::error!("Unexpected panic during {}", operation);
            Err(AppError::Internal)
        }
    };

    if let Err(e) = &result {
        if e.status_code().is_client_error() {
            log::warn!("{} rejected: {}", operation, e);
        } else {
            log::error!("{} failed: {}", operation, e);
        }
    }
    result
}

async fn recognize_pipeline(state: &AppState, image: Option<String>) -> Result<String, AppError> {
    let encoded = image
        .filter(|data| !data.trim().is_empty())
        .ok_or(AppError::Validation(MISSING_IMAGE))?;

    let raw = ImagePreprocessor::decode_base64(&encoded).map_err(|e| {
        log::debug!("Base64 decode failed: {}", e);
        AppError::Validation(MALFORMED_IMAGE)
    })?;

    let preprocessor = state.preprocessor.clone();
    let jpeg = web::block(move || preprocessor.compress(&raw))
        .await
        .map_err(|e| {
            log::error!("Image compression task did not complete: {}", e);
            AppError::Internal
        })??;

    if !state.store_credentials {
        return Err(AppError::Config(
            "object storage credentials are not configured".to_string(),
        ));
    }

    let image_url = state.store.upload(jpeg).await?;
    let text = state.vision.recognize(&image_url).await?;
    Ok(text)
}

async fn recognize_image(
    state: web::Data<AppState>,
    body: web::Json<RecognizeRequest>,
) -> Result<HttpResponse, AppError> {
    let image = body.into_inner().image;
    let text = guarded("image recognition", recognize_pipeline(&state, image)).await?;
    Ok(HttpResponse::Ok().json(RecognizeResponse::ok(text)))
}

async fn chat_pipeline(state: &AppState, text: Option<String>) -> Result<String, AppError> {
    let text = text
        .filter(|t| !t.trim().is_empty())
        .ok_or(AppError::Validation(MISSING_TEXT))?;
    let answer = state.chat.chat(&text).await?;
    Ok(answer)
}

/// First occurrence of `name` in the query string; later duplicates are ignored.
fn first_query_value(req: &HttpRequest, name: &str) -> Option<String> {
    form_urlencoded::parse(req.query_string().as_bytes())
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
}

async fn chat(state: web::Data<AppState>, req: HttpRequest) -> Result<HttpResponse, AppError> {
    let text = first_query_value(&req, "text");
    let answer = guarded("chat", chat_pipeline(&state, text)).await?;

    // Plain text body, not the JSON envelope: the web client reads it verbatim.
    Ok(HttpResponse::Ok()
        .content_type(ContentType::plaintext())
        .body(answer))
}

pub fn service_info() -> ServiceInfo {
    let endpoints = BTreeMap::from([
        ("/".to_string(), "GET - service information".to_string()),
        ("/api/recognize".to_string(), "POST - image recognition".to_string()),
        ("/api/chat".to_string(), "GET - chat with Mino".to_string()),
        ("/api/health".to_string(), "GET - health check".to_string()),
    ]);

    ServiceInfo {
        name: "Vision Assistant API".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        description: "Image recognition and spoken descriptions for people with low vision"
            .to_string(),
        endpoints,
    }
}

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(service_info())
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn not_found(req: HttpRequest) -> Result<HttpResponse, AppError> {
    log::info!("No route for {} {}", req.method(), req.path());
    Err(AppError::NotFound(format!(
        "no route for {} {}",
        req.method(),
        req.path()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::preprocessor::tests::png_base64;
    use crate::inference::model_client::InferenceError;
    use crate::storage::s3_service::{S3Service, StorageError};
    use actix_web::http::StatusCode;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::{json, Value};
    use std::sync::Mutex;

    const DOMAIN: &str = "https://relay-bucket.oss-cn-shanghai.aliyuncs.com";

    #[derive(Default)]
    struct MemoryStore {
        uploads: Mutex<Vec<(String, Vec<u8>)>>,
        fail_with: Option<&'static str>,
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn upload(&self, data: Vec<u8>) -> Result<String, StorageError> {
            if let Some(detail) = self.fail_with {
                return Err(StorageError::Upload(detail.to_string()));
            }
            let key = S3Service::generate_object_key();
            let url = format!("{}/{}", DOMAIN, key);
            self.uploads.lock().unwrap().push((url.clone(), data));
            Ok(url)
        }
    }

    enum Reply {
        Text(&'static str),
        Fail(&'static str),
        Panic,
    }

    struct StubModel {
        reply: Reply,
        seen: Mutex<Vec<String>>,
    }

    impl StubModel {
        fn new(reply: Reply) -> Self {
            Self {
                reply,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn respond(&self, input: &str) -> Result<String, InferenceError> {
            self.seen.lock().unwrap().push(input.to_string());
            match self.reply {
                Reply::Text(text) => Ok(text.to_string()),
                Reply::Fail(detail) => Err(InferenceError::Provider(detail.to_string())),
                Reply::Panic => panic!("provider client bug"),
            }
        }
    }

    #[async_trait]
    impl VisionModel for StubModel {
        async fn recognize(&self, image_url: &str) -> Result<String, InferenceError> {
            self.respond(image_url)
        }
    }

    #[async_trait]
    impl ChatModel for StubModel {
        async fn chat(&self, text: &str) -> Result<String, InferenceError> {
            self.respond(text)
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        model: Arc<StubModel>,
        state: web::Data<AppState>,
    }

    fn harness(store: MemoryStore, reply: Reply, store_credentials: bool) -> Harness {
        let store = Arc::new(store);
        let model = Arc::new(StubModel::new(reply));
        let state = web::Data::new(AppState {
            preprocessor: ImagePreprocessor::default(),
            store: store.clone(),
            vision: model.clone(),
            chat: model.clone(),
            store_credentials,
        });
        Harness {
            store,
            model,
            state,
        }
    }

    macro_rules! app {
        ($harness:expr) => {
            test::init_service(
                App::new()
                    .app_data($harness.state.clone())
                    .configure(|cfg| configure_routes(cfg, None)),
            )
            .await
        };
    }

    macro_rules! post_recognize {
        ($app:expr, $body:expr) => {{
            let req = test::TestRequest::post()
                .uri("/api/recognize")
                .set_json($body)
                .to_request();
            let resp = test::call_service(&$app, req).await;
            let status = resp.status();
            let body: Value = test::read_body_json(resp).await;
            (status, body)
        }};
    }

    #[actix_web::test]
    async fn large_image_flows_through_preprocess_upload_and_recognition() {
        let h = harness(MemoryStore::default(), Reply::Text("A sunny street."), true);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "image": png_base64(2000, 2000) }));

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": true, "text": "A sunny street."}));

        let uploads = h.store.uploads.lock().unwrap();
        assert_eq!(uploads.len(), 1);
        let (url, jpeg) = &uploads[0];
        let uploaded = image::load_from_memory(jpeg).unwrap();
        assert!(uploaded.width() <= 1024 && uploaded.height() <= 1024);
        assert!(url.starts_with(DOMAIN));
        assert!(url.contains("images/"));

        assert_eq!(*h.model.seen.lock().unwrap(), vec![url.clone()]);
    }

    #[actix_web::test]
    async fn missing_image_field_is_bad_request() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "picture": "abc" }));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "missing image data"}));
    }

    #[actix_web::test]
    async fn unparseable_body_is_bad_request() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let req = test::TestRequest::post()
            .uri("/api/recognize")
            .insert_header(ContentType::json())
            .set_payload("{not json")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], json!(false));
        assert_eq!(body["error"], json!("missing image data"));
    }

    #[actix_web::test]
    async fn non_base64_image_is_malformed() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "image": "%%% not base64 %%%" }));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "malformed image data"}));
        assert!(h.store.uploads.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn base64_that_is_not_an_image_is_malformed() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let payload = STANDARD.encode(b"definitely not a picture");
        let (status, body) = post_recognize!(app, json!({ "image": payload }));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], json!("malformed image data"));
        assert!(h.model.seen.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn upload_failure_is_server_error_with_detail() {
        let store = MemoryStore {
            fail_with: Some("AccessDenied: bucket policy"),
            ..MemoryStore::default()
        };
        let h = harness(store, Reply::Text("unused"), true);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "image": png_base64(32, 32) }));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("AccessDenied"));
        assert!(h.model.seen.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn provider_failure_is_server_error_with_detail() {
        let h = harness(MemoryStore::default(), Reply::Fail("quota exceeded"), true);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "image": png_base64(32, 32) }));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["success"], json!(false));
        assert!(!body["error"].as_str().unwrap().is_empty());
        assert!(body["error"].as_str().unwrap().contains("quota exceeded"));
    }

    #[actix_web::test]
    async fn missing_store_credentials_is_config_error() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), false);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "image": png_base64(32, 32) }));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["error"].as_str().unwrap().contains("credentials"));
        assert!(h.store.uploads.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn client_fault_is_reported_before_missing_credentials() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), false);
        let app = app!(h);

        let payload = STANDARD.encode(b"definitely not a picture");
        let (status, body) = post_recognize!(app, json!({ "image": payload }));
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({"success": false, "error": "malformed image data"}));
    }

    #[actix_web::test]
    async fn oversized_body_is_rejected_with_envelope() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let oversized = format!("{{\"image\":\"{}\"}}", "A".repeat(MAX_JSON_BODY));
        let req = test::TestRequest::post()
            .uri("/api/recognize")
            .insert_header(ContentType::json())
            .set_payload(oversized)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"success": false, "error": "image payload too large"}));
        assert!(h.store.uploads.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn panic_in_pipeline_becomes_generic_server_error() {
        let h = harness(MemoryStore::default(), Reply::Panic, true);
        let app = app!(h);

        let (status, body) = post_recognize!(app, json!({ "image": png_base64(32, 32) }));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, json!({"success": false, "error": "internal server error"}));
    }

    #[actix_web::test]
    async fn chat_returns_raw_text() {
        let h = harness(MemoryStore::default(), Reply::Text("Hi there"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/chat?text=Hello").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "text/plain; charset=utf-8"
        );
        let body = test::read_body(resp).await;
        assert_eq!(body, "Hi there");
        assert_eq!(*h.model.seen.lock().unwrap(), vec!["Hello".to_string()]);
    }

    #[actix_web::test]
    async fn chat_decodes_query_text() {
        let h = harness(MemoryStore::default(), Reply::Text("ok"), true);
        let app = app!(h);

        let req = test::TestRequest::get()
            .uri("/api/chat?text=What%27s%20in%20front%20of%20me%3F")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            *h.model.seen.lock().unwrap(),
            vec!["What's in front of me?".to_string()]
        );
    }

    #[actix_web::test]
    async fn chat_uses_first_of_repeated_text_params() {
        let h = harness(MemoryStore::default(), Reply::Text("Hi there"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/chat?text=a&text=b").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        assert_eq!(body, "Hi there");
        assert_eq!(*h.model.seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[actix_web::test]
    async fn chat_ignores_unrelated_params() {
        let h = harness(MemoryStore::default(), Reply::Text("ok"), true);
        let app = app!(h);

        let req = test::TestRequest::get()
            .uri("/api/chat?lang=en&text=Hello&text")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(*h.model.seen.lock().unwrap(), vec!["Hello".to_string()]);
    }

    #[actix_web::test]
    async fn panic_in_chat_becomes_generic_server_error() {
        let h = harness(MemoryStore::default(), Reply::Panic, true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/chat?text=Hello").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body, json!({"success": false, "error": "internal server error"}));
    }

    #[actix_web::test]
    async fn chat_without_text_is_bad_request() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        for uri in ["/api/chat", "/api/chat?text=", "/api/chat?text=%20%20"] {
            let req = test::TestRequest::get().uri(uri).to_request();
            let resp = test::call_service(&app, req).await;
            assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "{}", uri);
            let body: Value = test::read_body_json(resp).await;
            assert_eq!(body, json!({"success": false, "error": "missing text"}));
        }
        assert!(h.model.seen.lock().unwrap().is_empty());
    }

    #[actix_web::test]
    async fn chat_failure_uses_error_envelope() {
        let h = harness(MemoryStore::default(), Reply::Fail("upstream timeout"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/chat?text=Hello").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], json!(false));
        assert!(body["error"].as_str().unwrap().contains("upstream timeout"));
    }

    #[actix_web::test]
    async fn index_lists_service_metadata() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["name"].is_string());
        assert!(body["version"].is_string());
        let endpoints = body["endpoints"].as_object().unwrap();
        assert!(endpoints.contains_key("/api/recognize"));
        assert!(endpoints.contains_key("/api/chat"));
    }

    #[actix_web::test]
    async fn health_reports_ok() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["status"], json!("ok"));
    }

    #[actix_web::test]
    async fn unknown_route_uses_error_envelope() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/unknown").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], json!(false));
    }

    #[actix_web::test]
    async fn wrong_method_on_recognize_is_not_a_success() {
        let h = harness(MemoryStore::default(), Reply::Text("unused"), true);
        let app = app!(h);

        let req = test::TestRequest::get().uri("/api/recognize").to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_client_error());
    }
}
