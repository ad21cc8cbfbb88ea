use axum::{
    Router,
    body::Body,
    http::{Request, header},
    response::Response,
};
use gaefile::{
    config::GatewayPolicy,
    routes::routes,
    services::{
        gateway::GatewayService,
        key_generator::KeyGenerator,
        signing::{SignerState, SigningCredentials, UrlSigner},
        storage_service::{StorageService, run_migrations},
    },
};
use http_body_util::BodyExt;
use p256::ecdsa::SigningKey;
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const BUCKET: &str = "uploads";
pub const BASE_URL: &str = "http://files.test";

/// Router plus the temp directory holding its database and payloads.
#[allow(dead_code)]
pub struct TestSetup {
    pub router: Router,
    pub gateway: GatewayService,
    _dir: TempDir,
}

pub fn ready_signer() -> SignerState {
    let key = SigningKey::random(&mut rand::thread_rng());
    let credentials = SigningCredentials::new("svc@test", key).expect("credentials");
    SignerState::Ready(Arc::new(UrlSigner::new(credentials, BASE_URL).expect("signer")))
}

impl TestSetup {
    pub async fn new() -> Self {
        Self::with(GatewayPolicy::default(), ready_signer()).await
    }

    pub async fn with(policy: GatewayPolicy, signer: SignerState) -> Self {
        let keys = KeyGenerator::new(policy.key_random_bytes);
        Self::with_keys(policy, signer, keys).await
    }

    pub async fn with_keys(policy: GatewayPolicy, signer: SignerState, keys: KeyGenerator) -> Self {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init()
            .ok();

        let dir = TempDir::new().expect("temp dir");
        let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("meta.db").display());
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(&db_url)
            .await
            .expect("sqlite pool");
        run_migrations(&pool).await.expect("migrations");

        let storage = StorageService::new(Arc::new(pool), dir.path().join("objects"));
        storage.ensure_bucket(BUCKET).await.expect("bucket");
        let gateway = GatewayService::new(storage, BUCKET, policy, signer).with_key_generator(keys);

        Self {
            router: routes::app(gateway.clone()),
            gateway,
            _dir: dir,
        }
    }

    pub async fn send(&self, request: Request<Body>) -> Response {
        self.router.clone().oneshot(request).await.expect("infallible")
    }

    pub async fn upload(&self, filename: &str, content_type: Option<&str>, body: Body) -> Response {
        let mut builder = Request::builder()
            .method("PUT")
            .uri("/")
            .header("X-Gaefile-Filename", filename);
        if let Some(ct) = content_type {
            builder = builder.header(header::CONTENT_TYPE, ct);
        }
        self.send(builder.body(body).expect("request")).await
    }

    pub async fn get(&self, uri: &str) -> Response {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .expect("request");
        self.send(request).await
    }

    pub async fn object_count(&self) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM objects")
            .fetch_one(&*self.gateway.storage.db)
            .await
            .expect("count")
    }
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec()
}

pub async fn body_json(response: Response) -> serde_json::Value {
    serde_json::from_slice(&body_bytes(response).await).expect("json body")
}

/// Turn an absolute signed URL from a `Location` header into a request path.
pub fn local_path(location: &str) -> String {
    let url = url::Url::parse(location).expect("absolute url");
    match url.query() {
        Some(query) => format!("{}?{}", url.path(), query),
        None => url.path().to_string(),
    }
}
