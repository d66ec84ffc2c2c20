//! Common test utilities for permit-api integration tests.
//!
//! Each test gets its own in-process server on an ephemeral port, backed by
//! the in-memory store, a recording SMS notifier and a fake payment gateway.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use permit_api::config::Config;
use permit_api::routes::payments::{sign_payload, SIGNATURE_HEADER};
use permit_api::services::payments::{Invoice, InvoiceRequest, PaymentError, PaymentGateway};
use permit_api::state::AppState;
use permit_core::model::{
    Application, ApplicationStatus, ApplicationType, NewApplicant, NewApplicationRecord,
    NewPayment, PaymentStatus,
};
use permit_core::notify::recording::RecordingNotifier;
use permit_core::rbac::Role;
use permit_core::store::memory::MemoryStore;
use permit_core::store::{ApplicationStore, RoleStore};
use tokio::sync::oneshot;

pub const JWT_SECRET: &str = "integration-test-secret";
pub const WEBHOOK_SECRET: &str = "whsec_integration";
pub const ADMIN_EMAIL: &str = "clerk@dipolog.gov.ph";
pub const SUPER_ADMIN_EMAIL: &str = "it@dipolog.gov.ph";
pub const CITIZEN_EMAIL: &str = "jane@example.com";

/// Gateway that accepts every invoice.
#[derive(Default)]
pub struct FakeGateway {
    created: AtomicUsize,
}

impl FakeGateway {
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_invoice(&self, request: InvoiceRequest) -> Result<Invoice, PaymentError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Invoice {
            id: format!("inv_{n}"),
            external_id: request.external_id,
            status: "PENDING".to_string(),
            invoice_url: Some(format!("https://checkout.example/inv_{n}")),
            amount: request.amount,
        })
    }
}

pub fn test_config(overrides: &[(&str, &str)]) -> Config {
    let storage = std::env::temp_dir().join(format!("permit-api-test-{}", uuid::Uuid::new_v4()));
    let mut vars: HashMap<String, String> = [
        ("LISTEN_ADDR", "127.0.0.1:0"),
        ("DATABASE_URL", "postgres://unused"),
        ("JWT_SECRET", JWT_SECRET),
        ("ADMIN_EMAILS", ADMIN_EMAIL),
        ("PAYMENT_WEBHOOK_SECRET", WEBHOOK_SECRET),
        ("PUBLIC_BASE_URL", "https://permits.example"),
        ("RATE_LIMIT_ENABLED", "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    vars.insert(
        "DOCUMENT_STORAGE_DIR".to_string(),
        storage.display().to_string(),
    );
    for (k, v) in overrides {
        vars.insert((*k).to_string(), (*v).to_string());
    }

    Config::from_lookup(|key| vars.get(key).cloned()).expect("test config")
}

pub struct TestApp {
    pub url: String,
    /// The served router, for driving requests in-process.
    pub router: axum::Router,
    pub client: reqwest::Client,
    pub store: MemoryStore,
    pub notifier: RecordingNotifier,
    pub gateway: Arc<FakeGateway>,
    pub config: Config,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config(&[]), RecordingNotifier::new()).await
    }

    pub async fn spawn_with(config: Config, notifier: RecordingNotifier) -> Self {
        let store = MemoryStore::new();
        store
            .upsert_role(SUPER_ADMIN_EMAIL, Role::SuperAdmin)
            .await
            .expect("seed super admin");

        let gateway = Arc::new(FakeGateway::default());
        let state = AppState::new(
            config.clone(),
            Arc::new(store.clone()),
            Arc::new(notifier.clone()),
            Some(gateway.clone() as Arc<dyn PaymentGateway>),
        );
        let app = permit_api::build_app(state);
        let router = app.clone();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            permit_api::serve(listener, app, shutdown)
                .await
                .expect("server");
        });

        Self {
            url: format!("http://{addr}"),
            router,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("client"),
            store,
            notifier,
            gateway,
            config,
            shutdown: Some(tx),
        }
    }

    pub fn token(&self, email: &str) -> String {
        permit_api::auth::jwt::issue_token(email, JWT_SECRET, chrono::Duration::hours(1))
            .expect("token")
    }

    pub fn get(&self, path: &str, email: Option<&str>) -> reqwest::RequestBuilder {
        self.authorize(self.client.get(format!("{}{path}", self.url)), email)
    }

    pub fn post(&self, path: &str, email: Option<&str>) -> reqwest::RequestBuilder {
        self.authorize(self.client.post(format!("{}{path}", self.url)), email)
    }

    pub fn patch(&self, path: &str, email: Option<&str>) -> reqwest::RequestBuilder {
        self.authorize(self.client.patch(format!("{}{path}", self.url)), email)
    }

    pub fn put(&self, path: &str, email: Option<&str>) -> reqwest::RequestBuilder {
        self.authorize(self.client.put(format!("{}{path}", self.url)), email)
    }

    pub fn delete(&self, path: &str, email: Option<&str>) -> reqwest::RequestBuilder {
        self.authorize(self.client.delete(format!("{}{path}", self.url)), email)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder, email: Option<&str>) -> reqwest::RequestBuilder {
        match email {
            Some(email) => builder.bearer_auth(self.token(email)),
            None => builder,
        }
    }

    /// Insert an applicant and application directly into the store.
    pub async fn seed_application(&self, email: &str, status: ApplicationStatus) -> Application {
        let applicant = self
            .store
            .upsert_applicant(NewApplicant {
                full_name: "Jane Doe".to_string(),
                phone: "09171234567".to_string(),
                email: email.to_string(),
            })
            .await
            .expect("applicant");
        let application = self
            .store
            .insert_application(NewApplicationRecord {
                applicant_id: applicant.id,
                application_type: ApplicationType::Business,
                reference_no: format!("BUS-TEST-{}", uuid::Uuid::new_v4().simple()),
                fee_amount: 500.0,
            })
            .await
            .expect("application");
        if status == ApplicationStatus::Submitted {
            return application;
        }
        self.store
            .update_status(application.id, status)
            .await
            .expect("status")
            .expect("row")
    }

    pub async fn seed_payment(&self, application: &Application, external_ref: &str) {
        self.store
            .insert_payment(NewPayment {
                application_id: application.id,
                amount: application.fee_amount,
                status: PaymentStatus::Pending,
                external_ref: external_ref.to_string(),
                method: "gcash".to_string(),
            })
            .await
            .expect("payment");
    }

    pub async fn status_of(&self, id: uuid::Uuid) -> ApplicationStatus {
        self.store
            .get_application(id)
            .await
            .expect("store")
            .expect("application")
            .status
    }

    /// Post `body` to the payment webhook with the given signature header.
    pub async fn webhook(&self, body: &str, signature: Option<String>) -> reqwest::Response {
        let mut request = self
            .client
            .post(format!("{}/webhooks/payment", self.url))
            .header("content-type", "application/json")
            .body(body.to_string());
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        request.send().await.expect("webhook request")
    }

    pub fn sign(&self, body: &str, timestamp: i64) -> String {
        sign_payload(body, WEBHOOK_SECRET, timestamp).expect("signature")
    }
}

pub fn sign_with(secret: &str, body: &str, timestamp: i64) -> String {
    sign_payload(body, secret, timestamp).expect("signature")
}

impl Drop for TestApp {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = std::fs::remove_dir_all(&self.config.document_storage_dir);
    }
}
