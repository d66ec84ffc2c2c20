//! PostgreSQL implementation of the application and role stores.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use permit_core::model::{
    Applicant, ApplicantContact, Application, ApplicationFilter, ApplicationListing,
    ApplicationStatus, ChangeEvent, Document, NewApplicant, NewApplicationRecord, NewDocument,
    NewPayment, Page, PageRequest, Payment, StatusCounts,
};
use permit_core::rbac::Role;
use permit_core::store::{self, ApplicationStore, RoleStore, StoreError, UserRoleRecord};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::Row;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use sqlx::postgres::PgPool;

const SCHEMA: &str = include_str!("../schema.sql");
const CHANGE_CHANNEL: &str = "application_changes";
const CHANGE_FEED_CAPACITY: usize = 1024;

const APPLICATION_COLUMNS: &str =
    "a.id, a.applicant_id, a.type, a.status, a.reference_no, a.fee_amount, a.created_at";

/// Create a PostgreSQL connection pool from the given database URL.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Create tables, constraints and the change-notification trigger.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

fn store_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() || db.is_foreign_key_violation() => {
            StoreError::Conflict(db.message().to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Corrupt(e.to_string())
        }
        _ => StoreError::Unavailable(e.to_string()),
    }
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, sqlx::Error>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|e| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn application_from_row(row: &PgRow) -> Result<Application, sqlx::Error> {
    Ok(Application {
        id: row.try_get("id")?,
        applicant_id: row.try_get("applicant_id")?,
        application_type: parse_column(row, "type")?,
        status: parse_column(row, "status")?,
        reference_no: row.try_get("reference_no")?,
        fee_amount: row.try_get("fee_amount")?,
        created_at: row.try_get("created_at")?,
    })
}

fn applicant_from_row(row: &PgRow) -> Result<Applicant, sqlx::Error> {
    Ok(Applicant {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        phone: row.try_get("phone")?,
        email: row.try_get("email")?,
    })
}

fn listing_from_row(row: &PgRow) -> Result<ApplicationListing, sqlx::Error> {
    let email: Option<String> = row.try_get("applicant_email")?;
    let applicant = match email {
        Some(email) => Some(ApplicantContact {
            full_name: row.try_get("applicant_name")?,
            phone: row.try_get("applicant_phone")?,
            email,
        }),
        None => None,
    };
    Ok(ApplicationListing {
        application: application_from_row(row)?,
        applicant,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document, sqlx::Error> {
    Ok(Document {
        id: row.try_get("id")?,
        application_id: row.try_get("application_id")?,
        kind: row.try_get("kind")?,
        file_path: row.try_get("file_path")?,
        uploaded_by: row.try_get("uploaded_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, sqlx::Error> {
    Ok(Payment {
        id: row.try_get("id")?,
        application_id: row.try_get("application_id")?,
        amount: row.try_get("amount")?,
        status: parse_column(row, "status")?,
        external_ref: row.try_get("external_ref")?,
        method: row.try_get("method")?,
        created_at: row.try_get("created_at")?,
    })
}

/// Escape LIKE metacharacters and wrap in `%`.
fn like_pattern(term: &str) -> String {
    let mut out = String::with_capacity(term.len() + 2);
    out.push('%');
    for c in term.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out.push('%');
    out
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self { pool, changes }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward `LISTEN application_changes` notifications onto the change feed.
    pub async fn spawn_change_listener(&self) -> Result<JoinHandle<()>, sqlx::Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CHANGE_CHANNEL).await?;
        let changes = self.changes.clone();

        Ok(tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                            Ok(event) => {
                                let _ = changes.send(event);
                            }
                            Err(e) => {
                                tracing::warn!(error = %e, "undecodable application change");
                            }
                        }
                    }
                    Err(e) => {
                        // The listener reconnects on the next recv.
                        tracing::error!(error = %e, "change listener error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    fn filter_clause(filter: &ApplicationFilter) -> (String, Vec<Option<String>>) {
        let binds = vec![
            filter.status.map(|s| s.as_str().to_string()),
            filter.search_term().map(|t| like_pattern(&t)),
            filter.applicant_email.as_ref().map(|e| e.to_lowercase()),
        ];
        let clause = "WHERE ($1::text IS NULL OR a.status = $1) \
             AND ($2::text IS NULL OR a.type ILIKE $2 OR a.id::text ILIKE $2 OR a.reference_no ILIKE $2) \
             AND ($3::text IS NULL OR lower(p.email) = $3)"
            .to_string();
        (clause, binds)
    }
}

#[async_trait]
impl ApplicationStore for PgStore {
    async fn upsert_applicant(&self, applicant: NewApplicant) -> store::Result<Applicant> {
        let row = sqlx::query(
            "INSERT INTO applicants (full_name, phone, email) VALUES ($1, $2, $3) \
             ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name, phone = EXCLUDED.phone \
             RETURNING id, full_name, phone, email",
        )
        .bind(&applicant.full_name)
        .bind(&applicant.phone)
        .bind(applicant.email.to_lowercase())
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        applicant_from_row(&row).map_err(store_err)
    }

    async fn get_applicant(&self, id: Uuid) -> store::Result<Option<Applicant>> {
        let row = sqlx::query("SELECT id, full_name, phone, email FROM applicants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref()
            .map(applicant_from_row)
            .transpose()
            .map_err(store_err)
    }

    async fn find_applicant_by_email(&self, email: &str) -> store::Result<Option<Applicant>> {
        let row = sqlx::query(
            "SELECT id, full_name, phone, email FROM applicants WHERE email = lower($1)",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref()
            .map(applicant_from_row)
            .transpose()
            .map_err(store_err)
    }

    async fn insert_application(&self, record: NewApplicationRecord) -> store::Result<Application> {
        let row = sqlx::query(
            "INSERT INTO applications AS a (applicant_id, type, status, reference_no, fee_amount) \
             VALUES ($1, $2, 'submitted', $3, $4) \
             RETURNING a.id, a.applicant_id, a.type, a.status, a.reference_no, a.fee_amount, a.created_at",
        )
        .bind(record.applicant_id)
        .bind(record.application_type.as_str())
        .bind(&record.reference_no)
        .bind(record.fee_amount)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        application_from_row(&row).map_err(store_err)
    }

    async fn get_application(&self, id: Uuid) -> store::Result<Option<Application>> {
        let row = sqlx::query(&format!(
            "SELECT {APPLICATION_COLUMNS} FROM applications a WHERE a.id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref()
            .map(application_from_row)
            .transpose()
            .map_err(store_err)
    }

    async fn list_applications(
        &self,
        filter: &ApplicationFilter,
        page: PageRequest,
    ) -> store::Result<Page<ApplicationListing>> {
        let (clause, binds) = Self::filter_clause(filter);

        let count_sql = format!(
            "SELECT COUNT(*) AS n FROM applications a \
             LEFT JOIN applicants p ON p.id = a.applicant_id {clause}"
        );
        let mut count = sqlx::query(&count_sql);
        for bind in &binds {
            count = count.bind(bind.clone());
        }
        let total: i64 = count
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("n"))
            .map_err(store_err)?;

        let sql = format!(
            "SELECT {APPLICATION_COLUMNS}, p.full_name AS applicant_name, \
             p.email AS applicant_email, p.phone AS applicant_phone \
             FROM applications a LEFT JOIN applicants p ON p.id = a.applicant_id {clause} \
             ORDER BY a.created_at DESC, a.id DESC LIMIT $4 OFFSET $5"
        );
        let mut query = sqlx::query(&sql);
        for bind in &binds {
            query = query.bind(bind.clone());
        }
        let rows = query
            .bind(i64::from(page.page_size))
            .bind(i64::try_from(page.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let items = rows
            .iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)?;

        Ok(Page {
            items,
            total: u64::try_from(total).unwrap_or(0),
            page: page.page,
            page_size: page.page_size,
        })
    }

    async fn status_counts(&self) -> store::Result<StatusCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM applications GROUP BY status")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        let mut counts = StatusCounts::default();
        for row in &rows {
            let status: ApplicationStatus = parse_column(row, "status").map_err(store_err)?;
            let n: i64 = row.try_get("n").map_err(store_err)?;
            counts.add(status, u64::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: ApplicationStatus,
    ) -> store::Result<Option<Application>> {
        let row = sqlx::query(&format!(
            "UPDATE applications AS a SET status = $2 WHERE a.id = $1 RETURNING {APPLICATION_COLUMNS}"
        ))
        .bind(id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref()
            .map(application_from_row)
            .transpose()
            .map_err(store_err)
    }

    async fn statuses_of(&self, ids: &[Uuid]) -> store::Result<HashMap<Uuid, ApplicationStatus>> {
        let rows = sqlx::query("SELECT id, status FROM applications WHERE id = ANY($1)")
            .bind(ids.to_vec())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;

        rows.iter()
            .map(|row| -> Result<(Uuid, ApplicationStatus), sqlx::Error> {
                Ok((row.try_get("id")?, parse_column(row, "status")?))
            })
            .collect::<Result<HashMap<_, _>, sqlx::Error>>()
            .map_err(store_err)
    }

    async fn set_status_many(
        &self,
        ids: &[Uuid],
        status: ApplicationStatus,
    ) -> store::Result<Vec<Uuid>> {
        let rows = sqlx::query("UPDATE applications SET status = $2 WHERE id = ANY($1) RETURNING id")
            .bind(ids.to_vec())
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<Vec<Uuid>, _>>()
            .map_err(store_err)
    }

    async fn restore_statuses(
        &self,
        prior: &[(Uuid, ApplicationStatus)],
    ) -> store::Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = prior.iter().map(|(id, _)| *id).collect();
        let statuses: Vec<String> = prior.iter().map(|(_, s)| s.as_str().to_string()).collect();
        let rows = sqlx::query(
            "UPDATE applications AS a SET status = v.status \
             FROM UNNEST($1::uuid[], $2::text[]) AS v(id, status) \
             WHERE a.id = v.id RETURNING a.id",
        )
        .bind(ids)
        .bind(statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(|row| row.try_get("id"))
            .collect::<Result<Vec<Uuid>, _>>()
            .map_err(store_err)
    }

    async fn delete_application(&self, id: Uuid) -> store::Result<bool> {
        let result = sqlx::query("DELETE FROM applications WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(store_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_document(&self, document: NewDocument) -> store::Result<Document> {
        let row = sqlx::query(
            "INSERT INTO documents (application_id, kind, file_path, uploaded_by) \
             VALUES ($1, $2, $3, $4) \
             RETURNING id, application_id, kind, file_path, uploaded_by, created_at",
        )
        .bind(document.application_id)
        .bind(&document.kind)
        .bind(&document.file_path)
        .bind(&document.uploaded_by)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        document_from_row(&row).map_err(store_err)
    }

    async fn list_documents(&self, application_id: Uuid) -> store::Result<Vec<Document>> {
        let rows = sqlx::query(
            "SELECT id, application_id, kind, file_path, uploaded_by, created_at \
             FROM documents WHERE application_id = $1 ORDER BY created_at",
        )
        .bind(application_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_err)?;
        rows.iter()
            .map(document_from_row)
            .collect::<Result<Vec<_>, _>>()
            .map_err(store_err)
    }

    async fn insert_payment(&self, payment: NewPayment) -> store::Result<Payment> {
        let row = sqlx::query(
            "INSERT INTO payments (application_id, amount, status, external_ref, method) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, application_id, amount, status, external_ref, method, created_at",
        )
        .bind(payment.application_id)
        .bind(payment.amount)
        .bind(payment.status.as_str())
        .bind(&payment.external_ref)
        .bind(&payment.method)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        payment_from_row(&row).map_err(store_err)
    }

    async fn has_payment(&self, application_id: Uuid) -> store::Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (SELECT 1 FROM payments WHERE application_id = $1) AS present",
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_err)?;
        row.try_get("present").map_err(store_err)
    }

    async fn mark_payment_paid(&self, external_ref: &str) -> store::Result<Option<Payment>> {
        let row = sqlx::query(
            "UPDATE payments SET status = 'paid' WHERE external_ref = $1 \
             RETURNING id, application_id, amount, status, external_ref, method, created_at",
        )
        .bind(external_ref)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_err)?;
        row.as_ref()
            .map(payment_from_row)
            .transpose()
            .map_err(store_err)
    }

    fn subscribe_changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn ping(&self) -> store::Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(store_err)
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn role_for(&self, user_id: &str) -> store::Result<Option<Role>> {
        let row = sqlx::query("SELECT role FROM user_roles WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_err)?;
        row.as_ref()
            .map(|row| parse_column::<Role>(row, "role"))
            .transpose()
            .map_err(store_err)
    }

    async fn upsert_role(&self, user_id: &str, role: Role) -> store::Result<()> {
        sqlx::query(
            "INSERT INTO user_roles (user_id, role) VALUES ($1, $2) \
             ON CONFLICT (user_id) DO UPDATE SET role = EXCLUDED.role, updated_at = now()",
        )
        .bind(user_id)
        .bind(role.as_str())
        .execute(&self.pool)
        .await
        .map_err(store_err)?;
        Ok(())
    }

    async fn list_roles(&self) -> store::Result<Vec<UserRoleRecord>> {
        let rows = sqlx::query("SELECT user_id, role FROM user_roles ORDER BY user_id")
            .fetch_all(&self.pool)
            .await
            .map_err(store_err)?;
        rows.iter()
            .map(|row| -> Result<UserRoleRecord, sqlx::Error> {
                Ok(UserRoleRecord {
                    user_id: row.try_get("user_id")?,
                    role: parse_column(row, "role")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(store_err)
    }
}
