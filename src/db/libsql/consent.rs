//! Consent ledger and subscriber stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::libsql::{LibSqlBackend, fmt_ts, get_i64, get_opt_text, get_text, get_ts, opt_text};
use crate::db::{ConsentStore, SubscriberStore};
use crate::error::DatabaseError;
use crate::notify::{ConsentEntry, Subscriber};

#[async_trait]
impl ConsentStore for LibSqlBackend {
    async fn set_consent(
        &self,
        phone: &str,
        opted_in: bool,
        at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO consent_ledger (phone, opted_in, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (phone) DO UPDATE SET
                opted_in = excluded.opted_in,
                updated_at = excluded.updated_at
            "#,
            libsql::params![phone, opted_in as i64, fmt_ts(&at)],
        )
        .await?;
        Ok(())
    }

    async fn get_consent(&self, phone: &str) -> Result<Option<ConsentEntry>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT phone, opted_in, updated_at FROM consent_ledger WHERE phone = ?1",
                libsql::params![phone],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ConsentEntry {
                phone: get_text(&row, 0),
                opted_in: get_i64(&row, 1) != 0,
                updated_at: get_ts(&row, 2),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }
}

fn row_to_subscriber(row: &libsql::Row) -> Subscriber {
    Subscriber {
        user_id: get_text(row, 0),
        phone: get_opt_text(row, 1),
        phone_verified: get_i64(row, 2) != 0,
        email: get_opt_text(row, 3),
    }
}

#[async_trait]
impl SubscriberStore for LibSqlBackend {
    async fn upsert_subscriber(&self, subscriber: &Subscriber) -> Result<(), DatabaseError> {
        let conn = self.connect().await?;
        conn.execute(
            r#"
            INSERT INTO subscribers (user_id, phone, phone_verified, email)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (user_id) DO UPDATE SET
                phone = excluded.phone,
                phone_verified = excluded.phone_verified,
                email = excluded.email
            "#,
            libsql::params![
                subscriber.user_id.as_str(),
                opt_text(subscriber.phone.as_deref()),
                subscriber.phone_verified as i64,
                opt_text(subscriber.email.as_deref()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn get_subscriber(&self, user_id: &str) -> Result<Option<Subscriber>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT user_id, phone, phone_verified, email FROM subscribers WHERE user_id = ?1",
                libsql::params![user_id],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subscriber(&row))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }

    async fn find_subscriber_by_phone(
        &self,
        phone: &str,
    ) -> Result<Option<Subscriber>, DatabaseError> {
        let conn = self.connect().await?;
        let mut rows = conn
            .query(
                "SELECT user_id, phone, phone_verified, email FROM subscribers \
                 WHERE phone = ?1 AND phone_verified = 1",
                libsql::params![phone],
            )
            .await?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_subscriber(&row))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use pretty_assertions::assert_eq;

    async fn backend() -> LibSqlBackend {
        let backend = LibSqlBackend::new_memory().await.expect("memory db");
        backend.run_migrations().await.expect("migrations");
        backend
    }

    #[tokio::test]
    async fn consent_upserts_in_place() {
        let db = backend().await;
        let phone = "+15555550100";

        assert!(db.get_consent(phone).await.expect("query").is_none());

        db.set_consent(phone, false, Utc::now()).await.expect("set");
        let entry = db.get_consent(phone).await.expect("query").expect("entry");
        assert!(!entry.opted_in);

        db.set_consent(phone, true, Utc::now()).await.expect("set");
        let entry = db.get_consent(phone).await.expect("query").expect("entry");
        assert!(entry.opted_in);
    }

    #[tokio::test]
    async fn phone_lookup_requires_verification() {
        let db = backend().await;
        db.upsert_subscriber(&Subscriber {
            user_id: "u1".to_string(),
            phone: Some("+15555550100".to_string()),
            phone_verified: false,
            email: None,
        })
        .await
        .expect("upsert");

        assert!(
            db.find_subscriber_by_phone("+15555550100")
                .await
                .expect("query")
                .is_none()
        );

        db.upsert_subscriber(&Subscriber {
            user_id: "u1".to_string(),
            phone: Some("+15555550100".to_string()),
            phone_verified: true,
            email: Some("parent@example.com".to_string()),
        })
        .await
        .expect("upsert");

        let found = db
            .find_subscriber_by_phone("+15555550100")
            .await
            .expect("query")
            .expect("found");
        assert_eq!(found.user_id, "u1");
        assert_eq!(found.email.as_deref(), Some("parent@example.com"));
    }
}
