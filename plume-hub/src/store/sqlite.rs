use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use plume_core::{
    ApiCredential, ApiGeneration, BoxStr, CredentialKind, CredentialRef, SensorId,
    SensorRegistration, UnknownVariant,
};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Error as SqlxError, Row, SqlitePool};
use thiserror::Error;
use ulid::Ulid;

use super::SensorStore;

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] SqlxError),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("invalid ulid: {0}")]
    InvalidUlid(String),
    #[error("invalid timestamp: {0}")]
    InvalidTimestamp(i64),
    #[error(transparent)]
    InvalidVariant(#[from] UnknownVariant),
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, SqliteStoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")
            .execute(&pool)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    fn sensor_from_row(row: &SqliteRow) -> Result<SensorRegistration, SqliteStoreError> {
        let sensor_id: i64 = row.try_get("sensor_id")?;
        let generation: String = row.try_get("api_generation")?;
        let credential_ref: Option<String> = row.try_get("credential_ref")?;
        let label: String = row.try_get("label")?;
        let read_key: Option<String> = row.try_get("read_key")?;
        let last_seen: Option<i64> = row.try_get("last_seen")?;
        let poll_interval_override: Option<i64> = row.try_get("poll_interval_override")?;

        let credential_ref = credential_ref
            .map(|s| parse_ref(&s))
            .transpose()?;
        let last_seen = last_seen
            .map(|secs| {
                jiff::Timestamp::from_second(secs)
                    .map_err(|_| SqliteStoreError::InvalidTimestamp(secs))
            })
            .transpose()?;

        Ok(SensorRegistration {
            sensor_id: SensorId(sensor_id as u64),
            api_generation: ApiGeneration::from_str(&generation)?,
            credential_ref,
            label: label.into(),
            read_key: read_key.map(BoxStr::from),
            last_seen,
            poll_interval_override: poll_interval_override.map(|secs| secs.max(0) as u64),
        })
    }
}

fn parse_ref(s: &str) -> Result<CredentialRef, SqliteStoreError> {
    Ulid::from_string(s)
        .map(CredentialRef)
        .map_err(|_| SqliteStoreError::InvalidUlid(s.to_string()))
}

#[async_trait]
impl SensorStore for SqliteStore {
    type Error = SqliteStoreError;

    async fn save_sensor(&self, registration: &SensorRegistration) -> Result<(), Self::Error> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO sensors
                (sensor_id, api_generation, credential_ref, label, read_key, last_seen, poll_interval_override)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(registration.sensor_id.0 as i64)
        .bind(registration.api_generation.as_str())
        .bind(registration.credential_ref.map(|r| r.to_string()))
        .bind(&*registration.label)
        .bind(registration.read_key.as_deref())
        .bind(registration.last_seen.map(|ts| ts.as_second()))
        .bind(registration.poll_interval_override.map(|secs| secs as i64))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_sensor(&self, sensor_id: SensorId) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM sensors WHERE sensor_id = ?")
            .bind(sensor_id.0 as i64)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_sensors(&self) -> Result<Vec<SensorRegistration>, Self::Error> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, api_generation, credential_ref, label, read_key, last_seen, poll_interval_override
            FROM sensors
            ORDER BY sensor_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::sensor_from_row).collect()
    }

    async fn save_credential(
        &self,
        id: CredentialRef,
        credential: &ApiCredential,
    ) -> Result<(), Self::Error> {
        sqlx::query("INSERT OR REPLACE INTO credentials (id, kind, value, validated) VALUES (?, ?, ?, ?)")
            .bind(id.to_string())
            .bind(credential.kind.as_str())
            .bind(&*credential.value)
            .bind(credential.validated)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_credential(&self, id: CredentialRef) -> Result<(), Self::Error> {
        sqlx::query("DELETE FROM credentials WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn load_credentials(&self) -> Result<Vec<(CredentialRef, ApiCredential)>, Self::Error> {
        let rows = sqlx::query("SELECT id, kind, value, validated FROM credentials")
            .fetch_all(&self.pool)
            .await?;

        let mut credentials = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let kind: String = row.try_get("kind")?;
            let value: String = row.try_get("value")?;
            let validated: bool = row.try_get("validated")?;

            credentials.push((
                parse_ref(&id)?,
                ApiCredential {
                    kind: CredentialKind::from_str(&kind)?,
                    value: value.into(),
                    validated,
                },
            ));
        }

        Ok(credentials)
    }
}
