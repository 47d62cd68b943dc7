use crate::error::ConnectorError;
use crate::reading::Reading;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::time::Duration;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const TABLE: &str = "environment";

/// Durable store receiving every poll result, tagged with the sinks that
/// accepted it.
#[async_trait]
pub trait TimeSeriesStore: Send + Sync {
    async fn exists(&self) -> Result<bool, ConnectorError>;

    async fn create(&self) -> Result<(), ConnectorError>;

    /// Returns whether anything was stored.
    async fn write(
        &self,
        reading: &Reading,
        device_name: &str,
        sink_names: &[String],
    ) -> Result<bool, ConnectorError>;
}

/// Creates the store schema when it is missing. Any failure here is fatal
/// at startup.
pub async fn ensure_store(store: &dyn TimeSeriesStore) -> Result<(), ConnectorError> {
    if store.exists().await? {
        tracing::debug!("time-series store already exists");
        return Ok(());
    }
    store.create().await?;
    tracing::info!(table = TABLE, "time-series store created");
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TimescaleSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

#[derive(Debug, Clone)]
pub enum StoreTarget {
    Settings(TimescaleSettings),
    Url(String),
}

#[derive(Debug, Clone)]
pub struct TimescaleStore {
    pool: PgPool,
    target: String,
}

impl TimescaleStore {
    pub async fn connect(target: &StoreTarget, max_connections: u32) -> Result<Self, ConnectorError> {
        let options = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(CONNECT_TIMEOUT);
        let (pool, target) = match target {
            StoreTarget::Settings(settings) => {
                let connect = PgConnectOptions::new()
                    .host(&settings.host)
                    .port(settings.port)
                    .username(&settings.user)
                    .password(&settings.password)
                    .database(&settings.database);
                let label = format!("{}:{}/{}", settings.host, settings.port, settings.database);
                (options.connect_with(connect).await, label)
            }
            StoreTarget::Url(url) => (options.connect(url).await, redact_url(url)),
        };
        let pool = pool.map_err(|err| {
            tracing::error!(store = %target, error = %err, "unable to connect to time-series store");
            ConnectorError::ConnectionTimeout(format!("{target}: {err}"))
        })?;
        tracing::info!(store = %target, "connected to time-series store");
        Ok(Self { pool, target })
    }
}

#[async_trait]
impl TimeSeriesStore for TimescaleStore {
    async fn exists(&self) -> Result<bool, ConnectorError> {
        let exists: bool = sqlx::query_scalar("SELECT to_regclass($1) IS NOT NULL")
            .bind(TABLE)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| ConnectorError::ConnectionTimeout(format!("{}: {err}", self.target)))?;
        tracing::debug!(table = TABLE, exists, "checked time-series table");
        Ok(exists)
    }

    async fn create(&self) -> Result<(), ConnectorError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS environment (
                ts timestamptz not null,
                device text not null,
                measurement text not null,
                value double precision not null,
                clouds text[] not null default '{}'
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS environment_device_ts_idx ON environment (device, ts DESC)")
            .execute(&self.pool)
            .await?;
        if let Err(err) = sqlx::query("SELECT create_hypertable('environment', 'ts', if_not_exists => TRUE)")
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %err, "timescaledb unavailable; keeping a plain table");
        }
        Ok(())
    }

    async fn write(
        &self,
        reading: &Reading,
        device_name: &str,
        sink_names: &[String],
    ) -> Result<bool, ConnectorError> {
        if reading.is_empty() {
            tracing::info!(device = device_name, "empty reading; data not inserted");
            return Ok(false);
        }

        let ts = Utc::now();
        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO environment (ts, device, measurement, value, clouds) ",
        );
        builder.push_values(reading.iter(), |mut b, (measurement, value)| {
            b.push_bind(ts)
                .push_bind(device_name)
                .push_bind(measurement)
                .push_bind(value)
                .push_bind(sink_names);
        });

        let inserted = builder.build().execute(&self.pool).await?.rows_affected();
        tracing::debug!(
            device = device_name,
            rows = inserted,
            clouds = %sink_names.join(";"),
            "data inserted"
        );
        Ok(inserted > 0)
    }
}

fn redact_url(url: &str) -> String {
    match url.split_once('@') {
        Some((_, host)) => format!("postgres://***@{host}"),
        None => url.to_string(),
    }
}
