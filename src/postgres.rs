//! PostgreSQL client and operations for pg-warehouse-sync.

use crate::config::{PostgresConfig, SslMode};
use crate::error::{Error, Result};
use crate::row::{Row, Value};
use crate::sanitize::format_timestamp;
use crate::schema::quote_ident;
use crate::source::Source;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use std::future::Future;
use std::time::Duration;
use tokio_postgres::types::{FromSql, Kind, Type};
use tokio_postgres::Client;
use tracing::{debug, info, instrument, warn};

#[cfg(feature = "tls-native")]
use native_tls::TlsConnector;
#[cfg(feature = "tls-native")]
use postgres_native_tls::MakeTlsConnector;

/// PostgreSQL client wrapper.
pub struct PostgresClient {
    client: Client,
    config: PostgresConfig,
}

impl PostgresClient {
    /// Connect to PostgreSQL.
    #[instrument(skip(config), fields(url = %mask_url(&config.url)))]
    pub async fn connect(config: PostgresConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL...");

        let mut pg_config: tokio_postgres::Config = config
            .url
            .parse()
            .map_err(|e| Error::postgres_connection("Invalid connection string", e))?;
        pg_config.connect_timeout(Duration::from_secs(config.connect_timeout_secs));
        apply_ssl_mode(&mut pg_config, config.ssl_mode);

        let client = if config.ssl_mode == SslMode::Disable {
            let (client, connection) = pg_config
                .connect(tokio_postgres::NoTls)
                .await
                .map_err(|e| Error::postgres_connection("Failed to connect", e))?;
            spawn_connection(connection);
            client
        } else {
            connect_tls(&pg_config).await?
        };

        info!("Connected to PostgreSQL");
        Ok(Self { client, config })
    }

    /// Test connectivity.
    pub async fn ping(&self) -> Result<()> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| Error::postgres_query("", "Ping failed", e))?;
        Ok(())
    }

    /// Fully qualified, quoted name of a source table.
    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.config.schema), quote_ident(table))
    }

    /// Run `SELECT * <tail>`, reading columns without a binary decoder as text.
    async fn query_rows(
        &self,
        table: &str,
        tail: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<Row>> {
        let query = format!("SELECT * {}", tail);
        debug!("Executing query: {}", query);

        let statement = self
            .client
            .prepare(&query)
            .await
            .map_err(|e| Error::postgres_query(table, "Prepare failed", e))?;

        let statement = if statement
            .columns()
            .iter()
            .all(|c| decodes_natively(c.type_()))
        {
            statement
        } else {
            let columns = statement.columns().iter().map(|c| (c.name(), c.type_()));
            let query = format!("SELECT {} {}", select_list(columns), tail);
            debug!("Casting columns to text: {}", query);
            self.client
                .prepare(&query)
                .await
                .map_err(|e| Error::postgres_query(table, "Prepare failed", e))?
        };

        let rows = self
            .client
            .query(&statement, params)
            .await
            .map_err(|e| Error::postgres_query(table, "Fetch failed", e))?;

        Ok(rows.iter().map(row_to_value_row).collect())
    }
}

impl Source for PostgresClient {
    async fn current_timestamp(&self) -> Result<String> {
        match self.client.query_one("SELECT NOW()", &[]).await {
            Ok(row) => match row.try_get::<_, DateTime<Utc>>(0) {
                Ok(now) => return Ok(format_timestamp(&now)),
                Err(e) => warn!("Unexpected NOW() result, using local clock: {}", e),
            },
            Err(e) => warn!("Failed to read PostgreSQL clock, using local clock: {}", e),
        }
        Ok(format_timestamp(&Utc::now()))
    }

    #[instrument(skip(self))]
    async fn has_column(&self, table: &str, column: &str) -> Result<bool> {
        let query = r#"
            SELECT 1
            FROM information_schema.columns
            WHERE table_schema = $1 AND table_name = $2 AND column_name = $3
        "#;

        let rows = self
            .client
            .query(query, &[&self.config.schema, &table, &column])
            .await
            .map_err(|e| Error::postgres_query(table, "Column lookup failed", e))?;

        Ok(!rows.is_empty())
    }

    #[instrument(skip(self))]
    async fn fetch_all(&self, table: &str) -> Result<Vec<Row>> {
        let tail = format!("FROM {}", self.qualified(table));
        self.query_rows(table, &tail, &[]).await
    }

    #[instrument(skip(self))]
    async fn fetch_since(&self, table: &str, column: &str, checkpoint: &str) -> Result<Vec<Row>> {
        // Compared on the server so the column's own timezone semantics apply.
        let tail = format!(
            "FROM {} WHERE {col} > $1::text::timestamptz ORDER BY {col} ASC",
            self.qualified(table),
            col = quote_ident(column),
        );
        self.query_rows(table, &tail, &[&checkpoint]).await
    }
}

/// Apply the configured SSL mode. `Prefer` keeps whatever the URL asked for.
fn apply_ssl_mode(pg_config: &mut tokio_postgres::Config, mode: SslMode) {
    use tokio_postgres::config::SslMode as PgSslMode;

    match mode {
        SslMode::Disable => {
            pg_config.ssl_mode(PgSslMode::Disable);
        }
        SslMode::Require => {
            pg_config.ssl_mode(PgSslMode::Require);
        }
        SslMode::Prefer => {}
    }
}

fn spawn_connection<C>(connection: C)
where
    C: Future<Output = std::result::Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::error!("PostgreSQL connection error: {}", e);
        }
    });
}

#[cfg(feature = "tls-native")]
async fn connect_tls(pg_config: &tokio_postgres::Config) -> Result<Client> {
    let connector = TlsConnector::builder()
        .danger_accept_invalid_certs(true) // Supabase pooler uses self-signed certs
        .build()
        .map_err(|e| Error::postgres_connection("TLS setup failed", e))?;
    let connector = MakeTlsConnector::new(connector);
    let (client, connection) = pg_config
        .connect(connector)
        .await
        .map_err(|e| Error::postgres_connection("Failed to connect", e))?;
    spawn_connection(connection);
    Ok(client)
}

#[cfg(all(feature = "tls-rustls", not(feature = "tls-native")))]
async fn connect_tls(pg_config: &tokio_postgres::Config) -> Result<Client> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let tls_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
    let (client, connection) = pg_config
        .connect(connector)
        .await
        .map_err(|e| Error::postgres_connection("Failed to connect", e))?;
    spawn_connection(connection);
    Ok(client)
}

#[cfg(not(any(feature = "tls-native", feature = "tls-rustls")))]
async fn connect_tls(pg_config: &tokio_postgres::Config) -> Result<Client> {
    warn!("Built without TLS support, connecting in plaintext");
    let (client, connection) = pg_config
        .connect(tokio_postgres::NoTls)
        .await
        .map_err(|e| Error::postgres_connection("Failed to connect", e))?;
    spawn_connection(connection);
    Ok(client)
}

/// Convert a PostgreSQL row to a dynamically typed row.
fn row_to_value_row(row: &tokio_postgres::Row) -> Row {
    let mut out = Row::with_capacity(row.len());

    for (i, column) in row.columns().iter().enumerate() {
        let value = match column_value(row, i, column.type_()) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Could not decode column '{}' of type '{}', storing null: {}",
                    column.name(),
                    column.type_().name(),
                    e
                );
                Value::Null
            }
        };
        out.insert(column.name(), value);
    }

    out
}

type DecodeResult = std::result::Result<Value, tokio_postgres::Error>;

fn column_value(row: &tokio_postgres::Row, i: usize, ty: &Type) -> DecodeResult {
    let value = match *ty {
        Type::BOOL => scalar(row, i, Value::Bool)?,
        Type::INT2 => scalar(row, i, |v: i16| Value::Int(v.into()))?,
        Type::INT4 => scalar(row, i, |v: i32| Value::Int(v.into()))?,
        Type::INT8 => scalar(row, i, Value::Int)?,
        Type::OID => scalar(row, i, |v: u32| Value::Int(v.into()))?,
        Type::FLOAT4 => scalar(row, i, |v: f32| Value::Float(v.into()))?,
        Type::FLOAT8 => scalar(row, i, Value::Float)?,
        Type::NUMERIC => scalar(row, i, |n: PgNumeric| Value::Text(n.0))?,
        Type::DATE => scalar(row, i, date_value)?,
        Type::TIME => scalar(row, i, |t: NaiveTime| Value::Text(t.to_string()))?,
        Type::TIMESTAMP => scalar(row, i, |t: NaiveDateTime| Value::Timestamp(t.and_utc()))?,
        Type::TIMESTAMPTZ => scalar(row, i, Value::Timestamp)?,
        Type::UUID => scalar(row, i, |u: uuid::Uuid| Value::Text(u.to_string()))?,
        Type::JSON | Type::JSONB => scalar(row, i, Value::Json)?,
        Type::BYTEA => scalar(row, i, |b: Vec<u8>| Value::Text(hex_bytes(&b)))?,
        Type::BOOL_ARRAY => array(row, i, Value::Bool)?,
        Type::INT2_ARRAY => array(row, i, |v: i16| Value::Int(v.into()))?,
        Type::INT4_ARRAY => array(row, i, |v: i32| Value::Int(v.into()))?,
        Type::INT8_ARRAY => array(row, i, Value::Int)?,
        Type::FLOAT4_ARRAY => array(row, i, |v: f32| Value::Float(v.into()))?,
        Type::FLOAT8_ARRAY => array(row, i, Value::Float)?,
        Type::NUMERIC_ARRAY => array(row, i, |n: PgNumeric| Value::Text(n.0))?,
        Type::DATE_ARRAY => array(row, i, date_value)?,
        Type::TIMESTAMP_ARRAY => array(row, i, |t: NaiveDateTime| Value::Timestamp(t.and_utc()))?,
        Type::TIMESTAMPTZ_ARRAY => array(row, i, Value::Timestamp)?,
        Type::UUID_ARRAY => array(row, i, |u: uuid::Uuid| Value::Text(u.to_string()))?,
        Type::JSON_ARRAY | Type::JSONB_ARRAY => array(row, i, |j: JsonValue| Value::Json(j))?,
        _ if is_text_array(ty) => array(row, i, |t: PgText| Value::Text(t.0))?,
        _ => scalar(row, i, |t: PgText| Value::Text(t.0))?,
    };

    Ok(value)
}

/// Whether [`column_value`] can decode `ty` from the binary protocol.
fn decodes_natively(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::BOOL
            | Type::INT2
            | Type::INT4
            | Type::INT8
            | Type::OID
            | Type::FLOAT4
            | Type::FLOAT8
            | Type::NUMERIC
            | Type::DATE
            | Type::TIME
            | Type::TIMESTAMP
            | Type::TIMESTAMPTZ
            | Type::UUID
            | Type::JSON
            | Type::JSONB
            | Type::BYTEA
            | Type::BOOL_ARRAY
            | Type::INT2_ARRAY
            | Type::INT4_ARRAY
            | Type::INT8_ARRAY
            | Type::FLOAT4_ARRAY
            | Type::FLOAT8_ARRAY
            | Type::NUMERIC_ARRAY
            | Type::DATE_ARRAY
            | Type::TIMESTAMP_ARRAY
            | Type::TIMESTAMPTZ_ARRAY
            | Type::UUID_ARRAY
            | Type::JSON_ARRAY
            | Type::JSONB_ARRAY
    ) || PgText::accepts(ty)
        || is_text_array(ty)
}

fn is_text_array(ty: &Type) -> bool {
    matches!(ty.kind(), Kind::Array(member) if PgText::accepts(member))
}

/// Select list that casts every column without a binary decoder to text.
fn select_list<'a>(columns: impl IntoIterator<Item = (&'a str, &'a Type)>) -> String {
    columns
        .into_iter()
        .map(|(name, ty)| {
            let ident = quote_ident(name);
            if decodes_natively(ty) {
                ident
            } else {
                format!("{ident}::text AS {ident}")
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// A value whose binary representation is UTF-8 text.
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        Ok(PgText(std::str::from_utf8(raw)?.to_string()))
    }

    fn accepts(ty: &Type) -> bool {
        <String as FromSql>::accepts(ty)
            || matches!(ty.kind(), Kind::Enum(_))
            || *ty == Type::XML
    }
}

fn scalar<T, F>(row: &tokio_postgres::Row, i: usize, f: F) -> DecodeResult
where
    T: for<'a> FromSql<'a>,
    F: Fn(T) -> Value,
{
    Ok(row.try_get::<_, Option<T>>(i)?.map(f).unwrap_or(Value::Null))
}

fn array<T, F>(row: &tokio_postgres::Row, i: usize, f: F) -> DecodeResult
where
    T: for<'a> FromSql<'a>,
    F: Fn(T) -> Value,
{
    Ok(row
        .try_get::<_, Option<Vec<Option<T>>>>(i)?
        .map(|items| {
            Value::Array(
                items
                    .into_iter()
                    .map(|item| item.map(&f).unwrap_or(Value::Null))
                    .collect(),
            )
        })
        .unwrap_or(Value::Null))
}

fn date_value(d: NaiveDate) -> Value {
    Value::Timestamp(d.and_time(NaiveTime::MIN).and_utc())
}

/// Render bytes the way PostgreSQL's `bytea_output = hex` does.
fn hex_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

/// A NUMERIC value decoded to its exact decimal text.
struct PgNumeric(String);

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(
        _: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn std::error::Error + Sync + Send>> {
        let word = |idx: usize| -> std::result::Result<[u8; 2], Box<dyn std::error::Error + Sync + Send>> {
            raw.get(idx * 2..idx * 2 + 2)
                .and_then(|s| s.try_into().ok())
                .ok_or_else(|| "numeric value is truncated".into())
        };

        let num_digits = u16::from_be_bytes(word(0)?) as usize;
        let weight = i16::from_be_bytes(word(1)?);
        let sign = u16::from_be_bytes(word(2)?);
        let scale = u16::from_be_bytes(word(3)?);

        match sign {
            NUMERIC_NAN => return Ok(PgNumeric("NaN".into())),
            NUMERIC_PINF => return Ok(PgNumeric("Infinity".into())),
            NUMERIC_NINF => return Ok(PgNumeric("-Infinity".into())),
            0 | NUMERIC_NEG => {}
            other => return Err(format!("invalid numeric sign {:#06x}", other).into()),
        }

        let digits = (0..num_digits)
            .map(|d| word(4 + d).map(i16::from_be_bytes))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(PgNumeric(format_numeric(
            sign == NUMERIC_NEG,
            weight,
            scale,
            &digits,
        )))
    }

    fn accepts(ty: &Type) -> bool {
        matches!(*ty, Type::NUMERIC)
    }
}

/// Format base-10000 numeric digits as decimal text.
fn format_numeric(negative: bool, weight: i16, scale: u16, digits: &[i16]) -> String {
    let digit = |idx: i32| -> i16 {
        usize::try_from(idx)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if negative && !digits.is_empty() {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for idx in 1..=i32::from(weight) {
            out.push_str(&format!("{:04}", digit(idx)));
        }
    }

    if scale > 0 {
        let scale = usize::from(scale);
        let mut fraction = String::with_capacity(scale + 4);
        let mut idx = i32::from(weight) + 1;
        while fraction.len() < scale {
            fraction.push_str(&format!("{:04}", digit(idx)));
            idx += 1;
        }
        fraction.truncate(scale);
        out.push('.');
        out.push_str(&fraction);
    }

    out
}

/// Mask sensitive parts of URL for logging.
pub fn mask_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        "[invalid url]".to_string()
    }
}
