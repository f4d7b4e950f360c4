//! Connecting to the lock database.
//!
//! Settings come from `LEASEHOLD_POSTGRES_CONNECTION` (a libpq key/value string
//! or URL) or, when that is unset, from the usual `PG*` variables. TLS follows
//! `PGSSLMODE`.

use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::tls::MakeTlsConnect;
use tokio_postgres::{Client, Config, NoTls, Socket};
use tracing::{debug, warn};

pub(super) const CONNECTION_ENV: &str = "LEASEHOLD_POSTGRES_CONNECTION";

const APPLICATION_NAME: &str = "leasehold";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(super) enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for SslMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "disable" | "allow" => Ok(Self::Disable),
            "prefer" => Ok(Self::Prefer),
            "require" => Ok(Self::Require),
            "verify-ca" => Ok(Self::VerifyCa),
            "verify-full" => Ok(Self::VerifyFull),
            other => Err(anyhow!("unsupported PGSSLMODE '{other}'")),
        }
    }
}

impl SslMode {
    /// `None` when TLS is off.
    fn connector(self) -> Result<Option<MakeTlsConnector>> {
        let mut builder = TlsConnector::builder();
        match self {
            Self::Disable => return Ok(None),
            // Encrypted but unverified, like libpq.
            Self::Prefer | Self::Require => {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            Self::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            Self::VerifyFull => {}
        }
        let connector = builder
            .build()
            .with_context(|| format!("failed to build TLS connector for sslmode {self:?}"))?;
        Ok(Some(MakeTlsConnector::new(connector)))
    }
}

#[derive(Clone)]
pub(super) struct PgConfig {
    config: Config,
    ssl_mode: SslMode,
}

impl PgConfig {
    pub(super) fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let ssl_mode = var("PGSSLMODE")
            .map(|mode| mode.parse::<SslMode>())
            .transpose()?
            .unwrap_or_default();

        let mut config = match var(CONNECTION_ENV).filter(|value| !value.trim().is_empty()) {
            Some(connection) => connection
                .parse::<Config>()
                .with_context(|| format!("invalid {CONNECTION_ENV}"))?,
            None => {
                let port = match var("PGPORT") {
                    Some(port) => port
                        .parse::<u16>()
                        .with_context(|| format!("invalid PGPORT '{port}'"))?,
                    None => 5432,
                };
                let mut config = Config::new();
                config
                    .host(var("PGHOST").as_deref().unwrap_or("localhost"))
                    .port(port)
                    .user(var("PGUSER").as_deref().unwrap_or("postgres"))
                    .dbname(var("PGDATABASE").as_deref().unwrap_or("postgres"));
                if let Some(password) = var("PGPASSWORD") {
                    config.password(password);
                }
                config
            }
        };
        if config.get_application_name().is_none() {
            config.application_name(APPLICATION_NAME);
        }

        Ok(Self { config, ssl_mode })
    }
}

pub(super) async fn connect_client(pg: &PgConfig) -> Result<Client> {
    match pg.ssl_mode.connector()? {
        None => {
            debug!("connecting to lock store without TLS");
            connect(&pg.config, NoTls).await
        }
        Some(connector) if pg.ssl_mode == SslMode::Prefer => {
            match connect(&pg.config, connector).await {
                Ok(client) => Ok(client),
                Err(err) => {
                    warn!(
                        error = %format!("{err:#}"),
                        "TLS connection to lock store failed, retrying without TLS"
                    );
                    connect(&pg.config, NoTls).await
                }
            }
        }
        Some(connector) => {
            debug!(ssl_mode = ?pg.ssl_mode, "connecting to lock store with TLS");
            connect(&pg.config, connector).await
        }
    }
}

async fn connect<T>(config: &Config, tls: T) -> Result<Client>
where
    T: MakeTlsConnect<Socket>,
    T::Stream: Send + 'static,
{
    let (client, connection) = config
        .connect(tls)
        .await
        .context("failed to connect to PostgreSQL")?;
    tokio::spawn(async move {
        if let Err(err) = connection.await {
            warn!(error = %err, "lock store connection closed with an error");
        }
    });
    Ok(client)
}
