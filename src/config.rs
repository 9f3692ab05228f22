use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{DbError, Result};

/// Connect timeout applied when the descriptor does not set one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

static CHARSET_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_]+$").unwrap_or_else(|e| unreachable!("static regex: {e}"))
});

/// TLS material handed to the driver before it connects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    pub key: Option<String>,
    pub cert: Option<String>,
    pub ca: Option<String>,
    pub capath: Option<String>,
    pub cipher: Option<String>,
}

impl TlsOptions {
    /// TLS is switched on when any of key, cert or CA is present.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.key.is_some() || self.cert.is_some() || self.ca.is_some()
    }
}

/// Everything needed to open a link: the resolved data-source descriptor.
///
/// Parsing DSN strings is left to callers; this type can be deserialized
/// from any serde format or assembled with [`DataSource::builder`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSource {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub charset: String,
    pub strict: bool,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    pub tls: TlsOptions,
    /// Overrides the driver's lock-contention codes when set.
    pub retryable_codes: Option<Vec<u32>>,
}

impl Default for DataSource {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 3306,
            user: None,
            password: None,
            database: None,
            charset: "utf8".to_string(),
            strict: false,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            tls: TlsOptions::default(),
            retryable_codes: None,
        }
    }
}

impl DataSource {
    #[must_use]
    pub fn builder(host: impl Into<String>) -> DataSourceBuilder {
        DataSourceBuilder::new(host)
    }

    /// Apply one named parameter from a DSN query string or config map.
    ///
    /// # Errors
    /// Returns `DbError::Config` for unknown names or unparsable values.
    pub fn with_param(mut self, name: &str, value: &str) -> Result<Self> {
        match name {
            "charset" => {
                validate_charset(value)?;
                self.charset = value.to_string();
            }
            "strict" => self.strict = parse_flag(name, value)?,
            "ssl_key" => self.tls.key = Some(value.to_string()),
            "ssl_cert" => self.tls.cert = Some(value.to_string()),
            "ssl_ca" => self.tls.ca = Some(value.to_string()),
            "ssl_capath" => self.tls.capath = Some(value.to_string()),
            "ssl_cipher" => self.tls.cipher = Some(value.to_string()),
            "connect_timeout" => {
                let secs: u64 = value.parse().map_err(|_| {
                    DbError::Config(format!("connect_timeout must be whole seconds, got {value}"))
                })?;
                self.connect_timeout = Duration::from_secs(secs);
            }
            other => {
                return Err(DbError::Config(format!("unknown data source parameter {other}")));
            }
        }
        Ok(self)
    }

    /// Apply several named parameters in order.
    ///
    /// # Errors
    /// Returns the first `DbError::Config` raised by [`DataSource::with_param`].
    pub fn with_params<'a, I>(self, params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        params
            .into_iter()
            .try_fold(self, |ds, (name, value)| ds.with_param(name, value))
    }

    /// Check the descriptor before a driver sees it.
    ///
    /// # Errors
    /// Returns `DbError::Config` when the charset name is malformed.
    pub fn validate(&self) -> Result<()> {
        validate_charset(&self.charset)
    }
}

fn validate_charset(charset: &str) -> Result<()> {
    if CHARSET_NAME.is_match(charset) {
        Ok(())
    } else {
        Err(DbError::Config(format!("invalid charset name {charset:?}")))
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(DbError::Config(format!("{name} expects a boolean, got {value}"))),
    }
}

/// Fluent builder for [`DataSource`].
#[derive(Debug, Clone)]
pub struct DataSourceBuilder {
    source: DataSource,
}

impl DataSourceBuilder {
    #[must_use]
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            source: DataSource {
                host: host.into(),
                ..DataSource::default()
            },
        }
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.source.port = port;
        self
    }

    #[must_use]
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.source.user = Some(user.into());
        self
    }

    #[must_use]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.source.password = Some(password.into());
        self
    }

    #[must_use]
    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.source.database = Some(database.into());
        self
    }

    #[must_use]
    pub fn charset(mut self, charset: impl Into<String>) -> Self {
        self.source.charset = charset.into();
        self
    }

    #[must_use]
    pub fn strict(mut self, strict: bool) -> Self {
        self.source.strict = strict;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.source.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.source.tls = tls;
        self
    }

    #[must_use]
    pub fn retryable_codes(mut self, codes: impl Into<Vec<u32>>) -> Self {
        self.source.retryable_codes = Some(codes.into());
        self
    }

    /// # Errors
    /// Returns `DbError::Config` if the assembled descriptor is invalid.
    pub fn build(self) -> Result<DataSource> {
        self.source.validate()?;
        Ok(self.source)
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
