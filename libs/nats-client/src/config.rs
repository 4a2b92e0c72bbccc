//! Client configuration.

use std::{fmt, path::PathBuf, sync::Arc, time::Duration};

use nats_core::{Engine, NatsError, NatsResult, OptionsHandle, ReconnectPolicy};

/// Default server URL.
pub const DEFAULT_URL: &str = "nats://localhost:4222";
/// Default number of reconnect attempts passed to the engine.
pub const DEFAULT_MAX_RECONNECTS: u32 = 10;
/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(2);
/// Default timeout for [`request_default`](crate::NatsClient::request_default).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Default interval at which the run loop checks for shutdown and liveness.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How the client authenticates against the server.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// No credentials.
    #[default]
    None,
    /// Username and password.
    UserPassword {
        /// Username.
        user: String,
        /// Password.
        password: String,
    },
    /// Shared token.
    Token(String),
    /// Raw nkey seed. Rejected by [`ClientConfig::validate`], the engine can
    /// only sign nonces from a credentials file.
    NkeySeed(String),
    /// Path to a `.creds` file holding a user JWT and nkey seed.
    CredentialsFile(PathBuf),
}

// secrets never end up in logs
impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::None => f.write_str("None"),
            AuthMode::UserPassword { user, .. } => f
                .debug_struct("UserPassword")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            AuthMode::Token(_) => f.debug_tuple("Token").field(&"<redacted>").finish(),
            AuthMode::NkeySeed(_) => f.debug_tuple("NkeySeed").field(&"<redacted>").finish(),
            AuthMode::CredentialsFile(path) => f.debug_tuple("CredentialsFile").field(path).finish(),
        }
    }
}

/// Configuration of a [`NatsClient`](crate::NatsClient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server URL, e.g. `nats://localhost:4222`.
    pub url: String,
    /// Whether the engine may reconnect after losing the connection.
    /// When off, the first disconnect closes the connection for good and the
    /// client fails.
    pub reconnect: bool,
    /// Reconnect attempts before the engine gives up.
    pub max_reconnects: u32,
    /// Delay between reconnect attempts.
    pub reconnect_wait: Duration,
    /// Authentication mode.
    pub auth: AuthMode,
    /// Timeout used by `request_default`.
    pub request_timeout: Duration,
    /// How often the run loop wakes up while connected.
    pub poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_owned(),
            reconnect: true,
            max_reconnects: DEFAULT_MAX_RECONNECTS,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            auth: AuthMode::None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Default configuration pointing at `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Allow or forbid reconnects.
    pub fn with_reconnect(mut self, reconnect: bool) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Reconnect attempts before giving up.
    pub fn with_max_reconnects(mut self, max_reconnects: u32) -> Self {
        self.max_reconnects = max_reconnects;
        self
    }

    /// Delay between reconnect attempts.
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    /// Authentication mode.
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    /// Timeout used by `request_default`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// How often the run loop wakes up while connected.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Reject configurations that cannot lead to a working connection.
    pub fn validate(&self) -> NatsResult<()> {
        if self.url.trim().is_empty() {
            return Err(NatsError::Config("url must not be empty".into()));
        }
        if !self.url.contains("://") {
            return Err(NatsError::Config(format!(
                "url '{}' is missing a scheme",
                self.url
            )));
        }
        if self.request_timeout.is_zero() {
            return Err(NatsError::Config("request_timeout must be positive".into()));
        }
        if self.poll_interval.is_zero() {
            return Err(NatsError::Config("poll_interval must be positive".into()));
        }
        match &self.auth {
            AuthMode::UserPassword { user, .. } if user.is_empty() => Err(NatsError::Config(
                "user_password auth requires a non-empty user".into(),
            )),
            AuthMode::Token(token) if token.is_empty() => {
                Err(NatsError::Config("token auth requires a non-empty token".into()))
            }
            AuthMode::NkeySeed(_) => Err(NatsError::Config(
                "nkey seed authentication is not supported standalone; use a credentials file"
                    .into(),
            )),
            AuthMode::CredentialsFile(path) if path.as_os_str().is_empty() => Err(
                NatsError::Config("credentials_file auth requires a path".into()),
            ),
            _ => Ok(()),
        }
    }

    /// Build native options for one connect attempt.
    pub fn build_options(&self, engine: Arc<dyn Engine>) -> NatsResult<OptionsHandle> {
        self.validate()?;
        let options = OptionsHandle::new(engine)?;
        options.set_url(&self.url)?;
        match &self.auth {
            AuthMode::None => {}
            AuthMode::UserPassword { user, password } => options.set_user_info(user, password)?,
            AuthMode::Token(token) => options.set_token(token)?,
            AuthMode::CredentialsFile(path) => options.set_credentials_file(path)?,
            // rejected by validate
            AuthMode::NkeySeed(_) => {}
        }
        options.set_reconnect(ReconnectPolicy {
            allowed: self.reconnect,
            max_reconnects: self.max_reconnects,
            wait: self.reconnect_wait,
        })?;
        Ok(options)
    }
}
