//! natsctl configs

pub mod cli {
    //! Parse from either cli or env var

    /// default server url
    pub static DEFAULT_NATS_URL: &str = "nats://127.0.0.1:4222";
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "natsctl-worker";
    /// default log level. Can use this argument or NATS_LOG env var
    pub const DEFAULT_NATS_LOG: &str = "info";
    /// log as "json", "pretty" or "standard" (unstructured)
    pub const DEFAULT_LOG_FORMAT: &str = "standard";
    /// default request timeout in ms
    pub const DEFAULT_REQUEST_TIMEOUT: u64 = 2_000;
    /// default wait between reconnect attempts in ms
    pub const DEFAULT_RECONNECT_WAIT: u64 = 2_000;
    /// default reconnect attempts
    pub const DEFAULT_MAX_RECONNECTS: u32 = 10;

    use std::{path::PathBuf, time::Duration};

    pub use clap::Parser;
    use clap::{Args, Subcommand};
    use nats_client::{AuthMode, ClientConfig};

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "natsctl", bin_name = "natsctl", about, long_about = None)]
    /// parses from cli & environment var. natsctl will load `.env` in the working dir as well
    pub struct Config {
        /// server url, `mem://` runs against an in-process broker
        #[clap(long, env, value_parser, default_value = DEFAULT_NATS_URL)]
        pub nats_url: String,
        /// user for user/password auth
        #[clap(long, env, value_parser, requires = "nats_password")]
        pub nats_user: Option<String>,
        /// password for user/password auth
        #[clap(long, env, value_parser, hide_env_values = true)]
        pub nats_password: Option<String>,
        /// token auth
        #[clap(long, env, value_parser, hide_env_values = true, conflicts_with = "nats_user")]
        pub nats_token: Option<String>,
        /// path to a credentials file
        #[clap(long, env, value_parser, conflicts_with_all = ["nats_user", "nats_token"])]
        pub nats_creds: Option<PathBuf>,
        /// do not reconnect after the connection drops
        #[clap(long, env, value_parser)]
        pub no_reconnect: bool,
        /// reconnect attempts before giving up
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MAX_RECONNECTS)]
        pub max_reconnects: u32,
        /// wait between reconnect attempts (ms)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_RECONNECT_WAIT)]
        pub reconnect_wait: u64,
        /// request timeout (ms)
        #[clap(long, env, value_parser, default_value_t = DEFAULT_REQUEST_TIMEOUT)]
        pub request_timeout: u64,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// Worker thread count, defaults to the number of logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_NATS_LOG)]
        pub nats_log: String,
        /// log format: standard, json or pretty
        #[clap(long, env, value_parser, default_value = DEFAULT_LOG_FORMAT)]
        pub log_format: String,
        #[clap(subcommand)]
        pub command: Command,
    }

    /// what to do once connected
    #[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
    pub enum Command {
        /// publish a message
        Pub(PubArgs),
        /// print messages received on a subject
        Sub(SubArgs),
        /// send a request and print the reply
        Req(PubArgs),
        /// answer every request on a subject with a fixed payload
        Reply(ReplyArgs),
    }

    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct PubArgs {
        /// subject to publish on
        pub subject: String,
        /// message payload
        #[clap(default_value = "")]
        pub payload: String,
    }

    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct SubArgs {
        /// subject or wildcard pattern
        pub subject: String,
        /// join a queue group
        #[clap(short, long)]
        pub queue: Option<String>,
        /// stop after this many messages
        #[clap(short, long)]
        pub count: Option<usize>,
    }

    #[derive(Args, Debug, Clone, PartialEq, Eq)]
    pub struct ReplyArgs {
        /// subject to answer on
        pub subject: String,
        /// reply payload
        pub payload: String,
        /// join a queue group
        #[clap(short, long)]
        pub queue: Option<String>,
    }

    impl Config {
        /// Whether to run against the in-process broker
        pub fn is_memory(&self) -> bool {
            self.nats_url.starts_with("mem://")
        }

        /// request timeout as `Duration`
        pub fn request_timeout(&self) -> Duration {
            Duration::from_millis(self.request_timeout)
        }

        fn auth(&self) -> AuthMode {
            if let Some(path) = &self.nats_creds {
                AuthMode::CredentialsFile(path.clone())
            } else if let Some(token) = &self.nats_token {
                AuthMode::Token(token.clone())
            } else if let (Some(user), Some(password)) = (&self.nats_user, &self.nats_password) {
                AuthMode::UserPassword {
                    user: user.clone(),
                    password: password.clone(),
                }
            } else {
                AuthMode::None
            }
        }

        /// client config for this invocation
        pub fn client_config(&self) -> ClientConfig {
            ClientConfig::new(&self.nats_url)
                .with_reconnect(!self.no_reconnect)
                .with_max_reconnects(self.max_reconnects)
                .with_reconnect_wait(Duration::from_millis(self.reconnect_wait))
                .with_request_timeout(self.request_timeout())
                .with_auth(self.auth())
        }
    }
}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        prelude::__tracing_subscriber_SubscriberExt,
        util::SubscriberInitExt,
    };

    /// Installed log configuration
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the global subscriber. Logs go to stderr so that received
        /// messages on stdout stay machine readable.
        pub fn parse(nats_log: &str, log_frmt: &str) -> Result<Self> {
            let filter = EnvFilter::try_new(nats_log)
                .or_else(|_| EnvFilter::try_new("info"))?
                .add_directive("async_nats=warn".parse()?);

            match log_frmt {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json().with_writer(std::io::stderr))
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new())
                                .with_writer(std::io::stderr),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().with_writer(std::io::stderr))
                        .init();
                }
            }

            Ok(Self {
                log_frmt: log_frmt.to_owned(),
            })
        }
    }
}
