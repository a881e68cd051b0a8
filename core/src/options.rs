//! Connection configuration.
//!
//! A builder validated once, at `connect()` time, rather than scattering
//! ad-hoc validation through the connection state machine — invalid
//! combinations surface as `invalid_argument` before any socket is
//! touched.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub url: Option<String>,
    pub servers: Vec<String>,
    pub no_randomize: bool,
    pub name: Option<String>,
    pub verbose: bool,
    pub pedantic: bool,
    pub allow_reconnect: bool,
    pub max_reconnect: Option<u32>,
    pub reconnect_wait: Duration,
    pub reconnect_jitter: Duration,
    pub reconnect_jitter_tls: Duration,
    pub connect_timeout: Duration,
    pub write_deadline: Duration,
    pub ping_interval: Duration,
    pub max_pings_out: u32,
    pub reconnect_buf_size: usize,
    pub max_payload_override: Option<usize>,
    pub no_echo: bool,
    pub disable_no_responders: bool,
    pub ignore_discovered_servers: bool,
    pub retry_on_failed_connect: bool,
    pub fail_requests_on_disconnect: bool,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub auth_token: Option<String>,
    pub jwt: Option<String>,
    pub nkey: Option<String>,
    pub dispatcher_pool_size: usize,
    pub use_global_dispatcher: bool,
    pub inbox_prefix: String,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            url: None,
            servers: Vec::new(),
            no_randomize: false,
            name: None,
            verbose: false,
            pedantic: false,
            allow_reconnect: true,
            max_reconnect: Some(60),
            reconnect_wait: Duration::from_millis(2_000),
            reconnect_jitter: Duration::from_millis(100),
            reconnect_jitter_tls: Duration::from_millis(1_000),
            connect_timeout: Duration::from_secs(2),
            write_deadline: Duration::from_secs(10),
            ping_interval: Duration::from_secs(120),
            max_pings_out: 2,
            reconnect_buf_size: 8 * 1024 * 1024,
            max_payload_override: None,
            no_echo: false,
            disable_no_responders: false,
            ignore_discovered_servers: false,
            retry_on_failed_connect: false,
            fail_requests_on_disconnect: false,
            user: None,
            pass: None,
            auth_token: None,
            jwt: None,
            nkey: None,
            dispatcher_pool_size: 1,
            use_global_dispatcher: false,
            inbox_prefix: crate::reqreply::DEFAULT_INBOX_PREFIX.to_string(),
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn servers(mut self, servers: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    pub fn no_randomize(mut self, value: bool) -> Self {
        self.no_randomize = value;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn allow_reconnect(mut self, value: bool) -> Self {
        self.allow_reconnect = value;
        self
    }

    pub fn max_reconnect(mut self, value: Option<u32>) -> Self {
        self.max_reconnect = value;
        self
    }

    pub fn reconnect_wait(mut self, dur: Duration) -> Self {
        self.reconnect_wait = dur;
        self
    }

    pub fn connect_timeout(mut self, dur: Duration) -> Self {
        self.connect_timeout = dur;
        self
    }

    pub fn ping_interval(mut self, dur: Duration) -> Self {
        self.ping_interval = dur;
        self
    }

    pub fn max_pings_out(mut self, value: u32) -> Self {
        self.max_pings_out = value;
        self
    }

    pub fn user_pass(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn dispatcher_pool_size(mut self, size: usize) -> Self {
        self.dispatcher_pool_size = size;
        self
    }

    pub fn no_echo(mut self, value: bool) -> Self {
        self.no_echo = value;
        self
    }

    pub fn disable_no_responders(mut self, value: bool) -> Self {
        self.disable_no_responders = value;
        self
    }

    /// Validate the option set. Called once at the start of `connect()`.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.url.is_none() && self.servers.is_empty() {
            // Not an error: endpoint pool construction seeds a default.
        }
        if self.max_pings_out == 0 {
            return Err(crate::error::Error::invalid_argument(
                "max_pings_out must be at least 1",
            ));
        }
        if self.dispatcher_pool_size == 0 {
            return Err(crate::error::Error::invalid_argument(
                "dispatcher_pool_size must be at least 1",
            ));
        }
        if self.inbox_prefix.is_empty() {
            return Err(crate::error::Error::invalid_argument(
                "inbox_prefix must not be empty",
            ));
        }
        if self.auth_token.is_some() && (self.user.is_some() || self.pass.is_some()) {
            return Err(crate::error::Error::invalid_argument(
                "auth_token is mutually exclusive with user/pass",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_max_pings_out() {
        let opts = ConnectOptions::new().max_pings_out(0);
        let err = opts.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn rejects_token_combined_with_user_pass() {
        let opts = ConnectOptions::new()
            .user_pass("u", "p")
            .token("t");
        let err = opts.validate().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn defaults_validate_cleanly() {
        assert!(ConnectOptions::new().validate().is_ok());
    }
}
