//! Tunnel Profile
//!
//! Best-effort extraction of the server identity from a raw tunnel
//! profile, plus the connect request handed to engines.
//!
//! The profile is line-oriented. Only the first `remote <host> [port]`
//! directive is looked at; everything else is passed through to the
//! engine untouched.

use crate::error::SessionError;
use std::fmt;

/// Port used when the profile does not name one
pub const DEFAULT_PORT: u16 = 1194;

/// Host reported when the profile has no usable `remote` line
pub const UNKNOWN_HOST: &str = "unknown";

const REMOTE_DIRECTIVE: &str = "remote ";

/// Server identity derived from a profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    /// Host name or address from the `remote` line
    pub host: String,
    /// UDP/TCP port
    pub port: u16,
}

impl ServerInfo {
    /// Placeholder identity for profiles without a `remote` line
    pub fn unknown(default_port: u16) -> Self {
        Self {
            host: UNKNOWN_HOST.to_string(),
            port: default_port,
        }
    }

    /// Was a `remote` directive found?
    pub fn is_known(&self) -> bool {
        self.host != UNKNOWN_HOST
    }
}

impl fmt::Display for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Parse the server identity out of a profile using the standard port.
pub fn parse(profile: &str) -> ServerInfo {
    parse_with_default_port(profile, DEFAULT_PORT)
}

/// Parse the server identity out of a profile.
///
/// Never fails: a profile with no `remote` line yields
/// [`UNKNOWN_HOST`] and `default_port`, and a port that is missing or
/// not a base-10 number falls back to `default_port`.
pub fn parse_with_default_port(profile: &str, default_port: u16) -> ServerInfo {
    for line in profile.lines() {
        let trimmed = line.trim();
        if !trimmed.starts_with(REMOTE_DIRECTIVE) {
            continue;
        }

        let mut fields = trimmed.split_whitespace().skip(1);
        let Some(host) = fields.next() else {
            continue;
        };

        let port = fields
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(default_port);

        return ServerInfo {
            host: host.to_string(),
            port,
        };
    }

    ServerInfo::unknown(default_port)
}

/// Username/password pair for profiles using `auth-user-pass`
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
        }
    }

    /// Both halves present
    pub fn is_complete(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }
}

// Never print the password.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A connect request as received from the application shell
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Raw profile text
    pub profile: String,
    /// Optional credentials
    pub credentials: Credentials,
    /// Label for the tunnel (shown by the OS where supported)
    pub display_name: Option<String>,
}

impl ConnectRequest {
    pub fn new(profile: impl Into<String>) -> Self {
        Self {
            profile: profile.into(),
            ..Self::default()
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Reject requests that carry no profile at all.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.profile.trim().is_empty() {
            return Err(SessionError::InvalidConfig("configuration is required".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_with_port() {
        let info = parse("client\ndev tun\nremote vpn.example.com 443\n");
        assert_eq!(info.host, "vpn.example.com");
        assert_eq!(info.port, 443);
        assert!(info.is_known());
    }

    #[test]
    fn test_remote_without_port() {
        let info = parse("remote 10.0.0.1\n");
        assert_eq!(info, ServerInfo { host: "10.0.0.1".into(), port: 1194 });
    }

    #[test]
    fn test_remote_with_bad_port() {
        assert_eq!(parse("remote host.example abc").port, 1194);
        assert_eq!(parse("remote host.example 99999").port, 1194);
        assert_eq!(parse("remote host.example -5").port, 1194);
    }

    #[test]
    fn test_remote_with_protocol_suffix() {
        let info = parse("remote host.example 1195 udp");
        assert_eq!(info.host, "host.example");
        assert_eq!(info.port, 1195);
    }

    #[test]
    fn test_indented_and_extra_spaces() {
        let info = parse("   remote   gw.example.org    8443  \r\n");
        assert_eq!(info.host, "gw.example.org");
        assert_eq!(info.port, 8443);
    }

    #[test]
    fn test_first_remote_wins() {
        let info = parse("remote first.example 1000\nremote second.example 2000\n");
        assert_eq!(info.host, "first.example");
        assert_eq!(info.port, 1000);
    }

    #[test]
    fn test_missing_remote() {
        assert_eq!(parse("client\ndev tun\nproto udp\n"), ServerInfo::unknown(1194));
        assert_eq!(parse(""), ServerInfo::unknown(1194));
    }

    #[test]
    fn test_malformed_remote_lines() {
        // bare directive, other directives that merely share the prefix
        assert!(!parse("remote\n").is_known());
        assert!(!parse("remote-random\nremote-cert-tls server\n").is_known());
        assert!(!parse("# remote commented.example 443\n").is_known());
    }

    #[test]
    fn test_custom_default_port() {
        assert_eq!(parse_with_default_port("remote a.example", 51820).port, 51820);
        assert_eq!(parse_with_default_port("", 51820), ServerInfo::unknown(51820));
    }

    #[test]
    fn test_credentials_debug_redacts_password() {
        let creds = Credentials::new("alice", "hunter2");
        let printed = format!("{:?}", creds);
        assert!(printed.contains("alice"));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_credentials_completeness() {
        assert!(Credentials::new("alice", "hunter2").is_complete());
        assert!(!Credentials::default().is_complete());

        let user_only = Credentials {
            username: Some("alice".into()),
            password: None,
        };
        assert!(!user_only.is_complete());
    }

    #[test]
    fn test_request_display_name() {
        let request = ConnectRequest::new("remote a 1").with_display_name("Office");
        assert_eq!(request.display_name.as_deref(), Some("Office"));
        assert!(ConnectRequest::new("remote a 1").display_name.is_none());
    }

    #[test]
    fn test_request_validation() {
        assert!(ConnectRequest::new("remote a.example 443").validate().is_ok());
        assert!(matches!(
            ConnectRequest::new("  \n ").validate(),
            Err(SessionError::InvalidConfig(_))
        ));
    }
}
