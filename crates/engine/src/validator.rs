//! Endpoint validation for user-configured webhook URLs.
//!
//! The check is purely syntactic: no DNS resolution is performed, so a public
//! hostname that resolves to a private address still passes. Domain names that
//! begin with a private IPv4 prefix (wildcard-DNS names such as
//! `10.0.0.5.nip.io`) are refused, and literal IP hosts are refused outright.

use std::net::{Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::{Host, Url};

/// Hostname exempt from the loopback rule outside production.
const LOCAL_DEV_HOST: &str = "localhost";

/// Ports a webhook URL may name explicitly.
const ALLOWED_PORTS: [u16; 2] = [80, 443];

/// Reasons a webhook URL is refused. The display strings are user-facing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("Invalid URL format")]
    InvalidUrl,

    #[error("Localhost and loopback addresses are not allowed")]
    Loopback,

    #[error("Private IP ranges are not allowed")]
    PrivateRange,

    #[error("IP addresses are not allowed, please use a domain name")]
    IpLiteral,

    #[error("Only HTTPS URLs are allowed")]
    InsecureScheme,

    #[error("Only ports 80 and 443 are allowed")]
    DisallowedPort,
}

/// Serializable `{valid, error?}` view of a validation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<Url, EndpointError>> for ValidationReport {
    fn from(result: Result<Url, EndpointError>) -> Self {
        match result {
            Ok(_) => Self {
                valid: true,
                error: None,
            },
            Err(e) => Self {
                valid: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Validates webhook URLs before any delivery episode is created.
#[derive(Debug, Clone, Copy)]
pub struct EndpointValidator {
    /// Outside production, `http://localhost:<any port>` is accepted.
    allow_local_http: bool,
}

impl EndpointValidator {
    pub fn new(production: bool) -> Self {
        Self {
            allow_local_http: !production,
        }
    }

    /// Production rules: HTTPS domain names on ports 80/443 only.
    pub fn production() -> Self {
        Self::new(true)
    }

    /// Validate `raw`, returning the parsed URL. First failing check wins.
    ///
    /// Host safety is checked before the scheme so that an `http://` URL
    /// pointing at a private range reports the range, not the scheme.
    pub fn validate(&self, raw: &str) -> Result<Url, EndpointError> {
        let url = Url::parse(raw.trim()).map_err(|_| EndpointError::InvalidUrl)?;
        let host = url.host().ok_or(EndpointError::InvalidUrl)?;

        let is_local_dev = self.allow_local_http
            && matches!(&host, Host::Domain(d) if d.eq_ignore_ascii_case(LOCAL_DEV_HOST));

        match &host {
            Host::Domain(domain) => {
                if !is_local_dev && is_loopback_name(domain) {
                    return Err(EndpointError::Loopback);
                }
                if has_private_v4_prefix(domain) {
                    return Err(EndpointError::PrivateRange);
                }
            }
            Host::Ipv4(ip) => {
                if ip.is_loopback() || ip.is_unspecified() {
                    return Err(EndpointError::Loopback);
                }
                if is_private_v4(ip) {
                    return Err(EndpointError::PrivateRange);
                }
                return Err(EndpointError::IpLiteral);
            }
            Host::Ipv6(ip) => {
                if ip.is_loopback() || ip.is_unspecified() {
                    return Err(EndpointError::Loopback);
                }
                if is_private_v6(ip) {
                    return Err(EndpointError::PrivateRange);
                }
                return Err(EndpointError::IpLiteral);
            }
        }

        match url.scheme() {
            "https" => {}
            "http" if is_local_dev => {}
            _ => return Err(EndpointError::InsecureScheme),
        }

        // `Url::port` is `None` when the port is the scheme default.
        if let Some(port) = url.port()
            && !is_local_dev
            && !ALLOWED_PORTS.contains(&port)
        {
            return Err(EndpointError::DisallowedPort);
        }

        Ok(url)
    }

    /// `validate` flattened into the `{valid, error?}` shape.
    pub fn report(&self, raw: &str) -> ValidationReport {
        self.validate(raw).into()
    }
}

fn is_loopback_name(domain: &str) -> bool {
    let lower = domain.to_ascii_lowercase();
    let lower = lower.strip_suffix('.').unwrap_or(&lower);
    lower == LOCAL_DEV_HOST || lower.ends_with(".localhost")
}

/// Domain names whose leading labels spell out a private, loopback, shared,
/// link-local, multicast or reserved IPv4 prefix.
fn has_private_v4_prefix(domain: &str) -> bool {
    let mut labels = domain.split('.');
    let mut octet = || labels.next().and_then(|l| l.parse::<u8>().ok());

    let Some(a) = octet() else {
        return false;
    };

    match a {
        0 | 10 | 127 | 224..=255 => true,
        172 => octet().is_some_and(|b| (16..=31).contains(&b)),
        192 => octet() == Some(168),
        169 => octet() == Some(254),
        100 => octet().is_some_and(|b| (64..=127).contains(&b)),
        _ => false,
    }
}

/// Private, shared, link-local, multicast, broadcast and reserved IPv4 space.
fn is_private_v4(ip: &Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_private()
        || ip.is_link_local()
        || ip.is_multicast()
        || ip.is_broadcast()
        || a == 0
        || a >= 240
        || (a == 100 && (b & 0xC0) == 64)
}

fn is_private_v6(ip: &Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80 || ip.is_multicast()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prod() -> EndpointValidator {
        EndpointValidator::production()
    }

    fn dev() -> EndpointValidator {
        EndpointValidator::new(false)
    }

    #[test]
    fn test_accepts_https_domains_on_standard_ports() {
        for url in [
            "https://example.com/webhook",
            "https://hooks.shop.vn/payhook?token=abc",
            "https://api.example.com:443/tx",
            "https://api.example.com:80/tx",
        ] {
            assert!(prod().validate(url).is_ok(), "{url} should be valid");
        }
    }

    #[test]
    fn test_scenario_private_ip_over_http() {
        let report = prod().report("http://10.0.0.5/hook");
        assert!(!report.valid);
        assert_eq!(report.error.as_deref(), Some("Private IP ranges are not allowed"));
    }

    #[test]
    fn test_rejects_unparseable() {
        assert_eq!(prod().validate("not a url"), Err(EndpointError::InvalidUrl));
        assert_eq!(prod().validate("/relative/path"), Err(EndpointError::InvalidUrl));
        assert_eq!(prod().validate("mailto:ops@example.com"), Err(EndpointError::InvalidUrl));
    }

    #[test]
    fn test_rejects_loopback() {
        for url in [
            "https://localhost/hook",
            "https://LOCALHOST/hook",
            "https://api.localhost/hook",
            "https://127.0.0.1/hook",
            "https://0.0.0.0/hook",
            "https://[::1]/hook",
            "https://localhost./hook",
            "https://api.localhost./hook",
        ] {
            assert_eq!(prod().validate(url), Err(EndpointError::Loopback), "{url}");
        }
    }

    #[test]
    fn test_numeric_labels_outside_private_prefixes_pass() {
        for url in [
            "https://8.8.8.8.nip.io/hook",
            "https://172.32.0.1.nip.io/hook",
            "https://10x.example.com/hook",
            "https://365.example.com/hook",
            "https://100.example.com/hook",
        ] {
            assert!(prod().validate(url).is_ok(), "{url} should be valid");
        }
    }

    #[test]
    fn test_rejects_private_ranges() {
        for url in [
            "https://10.1.2.3/hook",
            "https://172.16.0.1/hook",
            "https://172.31.255.255/hook",
            "https://192.168.1.10/hook",
            "https://169.254.169.254/latest/meta-data",
            "https://100.64.0.1/hook",
            "https://224.0.0.1/hook",
            "https://240.0.0.1/hook",
            "https://[fd00::1]/hook",
            "https://10.0.0.5.nip.io/hook",
            "https://192.168.1.1.nip.io/hook",
            "https://172.20.0.1.sslip.io/hook",
            "https://169.254.169.254.nip.io/hook",
            "https://10.internal.example.com/hook",
        ] {
            assert_eq!(prod().validate(url), Err(EndpointError::PrivateRange), "{url}");
        }
    }

    #[test]
    fn test_rejects_public_ip_literals() {
        assert_eq!(prod().validate("https://8.8.8.8/hook"), Err(EndpointError::IpLiteral));
        assert_eq!(
            prod().validate("https://[2001:4860:4860::8888]/hook"),
            Err(EndpointError::IpLiteral)
        );
    }

    #[test]
    fn test_rejects_obfuscated_private_ip() {
        // The URL parser normalises hex/integer hosts to dotted IPv4.
        assert_eq!(prod().validate("https://0x0a000001/hook"), Err(EndpointError::PrivateRange));
    }

    #[test]
    fn test_rejects_plain_http_domains() {
        assert_eq!(
            prod().validate("http://example.com/hook"),
            Err(EndpointError::InsecureScheme)
        );
        assert_eq!(
            dev().validate("http://example.com/hook"),
            Err(EndpointError::InsecureScheme)
        );
        assert_eq!(prod().validate("ftp://example.com/hook"), Err(EndpointError::InsecureScheme));
    }

    #[test]
    fn test_rejects_non_standard_ports() {
        assert_eq!(
            prod().validate("https://example.com:8443/hook"),
            Err(EndpointError::DisallowedPort)
        );
        assert_eq!(
            dev().validate("https://example.com:3000/hook"),
            Err(EndpointError::DisallowedPort)
        );
    }

    #[test]
    fn test_local_http_only_outside_production() {
        assert!(dev().validate("http://localhost:3000/hook").is_ok());
        assert!(dev().validate("https://localhost/hook").is_ok());
        assert_eq!(
            prod().validate("http://localhost:3000/hook"),
            Err(EndpointError::Loopback)
        );
        // Loopback IPs stay refused even in development.
        assert_eq!(dev().validate("http://127.0.0.1:3000/hook"), Err(EndpointError::Loopback));
    }

    #[test]
    fn test_report_serialization_omits_error_when_valid() {
        let json = serde_json::to_value(prod().report("https://example.com/hook")).unwrap();
        assert_eq!(json, serde_json::json!({ "valid": true }));
    }
}
