//! Endpoint configuration.
//!
//! Turns [`Settings`] into the listener section of a broker start
//! configuration. Bind addresses and ports are overrides: an address that
//! does not parse, or a port that is not a positive TCP port, is simply not
//! applied and the engine default stays in effect.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::Result;
use crate::settings::{Certificate, Settings};

/// Default port for unencrypted MQTT.
pub const DEFAULT_TCP_PORT: u16 = 1883;
/// Default port for MQTT over TLS.
pub const DEFAULT_TLS_PORT: u16 = 8883;
/// Default port for MQTT over WebSocket.
pub const DEFAULT_WEBSOCKET_PORT: u16 = 8083;

/// A listener that is either explicitly disabled or enabled with options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Listener<T> {
    /// The engine must not open this listener.
    Disabled,
    /// The engine opens this listener.
    Enabled(T),
}

impl<T> Listener<T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Listener::Enabled(_))
    }

    /// Options of an enabled listener.
    pub fn options(&self) -> Option<&T> {
        match self {
            Listener::Enabled(opts) => Some(opts),
            Listener::Disabled => None,
        }
    }
}

/// Minimum TLS protocol version a listener may negotiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls12,
    Tls13,
}

impl std::fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TlsVersion::Tls12 => write!(f, "TLS 1.2"),
            TlsVersion::Tls13 => write!(f, "TLS 1.3"),
        }
    }
}

/// Overrides for the unencrypted TCP listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpEndpointOptions {
    pub bound_ipv4: Option<Ipv4Addr>,
    pub bound_ipv6: Option<Ipv6Addr>,
    pub port: Option<u16>,
}

impl TcpEndpointOptions {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TCP_PORT)
    }

    /// Addresses to listen on: the IPv4 bind (default any) and, when
    /// overridden, the IPv6 bind.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        listen_addrs(self.bound_ipv4, self.bound_ipv6, self.port())
    }
}

/// Overrides and credentials for the TLS listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedEndpointOptions {
    pub bound_ipv4: Option<Ipv4Addr>,
    pub bound_ipv6: Option<Ipv6Addr>,
    pub port: Option<u16>,
    pub certificate: Certificate,
    pub min_tls_version: TlsVersion,
}

impl EncryptedEndpointOptions {
    /// Effective port.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_TLS_PORT)
    }

    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        listen_addrs(self.bound_ipv4, self.bound_ipv6, self.port())
    }
}

fn listen_addrs(ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>, port: u16) -> Vec<SocketAddr> {
    let mut addrs = vec![SocketAddr::new(
        IpAddr::V4(ipv4.unwrap_or(Ipv4Addr::UNSPECIFIED)),
        port,
    )];
    if let Some(ipv6) = ipv6 {
        addrs.push(SocketAddr::new(IpAddr::V6(ipv6), port));
    }
    addrs
}

/// Listener section of a broker start configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    pub tcp: Listener<TcpEndpointOptions>,
    pub encrypted: Listener<EncryptedEndpointOptions>,
    /// Listen backlog; `None` keeps the engine default.
    pub connection_backlog: Option<u32>,
}

/// Build the endpoint configuration from settings.
///
/// The only failure is an enabled encrypted endpoint whose certificate
/// cannot be read.
pub fn build_endpoints(settings: &Settings) -> Result<EndpointConfig> {
    let plain = &settings.tcp_endpoint;
    let tcp = if plain.enabled {
        Listener::Enabled(TcpEndpointOptions {
            bound_ipv4: plain.try_read_ipv4(),
            bound_ipv6: plain.try_read_ipv6(),
            port: port_override(plain.port),
        })
    } else {
        Listener::Disabled
    };

    let enc = &settings.encrypted_tcp_endpoint;
    let encrypted = if enc.enabled {
        Listener::Enabled(EncryptedEndpointOptions {
            bound_ipv4: enc.try_read_ipv4(),
            bound_ipv6: enc.try_read_ipv6(),
            port: encrypted_port_override(settings),
            certificate: enc.read_certificate()?,
            min_tls_version: TlsVersion::Tls12,
        })
    } else {
        Listener::Disabled
    };

    let connection_backlog = if settings.connection_backlog > 0 {
        Some(u32::try_from(settings.connection_backlog).unwrap_or(u32::MAX))
    } else {
        None
    };

    Ok(EndpointConfig {
        tcp,
        encrypted,
        connection_backlog,
    })
}

/// A configured port, if it is a usable TCP port.
pub fn port_override(port: Option<i64>) -> Option<u16> {
    port.filter(|p| *p > 0).and_then(|p| u16::try_from(p).ok())
}

/// Port override for the TLS listener.
///
/// The override is gated on the plain endpoint's port while the value comes
/// from the encrypted endpoint's own port, so a TLS port only takes effect
/// together with an explicit plain port.
pub fn encrypted_port_override(settings: &Settings) -> Option<u16> {
    if port_override(settings.tcp_endpoint.port).is_some() {
        port_override(settings.encrypted_tcp_endpoint.port)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::settings::{EncryptedTcpEndpointSettings, TcpEndpointSettings};

    fn plain_only(ep: TcpEndpointSettings) -> Settings {
        Settings {
            tcp_endpoint: ep,
            ..Default::default()
        }
    }

    #[test]
    fn test_disabled_plain_ignores_overrides() {
        let settings = plain_only(TcpEndpointSettings {
            enabled: false,
            ipv4: Some("10.0.0.1".to_string()),
            ipv6: Some("::1".to_string()),
            port: Some(1999),
        });
        let cfg = build_endpoints(&settings).unwrap();
        assert_eq!(cfg.tcp, Listener::Disabled);
        assert_eq!(cfg.encrypted, Listener::Disabled);
    }

    #[test]
    fn test_plain_overrides_applied() {
        let settings = plain_only(TcpEndpointSettings {
            enabled: true,
            ipv4: Some("127.0.0.1".to_string()),
            ipv6: Some("fe80::1".to_string()),
            port: Some(1884),
        });
        let cfg = build_endpoints(&settings).unwrap();
        let opts = cfg.tcp.options().unwrap();
        assert_eq!(opts.bound_ipv4, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(opts.bound_ipv6, Some("fe80::1".parse().unwrap()));
        assert_eq!(opts.port(), 1884);
        assert_eq!(
            opts.listen_addrs(),
            vec![
                "127.0.0.1:1884".parse::<SocketAddr>().unwrap(),
                "[fe80::1]:1884".parse::<SocketAddr>().unwrap(),
            ]
        );
    }

    #[test]
    fn test_malformed_addresses_are_omitted() {
        for (v4, v6) in [
            ("not-an-ip", "also-not"),
            ("256.0.0.1", "::g"),
            ("::1", "127.0.0.1"),
            ("", ""),
        ] {
            let settings = plain_only(TcpEndpointSettings {
                enabled: true,
                ipv4: Some(v4.to_string()),
                ipv6: Some(v6.to_string()),
                port: None,
            });
            let cfg = build_endpoints(&settings).unwrap();
            let opts = cfg.tcp.options().unwrap();
            assert_eq!(opts.bound_ipv4, None, "ipv4 {:?}", v4);
            assert_eq!(opts.bound_ipv6, None, "ipv6 {:?}", v6);
            assert_eq!(
                opts.listen_addrs(),
                vec!["0.0.0.0:1883".parse::<SocketAddr>().unwrap()]
            );
        }
    }

    #[test]
    fn test_port_override_rules() {
        assert_eq!(port_override(None), None);
        assert_eq!(port_override(Some(0)), None);
        assert_eq!(port_override(Some(-5)), None);
        assert_eq!(port_override(Some(70000)), None);
        assert_eq!(port_override(Some(1)), Some(1));
        assert_eq!(port_override(Some(65535)), Some(65535));
    }

    #[test]
    fn test_zero_port_uses_default() {
        let settings = plain_only(TcpEndpointSettings {
            port: Some(0),
            ..Default::default()
        });
        let cfg = build_endpoints(&settings).unwrap();
        assert_eq!(cfg.tcp.options().unwrap().port, None);
        assert_eq!(cfg.tcp.options().unwrap().port(), DEFAULT_TCP_PORT);
    }

    #[test]
    fn test_encrypted_without_certificate_is_fatal() {
        let settings = Settings {
            encrypted_tcp_endpoint: EncryptedTcpEndpointSettings {
                enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let err = build_endpoints(&settings).unwrap_err();
        assert!(matches!(err, Error::InvalidEndpointConfiguration(_)));
    }

    #[test]
    fn test_disabled_encrypted_never_reads_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            encrypted_tcp_endpoint: EncryptedTcpEndpointSettings {
                enabled: false,
                certificate: Some(crate::settings::CertificateSettings {
                    path: dir.path().join("missing.crt"),
                    key_path: dir.path().join("missing.key"),
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = build_endpoints(&settings).unwrap();
        assert_eq!(cfg.encrypted, Listener::Disabled);
    }

    #[test]
    fn test_encrypted_endpoint_options() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            tcp_endpoint: TcpEndpointSettings {
                port: Some(1883),
                ..Default::default()
            },
            encrypted_tcp_endpoint: EncryptedTcpEndpointSettings {
                enabled: true,
                ipv4: Some("127.0.0.1".to_string()),
                ipv6: Some("bogus".to_string()),
                port: Some(9883),
                certificate: Some(crate::tests::test_certificate(&dir)),
            },
            ..Default::default()
        };
        let cfg = build_endpoints(&settings).unwrap();
        let opts = cfg.encrypted.options().unwrap();
        assert_eq!(opts.bound_ipv4, Some(Ipv4Addr::LOCALHOST));
        assert_eq!(opts.bound_ipv6, None);
        assert_eq!(opts.port(), 9883);
        assert_eq!(opts.min_tls_version, TlsVersion::Tls12);
        assert_eq!(opts.certificate.chain_len(), 1);
    }

    #[test]
    fn test_encrypted_port_gated_on_plain_port() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings {
            tcp_endpoint: TcpEndpointSettings {
                port: Some(0),
                ..Default::default()
            },
            encrypted_tcp_endpoint: EncryptedTcpEndpointSettings {
                enabled: true,
                port: Some(9883),
                certificate: Some(crate::tests::test_certificate(&dir)),
                ..Default::default()
            },
            ..Default::default()
        };

        let cfg = build_endpoints(&settings).unwrap();
        assert_eq!(cfg.encrypted.options().unwrap().port(), DEFAULT_TLS_PORT);

        settings.tcp_endpoint.port = Some(1883);
        let cfg = build_endpoints(&settings).unwrap();
        assert_eq!(cfg.encrypted.options().unwrap().port(), 9883);

        // Gate open but the TLS port itself is unusable.
        settings.encrypted_tcp_endpoint.port = Some(-1);
        let cfg = build_endpoints(&settings).unwrap();
        assert_eq!(cfg.encrypted.options().unwrap().port(), DEFAULT_TLS_PORT);
    }

    #[test]
    fn test_connection_backlog() {
        let mut settings = Settings {
            connection_backlog: 0,
            ..Default::default()
        };
        assert_eq!(build_endpoints(&settings).unwrap().connection_backlog, None);

        settings.connection_backlog = -3;
        assert_eq!(build_endpoints(&settings).unwrap().connection_backlog, None);

        settings.connection_backlog = 64;
        assert_eq!(
            build_endpoints(&settings).unwrap().connection_backlog,
            Some(64)
        );
    }
}
