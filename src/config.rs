//! Startup configuration: server URL parsing and key material loading.

use anyhow::{anyhow, bail, Context};
use thrussh_keys::key;
use url::Url;

pub const DEFAULT_NETCONF_PORT: u16 = 830;

/// Parse the positional server argument. A bare `host[:port]` is accepted
/// and normalized by prefixing `netconf://`; any other scheme is refused.
pub fn parse_server_url(raw: &str) -> anyhow::Result<(String, u16)> {
    let normalized =
        if raw.contains("://") { raw.to_string() } else { format!("netconf://{}", raw) };
    let url = Url::parse(&normalized).with_context(|| format!("parsing server url '{}'", raw))?;
    if url.scheme() != "netconf" {
        bail!("connection to NETCONF server(s) only, got scheme '{}'", url.scheme());
    }
    let host = match url.host_str() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => bail!("server url '{}' has no host", raw),
    };
    Ok((host, url.port().unwrap_or(DEFAULT_NETCONF_PORT)))
}

/// Load a private key for the given algorithm selector. The selector names
/// the algorithms the ssh backend speaks, RSA and Ed25519; anything else is
/// refused up front instead of failing somewhere inside the handshake.
pub fn load_host_key(path: &str, alg: &str) -> anyhow::Result<key::KeyPair> {
    match alg {
        "RSA" | "ED25519" => {}
        other => bail!("unsupported host key algorithm '{}', use RSA or ED25519", other),
    }
    thrussh_keys::load_secret_key(path, None)
        .with_context(|| format!("loading private key {}", path))
}

/// Fresh RSA-2048 host key for proxies started without --proxyhostkey.
pub fn generate_host_key() -> anyhow::Result<key::KeyPair> {
    log::debug!("generating new host key");
    key::KeyPair::generate_rsa(2048, key::SignatureHash::SHA2_256)
        .ok_or_else(|| anyhow!("generating RSA host key"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_host_gets_the_default_scheme_and_port() {
        assert_eq!(parse_server_url("10.0.0.1").unwrap(), ("10.0.0.1".to_string(), 830));
    }

    #[test]
    fn explicit_port_is_honored() {
        assert_eq!(
            parse_server_url("netconf://router.lab:2830").unwrap(),
            ("router.lab".to_string(), 2830),
        );
        assert_eq!(
            parse_server_url("router.lab:2830").unwrap(),
            ("router.lab".to_string(), 2830),
        );
    }

    #[test]
    fn foreign_schemes_are_fatal() {
        assert!(parse_server_url("ssh://router.lab").is_err());
        assert!(parse_server_url("http://router.lab:80").is_err());
    }

    #[test]
    fn missing_host_is_fatal() {
        assert!(parse_server_url("netconf://").is_err());
    }

    #[test]
    fn unknown_key_algorithms_are_refused() {
        assert!(load_host_key("/nonexistent", "ECDSA").is_err());
        assert!(load_host_key("/nonexistent", "DSA").is_err());
    }
}
