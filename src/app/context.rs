use std::{
    fs,
    net::{Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::{bail, Context};
use serde::{de::Error as _, Deserialize, Deserializer};
use tracing::{info, warn};
use url::Url;

use crate::cli::{ClientArgs, ServerArgs};

/// Path the relay server accepts WebSocket upgrades on.
pub(crate) const WS_PATH: &str = "/ws";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ServerConfig {
    pub(crate) port: u16,
    pub(crate) backend: String,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub(crate) tcp_keepalive: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ClientConfig {
    #[serde(default = "default_listen")]
    pub(crate) listen: SocketAddr,
    pub(crate) url: Url,
    #[serde(default)]
    pub(crate) proxy: Option<Url>,
    #[serde(default)]
    pub(crate) doh: Option<Url>,
    #[serde(default, deserialize_with = "deserialize_duration")]
    pub(crate) tcp_keepalive: Option<Duration>,
}

fn default_listen() -> SocketAddr {
    (Ipv4Addr::LOCALHOST, 10888).into()
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<String>::deserialize(deserializer)? {
        None => Ok(None),
        Some(text) => parse_duration::parse(&text)
            .map(Some)
            .map_err(D::Error::custom),
    }
}

fn load_toml<T: for<'de> Deserialize<'de>>(path: &Path) -> anyhow::Result<T> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

impl ServerConfig {
    pub(crate) fn from_cli_args(args: &ServerArgs) -> anyhow::Result<Self> {
        let config = match &args.config {
            Some(path) => load_toml(path)?,
            None => Self {
                port: args.port.context("missing listen port")?,
                backend: args.backend.clone().context("missing backend address")?,
                tcp_keepalive: args.tcp_keepalive,
            },
        };
        config.validate()?;
        info!(
            "Relay server on 127.0.0.1:{}, backend {}",
            config.port, config.backend
        );
        Ok(config)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        if self.backend.trim().is_empty() {
            bail!("backend address is empty");
        }
        if self.port == 0 {
            warn!("Listen port 0, a random port will be picked");
        }
        Ok(())
    }
}

impl ClientConfig {
    pub(crate) fn from_cli_args(args: &ClientArgs) -> anyhow::Result<Self> {
        let config = match &args.config {
            Some(path) => load_toml(path)?,
            None => Self {
                listen: args.listen,
                url: args.url.clone().context("missing relay server URL")?,
                proxy: args.proxy.clone(),
                doh: args.doh.clone(),
                tcp_keepalive: args.tcp_keepalive,
            },
        };
        config.validate()?;
        info!("Tunnel client for {}", config.url);
        if let Some(proxy) = &config.proxy {
            info!("Reach relay server via proxy {}", proxy);
        }
        if let Some(doh) = &config.doh {
            info!("Resolve relay server with DoH {}", doh);
        }
        Ok(config)
    }

    pub(crate) fn validate(&self) -> anyhow::Result<()> {
        match self.url.scheme() {
            "ws" | "wss" => (),
            scheme => bail!("unsupported relay server URL scheme: {}", scheme),
        }
        if self.url.host_str().is_none() {
            bail!("relay server URL has no host: {}", self.url);
        }
        if let Some(proxy) = &self.proxy {
            match proxy.scheme() {
                "http" | "socks5" | "socks5h" => (),
                scheme => bail!("unsupported proxy URL scheme: {}", scheme),
            }
            if proxy.host_str().is_none() {
                bail!("proxy URL has no host: {}", proxy);
            }
        }
        if let Some(doh) = &self.doh {
            match doh.scheme() {
                "https" | "http" => (),
                scheme => bail!("unsupported DoH URL scheme: {}", scheme),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_server_toml() {
        let config: ServerConfig = toml::from_str(
            r#"
            port = 9000
            backend = "127.0.0.1:8000"
            tcp_keepalive = "60s"
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.backend, "127.0.0.1:8000");
        assert_eq!(config.tcp_keepalive, Some(Duration::from_secs(60)));
        config.validate().unwrap();
    }

    #[test]
    fn parse_client_toml_with_defaults() {
        let config: ClientConfig = toml::from_str(r#"url = "ws://127.0.0.1:9000/ws""#).unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.proxy, None);
        assert_eq!(config.doh, None);
        assert_eq!(config.tcp_keepalive, None);
        config.validate().unwrap();
    }

    #[test]
    fn reject_unknown_schemes() {
        let mut config: ClientConfig =
            toml::from_str(r#"url = "http://127.0.0.1:9000/ws""#).unwrap();
        assert!(config.validate().is_err());

        config.url = "wss://cdn.example.com/ws".parse().unwrap();
        config.proxy = Some("ftp://127.0.0.1:21".parse().unwrap());
        assert!(config.validate().is_err());

        config.proxy = Some("socks5h://127.0.0.1:1080".parse().unwrap());
        config.doh = Some("https://9.9.9.9/dns-query".parse().unwrap());
        config.validate().unwrap();
    }

    #[test]
    fn reject_unknown_fields() {
        let result: Result<ServerConfig, _> = toml::from_str(
            r#"
            port = 9000
            backend = "127.0.0.1:8000"
            destination = "example.com:80"
            "#,
        );
        assert!(result.is_err());
    }
}
