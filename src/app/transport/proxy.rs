use std::{
    fmt::{Display, Formatter},
    io::{self, ErrorKind, Result},
    net::IpAddr,
};

use base64::{prelude::BASE64_STANDARD, Engine};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, instrument, trace};
use url::Url;

use crate::app::socks5::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, METHOD_NO_AUTH, SOCKS_VERSION,
};

const METHOD_USERNAME_PASSWORD: u8 = 0x02;
const METHOD_NOT_ACCEPTABLE: u8 = 0xff;
const USERNAME_PASSWORD_VERSION: u8 = 0x01;
const MAX_HTTP_HEAD: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProxyKind {
    /// HTTP CONNECT
    Http,
    /// SOCKSv5 CONNECT, target host name handed over unresolved
    Socks5,
}

/// The proxy the tunnel client goes through to reach the relay server.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct UpstreamProxy {
    kind: ProxyKind,
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

impl std::fmt::Debug for UpstreamProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

impl Display for UpstreamProxy {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let scheme = match self.kind {
            ProxyKind::Http => "http",
            ProxyKind::Socks5 => "socks5",
        };
        write!(f, "{}://{}", scheme, authority(&self.host, self.port))
    }
}

/// `host:port`, with brackets around IPv6 literals.
fn authority(host: &str, port: u16) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(ip)) => format!("[{}]:{}", ip, port),
        _ => format!("{}:{}", host, port),
    }
}

/// Host part of an URL, without brackets around IPv6 literals.
pub(crate) fn url_host(url: &Url) -> Option<String> {
    match url.host()? {
        url::Host::Domain(domain) => Some(domain.to_owned()),
        url::Host::Ipv4(ip) => Some(ip.to_string()),
        url::Host::Ipv6(ip) => Some(ip.to_string()),
    }
}

impl UpstreamProxy {
    pub(crate) fn from_url(url: &Url) -> Result<Self> {
        let (kind, default_port) = match url.scheme() {
            "http" => (ProxyKind::Http, 80),
            "socks5" | "socks5h" => (ProxyKind::Socks5, 1080),
            scheme => io_error!(InvalidInput, "Unsupported proxy scheme {}", scheme),
        };
        let host = match url_host(url) {
            Some(host) => host,
            None => io_error!(InvalidInput, "Proxy URL without host: {}", url),
        };
        let credentials = match url.username() {
            "" => None,
            username => Some((
                username.to_owned(),
                url.password().unwrap_or_default().to_owned(),
            )),
        };
        Ok(Self {
            kind,
            host,
            port: url.port().unwrap_or(default_port),
            credentials,
        })
    }

    /// Open a TCP connection to `host:port` through the proxy.
    #[instrument(skip(self), fields(proxy = %self))]
    pub(crate) async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        match self.kind {
            ProxyKind::Http => {
                http_connect(&mut stream, host, port, self.credentials.as_ref()).await?
            }
            ProxyKind::Socks5 => {
                socks5_connect(&mut stream, host, port, self.credentials.as_ref()).await?
            }
        }
        debug!("Proxy connected to {}", authority(host, port));
        Ok(stream)
    }
}

async fn http_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&(String, String)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let target = authority(host, port);
    let mut request = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n", target);
    if let Some((username, password)) = credentials {
        let token = BASE64_STANDARD.encode(format!("{}:{}", username, password));
        request.push_str(&format!("Proxy-Authorization: Basic {}\r\n", token));
    }
    request.push_str("\r\n");
    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_http_head(stream).await?;
    let status_line = head.lines().next().unwrap_or_default();
    trace!("HTTP proxy replied {:?}", status_line);
    let mut parts = status_line.split_whitespace();
    match (parts.next(), parts.next().map(str::parse::<u16>)) {
        (Some(version), Some(Ok(code))) if version.starts_with("HTTP/1.") => {
            if !(200..300).contains(&code) {
                io_error!(Other, "HTTP proxy refused CONNECT: {}", status_line);
            }
        }
        _ => io_error!("Unrecognized reply from HTTP proxy: {:?}", status_line),
    }
    Ok(())
}

/// Read the response head byte by byte so nothing past it is consumed.
async fn read_http_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HTTP_HEAD {
            io_error!("HTTP proxy response head too large");
        }
        head.push(stream.read_u8().await?);
    }
    String::from_utf8(head).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

async fn socks5_connect<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    credentials: Option<&(String, String)>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Send request w/ auth methods
    match credentials {
        Some(_) => {
            stream
                .write_all(&[
                    SOCKS_VERSION,
                    0x02,
                    METHOD_NO_AUTH,
                    METHOD_USERNAME_PASSWORD,
                ])
                .await?
        }
        None => {
            stream
                .write_all(&[SOCKS_VERSION, 0x01, METHOD_NO_AUTH])
                .await?
        }
    }
    // Server select auth method
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).await?;
    match (buf, credentials) {
        ([SOCKS_VERSION, METHOD_NO_AUTH], _) => (),
        ([SOCKS_VERSION, METHOD_USERNAME_PASSWORD], Some((username, password))) => {
            socks5_authenticate(stream, username, password).await?
        }
        ([SOCKS_VERSION, METHOD_NOT_ACCEPTABLE], _) => {
            io_error!(PermissionDenied, "Auth required by SOCKS server")
        }
        _ => io_error!("Unrecognized reply from SOCKS server"),
    }

    // VER, CMD (CONNECT), RSV, ATYP, DST.ADDR, DST.PORT
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            let len = match u8::try_from(host.len()) {
                Ok(len) => len,
                Err(_) => io_error!(InvalidInput, "Host name too long for SOCKS: {}", host),
            };
            request.push(ATYP_DOMAIN);
            request.push(len);
            request.extend_from_slice(host.as_bytes());
        }
    }
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).await?;
    match reply {
        // Success
        [SOCKS_VERSION, 0x00, _, _] => (),
        [SOCKS_VERSION, code, _, _] => io_error!(
            ConnectionRefused,
            "SOCKS server reject the request: {}",
            reply_message(code)
        ),
        _ => io_error!("Unrecognized reply from SOCKS server"),
    }
    // Skip bound address & port
    let addr_len = match reply[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        _ => io_error!("Unsupported address type from SOCKS server"),
    };
    let mut bound = vec![0u8; addr_len + 2];
    stream.read_exact(&mut bound).await?;
    Ok(())
}

async fn socks5_authenticate<S>(stream: &mut S, username: &str, password: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (ulen, plen) = match (u8::try_from(username.len()), u8::try_from(password.len())) {
        (Ok(ulen), Ok(plen)) => (ulen, plen),
        _ => io_error!(InvalidInput, "SOCKS username or password too long"),
    };
    let mut request = vec![USERNAME_PASSWORD_VERSION, ulen];
    request.extend_from_slice(username.as_bytes());
    request.push(plen);
    request.extend_from_slice(password.as_bytes());
    stream.write_all(&request).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        io_error!(PermissionDenied, "SOCKS server rejected the credentials");
    }
    Ok(())
}

fn reply_message(code: u8) -> &'static str {
    match code {
        0x01 => "general failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "TTL expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown error",
    }
}
