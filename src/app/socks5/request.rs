use std::{
    fmt::{Display, Formatter},
    net::Ipv4Addr,
};

pub(crate) const SOCKS_VERSION: u8 = 0x05;
pub(crate) const METHOD_NO_AUTH: u8 = 0x00;
pub(crate) const CMD_CONNECT: u8 = 0x01;

pub(crate) const ATYP_IPV4: u8 = 0x01;
pub(crate) const ATYP_DOMAIN: u8 = 0x03;
pub(crate) const ATYP_IPV6: u8 = 0x04;

/// Destination named in a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TargetAddr {
    Ipv4(Ipv4Addr),
    /// Taken as-is from the request, never resolved.
    Domain(String),
}

/// A parsed CONNECT request. Only ever logged: every tunnel ends at the
/// relay server's backend whatever the client asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Socks5Request {
    pub(crate) addr: TargetAddr,
    pub(crate) port: u16,
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ipv4(ip) => write!(f, "{}", ip),
            TargetAddr::Domain(name) => write!(f, "{}", name),
        }
    }
}

impl Display for Socks5Request {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}
