mod handshake;
mod request;

pub(crate) use handshake::{handshake, SUCCESS_REPLY};
pub(crate) use request::{Socks5Request, TargetAddr};
pub(crate) use request::{
    ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, METHOD_NO_AUTH, SOCKS_VERSION,
};
