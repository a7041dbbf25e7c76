use std::io::Result;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{instrument, trace};

use super::request::{
    Socks5Request, TargetAddr, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, CMD_CONNECT, METHOD_NO_AUTH,
    SOCKS_VERSION,
};

/// VER, REP (succeeded), RSV, ATYP (IPv4), BND.ADDR (0.0.0.0), BND.PORT (0)
pub(crate) const SUCCESS_REPLY: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

/// Serve the SOCKSv5 handshake of a local client up to (and including) the
/// reply, leaving the stream ready for raw relay.
///
/// Only "no authentication" and CONNECT are spoken. The reply always claims
/// success on 0.0.0.0:0 since the real connection is made elsewhere. On any
/// error the caller is expected to drop the stream; nothing is written after
/// the first violation.
#[instrument(skip_all)]
pub(crate) async fn handshake<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    greet(stream).await?;
    let request = read_request(stream).await?;
    stream.write_all(&SUCCESS_REPLY).await?;
    stream.flush().await?;
    Ok(request)
}

async fn greet<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut header = [0u8; 2];
    stream.read_exact(&mut header).await?;
    let [version, n_methods] = header;
    if version != SOCKS_VERSION {
        io_error!("Unsupported SOCKS version {}", version);
    }
    let mut methods = vec![0u8; n_methods as usize];
    stream.read_exact(&mut methods).await?;
    trace!("Client offered auth methods {:?}", methods);

    stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_request<S>(stream: &mut S) -> Result<Socks5Request>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    let [version, command, _reserved, atyp] = header;
    if version != SOCKS_VERSION {
        io_error!("Unsupported SOCKS version {} in request", version);
    }
    if command != CMD_CONNECT {
        io_error!("Unsupported SOCKS command {:#04x}", command);
    }

    let addr = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            TargetAddr::Ipv4(octets.into())
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await?;
            let mut name = vec![0u8; len as usize];
            stream.read_exact(&mut name).await?;
            TargetAddr::Domain(String::from_utf8_lossy(&name).into_owned())
        }
        ATYP_IPV6 => io_error!("IPv6 destination is not supported"),
        _ => io_error!("Unknown address type {:#04x}", atyp),
    };
    let port = stream.read_u16().await?;

    Ok(Socks5Request { addr, port })
}

#[cfg(test)]
mod tests {
    use std::{io::ErrorKind, net::Ipv4Addr};

    use hex_literal::hex;
    use tokio::io::{duplex, DuplexStream};

    use super::*;

    /// Feed `input` as the client, run the handshake, and return its result
    /// together with everything the handshake wrote back.
    async fn run(input: &[u8]) -> (Result<Socks5Request>, Vec<u8>) {
        let (mut client, mut server): (DuplexStream, DuplexStream) = duplex(4096);
        client.write_all(input).await.unwrap();
        client.shutdown().await.unwrap();
        let result = handshake(&mut server).await;
        drop(server);
        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();
        (result, output)
    }

    #[tokio::test]
    async fn connect_ipv4() {
        let (result, output) = run(&hex!("05 01 00 05 01 00 01 5d b8 d8 22 00 50")).await;
        let request = result.unwrap();
        assert_eq!(
            request.addr,
            TargetAddr::Ipv4(Ipv4Addr::new(93, 184, 216, 34))
        );
        assert_eq!(request.port, 80);
        assert_eq!(request.to_string(), "93.184.216.34:80");
        assert_eq!(output, hex!("05 00 05 00 00 01 00 00 00 00 00 00"));
    }

    #[tokio::test]
    async fn connect_domain() {
        let mut input = hex!("05 01 00 05 01 00 03 0b").to_vec();
        input.extend_from_slice(b"example.com");
        input.extend_from_slice(&443u16.to_be_bytes());
        let (result, output) = run(&input).await;
        let request = result.unwrap();
        assert_eq!(request.addr, TargetAddr::Domain("example.com".into()));
        assert_eq!(request.to_string(), "example.com:443");
        assert_eq!(output[..2], [0x05, 0x00]);
        assert_eq!(output[2..], SUCCESS_REPLY);
    }

    #[tokio::test]
    async fn any_method_list_is_accepted() {
        for n_methods in [0usize, 1, 3, 255] {
            let mut input = vec![0x05, n_methods as u8];
            input.extend((0..n_methods).map(|i| i as u8));
            input.extend_from_slice(&hex!("05 01 00 01 7f 00 00 01 1f 90"));
            let (result, output) = run(&input).await;
            assert_eq!(result.unwrap().to_string(), "127.0.0.1:8080");
            assert_eq!(output[..2], [0x05, 0x00], "{} methods", n_methods);
        }
    }

    #[tokio::test]
    async fn wrong_version_gets_no_reply() {
        for version in [0x00, 0x04, 0x06] {
            let (result, output) = run(&[version, 0x01, 0x00]).await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidData);
            assert!(output.is_empty());
        }
    }

    #[tokio::test]
    async fn non_connect_command_rejected() {
        // BIND, UDP ASSOCIATE
        for command in [0x02, 0x03] {
            let (result, output) =
                run(&[0x05, 0x01, 0x00, 0x05, command, 0x00, 0x01, 1, 2, 3, 4, 0, 80]).await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidData);
            // Only the method selection went out, no request reply.
            assert_eq!(output, hex!("05 00"));
        }
    }

    #[tokio::test]
    async fn ipv6_and_unknown_address_types_rejected() {
        let mut ipv6 = hex!("05 01 00 05 01 00 04").to_vec();
        ipv6.extend_from_slice(&[0u8; 16]);
        ipv6.extend_from_slice(&hex!("00 50"));
        let (result, output) = run(&ipv6).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidData);
        assert_eq!(output, hex!("05 00"));

        let (result, output) = run(&hex!("05 01 00 05 01 00 07 00 50")).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidData);
        assert_eq!(output, hex!("05 00"));
    }

    #[tokio::test]
    async fn short_reads_fail() {
        for input in [
            &hex!("05")[..],
            &hex!("05 03 00")[..],
            &hex!("05 01 00 05 01")[..],
            &hex!("05 01 00 05 01 00 01 7f 00")[..],
            &hex!("05 01 00 05 01 00 03 0b 65 78")[..],
            &hex!("05 01 00 05 01 00 01 7f 00 00 01 1f")[..],
        ] {
            let (result, output) = run(input).await;
            assert_eq!(result.unwrap_err().kind(), ErrorKind::UnexpectedEof);
            assert!(!output.ends_with(&SUCCESS_REPLY));
        }
    }

    #[tokio::test]
    async fn stream_is_left_at_payload() {
        let (mut client, mut server) = duplex(4096);
        client
            .write_all(&hex!("05 01 00 05 01 00 01 0a 00 00 01 00 16"))
            .await
            .unwrap();
        client.write_all(b"payload").await.unwrap();
        let request = handshake(&mut server).await.unwrap();
        assert_eq!(request.to_string(), "10.0.0.1:22");
        let mut rest = [0u8; 7];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(&rest, b"payload");
    }
}
