use std::{
    collections::HashMap,
    io::{self, ErrorKind, Result},
    net::IpAddr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use hickory_proto::{
    op::{Message, MessageType, OpCode, Query, ResponseCode},
    rr::{Name, RData, RecordType},
    serialize::binary::BinEncodable,
};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::{debug, instrument, trace};
use url::Url;

const DNS_MESSAGE: &str = "application/dns-message";
const MIN_TTL: Duration = Duration::from_secs(10);
const MAX_TTL: Duration = Duration::from_secs(3600);

/// Turns the relay server's host name into addresses.
#[async_trait]
pub(crate) trait Resolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Whatever the operating system resolves to.
#[derive(Debug, Default)]
pub(crate) struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// DNS over HTTPS (RFC 8484, POST with wire-format messages). Asks for A
/// records, then AAAA if there were none. Answers are cached for their TTL.
#[derive(Debug)]
pub(crate) struct DohResolver {
    url: Url,
    client: reqwest::Client,
    cache: Mutex<HashMap<String, CachedAnswer>>,
}

#[derive(Debug, Clone)]
struct CachedAnswer {
    addrs: Vec<IpAddr>,
    expires_at: Instant,
}

impl DohResolver {
    pub(crate) fn new(url: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
        Ok(Self {
            url,
            client,
            cache: Default::default(),
        })
    }

    fn cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let mut cache = self.cache.lock();
        match cache.get(host) {
            Some(answer) if answer.expires_at > Instant::now() => Some(answer.addrs.clone()),
            Some(_) => {
                cache.remove(host);
                None
            }
            None => None,
        }
    }

    async fn query(&self, host: &str, rtype: RecordType) -> Result<(Vec<IpAddr>, u32)> {
        let body = encode_query(host, rtype)?;
        let response = self
            .client
            .post(self.url.as_str())
            .header(CONTENT_TYPE, DNS_MESSAGE)
            .header(ACCEPT, DNS_MESSAGE)
            .body(body)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
        let bytes = response
            .bytes()
            .await
            .map_err(|err| io::Error::new(ErrorKind::Other, err))?;
        decode_answer(&bytes, rtype)
    }
}

#[async_trait]
impl Resolver for DohResolver {
    #[instrument(skip(self), fields(doh = %self.url))]
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>> {
        if let Some(addrs) = self.cached(host) {
            trace!("Cached {} => {:?}", host, addrs);
            return Ok(addrs);
        }
        let (mut addrs, mut ttl) = self.query(host, RecordType::A).await?;
        if addrs.is_empty() {
            (addrs, ttl) = self.query(host, RecordType::AAAA).await?;
        }
        if addrs.is_empty() {
            io_error!(NotFound, "No address found for {}", host);
        }
        debug!("Resolved {} => {:?}, TTL {}s", host, addrs, ttl);
        let ttl = Duration::from_secs(ttl.into()).clamp(MIN_TTL, MAX_TTL);
        self.cache.lock().insert(
            host.to_owned(),
            CachedAnswer {
                addrs: addrs.clone(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(addrs)
    }
}

fn encode_query(host: &str, rtype: RecordType) -> Result<Vec<u8>> {
    let name = Name::from_ascii(host).map_err(|err| io::Error::new(ErrorKind::InvalidInput, err))?;
    let mut message = Message::new();
    // ID 0 keeps responses HTTP-cacheable (RFC 8484 4.1)
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, rtype));
    message
        .to_vec()
        .map_err(|err| io::Error::new(ErrorKind::InvalidData, err))
}

/// Addresses of type `rtype` in a DNS response, with their smallest TTL.
fn decode_answer(bytes: &[u8], rtype: RecordType) -> Result<(Vec<IpAddr>, u32)> {
    let message =
        Message::from_vec(bytes).map_err(|err| io::Error::new(ErrorKind::InvalidData, err))?;
    match message.response_code() {
        ResponseCode::NoError => (),
        ResponseCode::NXDomain => io_error!(NotFound, "DoH: no such domain"),
        code => io_error!(Other, "DoH query failed: {:?}", code),
    }
    let mut ttl = u32::MAX;
    let mut addrs = Vec::new();
    for record in message.answers() {
        if record.record_type() != rtype {
            continue;
        }
        let addr: IpAddr = match record.data() {
            Some(RData::A(a)) => a.0.into(),
            Some(RData::AAAA(aaaa)) => aaaa.0.into(),
            _ => continue,
        };
        ttl = ttl.min(record.ttl());
        addrs.push(addr);
    }
    Ok((addrs, ttl))
}

#[cfg(test)]
mod tests {
    use std::{
        net::{Ipv4Addr, Ipv6Addr},
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use hickory_proto::rr::{
        rdata::{A, AAAA},
        Record,
    };
    use tokio::{
        io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
        net::TcpListener,
    };

    use super::*;

    fn response_for(query: &Message, records: &[(RecordType, IpAddr, u32)]) -> Vec<u8> {
        let mut message = Message::new();
        message
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query);
        for q in query.queries() {
            message.add_query(q.clone());
            for (rtype, addr, ttl) in records {
                if *rtype != q.query_type() {
                    continue;
                }
                let rdata = match addr {
                    IpAddr::V4(ip) => RData::A(A(*ip)),
                    IpAddr::V6(ip) => RData::AAAA(AAAA(*ip)),
                };
                message.add_answer(Record::from_rdata(q.name().clone(), *ttl, rdata));
            }
        }
        message.to_vec().unwrap()
    }

    #[test]
    fn decode_a_records() {
        let query = Message::from_vec(&encode_query("relay.example.com", RecordType::A).unwrap())
            .unwrap();
        let v6: IpAddr = Ipv6Addr::LOCALHOST.into();
        let bytes = response_for(
            &query,
            &[
                (RecordType::A, Ipv4Addr::new(192, 0, 2, 1).into(), 300),
                (RecordType::A, Ipv4Addr::new(192, 0, 2, 2).into(), 60),
                (RecordType::AAAA, v6, 10),
            ],
        );
        let (addrs, ttl) = decode_answer(&bytes, RecordType::A).unwrap();
        assert_eq!(
            addrs,
            vec![
                IpAddr::from(Ipv4Addr::new(192, 0, 2, 1)),
                IpAddr::from(Ipv4Addr::new(192, 0, 2, 2)),
            ]
        );
        assert_eq!(ttl, 60);
    }

    #[test]
    fn decode_nxdomain() {
        let mut message = Message::new();
        message
            .set_message_type(MessageType::Response)
            .set_response_code(ResponseCode::NXDomain);
        let bytes = message.to_vec().unwrap();
        let err = decode_answer(&bytes, RecordType::A).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn decode_garbage() {
        let err = decode_answer(b"\x00\x01", RecordType::A).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    /// Minimal DoH endpoint over plain HTTP/1.1 answering every A query with
    /// 198.51.100.7. Counts the queries it served.
    async fn fake_doh_server() -> (Url, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/dns-query", listener.local_addr().unwrap())
            .parse()
            .unwrap();
        let queries = Arc::new(AtomicUsize::new(0));
        let counter = queries.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut stream = BufReader::new(stream);
                    loop {
                        let mut content_length = 0usize;
                        let mut line = String::new();
                        loop {
                            line.clear();
                            if stream.read_line(&mut line).await.unwrap() == 0 {
                                return;
                            }
                            let lower = line.to_ascii_lowercase();
                            if let Some(value) = lower.strip_prefix("content-length:") {
                                content_length = value.trim().parse().unwrap();
                            }
                            if line == "\r\n" {
                                break;
                            }
                        }
                        let mut body = vec![0u8; content_length];
                        stream.read_exact(&mut body).await.unwrap();
                        counter.fetch_add(1, Ordering::SeqCst);

                        let query = Message::from_vec(&body).unwrap();
                        let answer = response_for(
                            &query,
                            &[(RecordType::A, Ipv4Addr::new(198, 51, 100, 7).into(), 120)],
                        );
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
                            DNS_MESSAGE,
                            answer.len()
                        );
                        let stream = stream.get_mut();
                        stream.write_all(head.as_bytes()).await.unwrap();
                        stream.write_all(&answer).await.unwrap();
                    }
                });
            }
        });
        (url, queries)
    }

    #[tokio::test]
    async fn resolve_via_doh_and_cache() {
        let (url, queries) = fake_doh_server().await;
        let resolver = DohResolver::new(url).unwrap();

        let addrs = resolver.resolve("relay.example.com").await.unwrap();
        assert_eq!(addrs, vec![IpAddr::from(Ipv4Addr::new(198, 51, 100, 7))]);
        assert_eq!(queries.load(Ordering::SeqCst), 1);

        let addrs = resolver.resolve("relay.example.com").await.unwrap();
        assert_eq!(addrs, vec![IpAddr::from(Ipv4Addr::new(198, 51, 100, 7))]);
        assert_eq!(queries.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn resolve_localhost_with_system() {
        let addrs = SystemResolver.resolve("localhost").await.unwrap();
        assert!(addrs.iter().all(|addr| addr.is_loopback()));
        assert!(!addrs.is_empty());
    }
}
