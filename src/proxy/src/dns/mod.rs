use crate::config::ProxyConfig;
use crate::error::Result;
use crate::session::SessionMode;

use common::metrics::metric_def::DNS_QUERIES_TOTAL;
use common::metrics::{common_labels, counter_inc};
use common::ShutdownMessage;
use hashbrown::HashMap;
use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{RData, Record, RecordType};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const ANSWER_TTL: u32 = 3600;

/// DNS interception endpoint on both TCP and UDP. RECORD resolves
/// upstream and caches; resolve failure or REPLAY answers with the
/// proxy's own addresses so egress lands on the interception port.
pub struct DnsResponder {
    config: ProxyConfig,
    mode: SessionMode,
    resolver: Option<TokioAsyncResolver>,
    cache: RwLock<HashMap<(String, RecordType), Vec<IpAddr>>>,
}

impl DnsResponder {
    pub fn new(config: ProxyConfig, mode: SessionMode) -> Self {
        let resolver = match mode {
            SessionMode::Record => match TokioAsyncResolver::tokio_from_system_conf() {
                Ok(resolver) => Some(resolver),
                Err(e) => {
                    warn!("RetraceDns system resolver unavailable: {e}");
                    None
                }
            },
            SessionMode::Test => None,
        };
        Self {
            config,
            mode,
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn serve(
        self: Arc<Self>,
        mut shutdown_rx: watch::Receiver<ShutdownMessage>,
    ) -> Result<()> {
        let port = self.config.dns_port;
        let udp = UdpSocket::bind(("0.0.0.0", port)).await?;
        let tcp = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("RetraceDns listening on {port}/udp and {port}/tcp");

        let udp_task = {
            let this = Arc::clone(&self);
            async move {
                let mut buf = [0u8; 4096];
                loop {
                    match udp.recv_from(&mut buf).await {
                        Ok((n, peer)) => {
                            if let Some(reply) = this.answer(&buf[..n], "udp").await {
                                let _ = udp.send_to(&reply, peer).await;
                            }
                        }
                        Err(e) => {
                            warn!("RetraceDns udp recv err {e}");
                        }
                    }
                }
            }
        };
        let tcp_task = {
            let this = Arc::clone(&self);
            async move {
                loop {
                    match tcp.accept().await {
                        Ok((mut stream, _peer)) => {
                            let this = Arc::clone(&this);
                            tokio::spawn(async move {
                                let mut len_buf = [0u8; 2];
                                if stream.read_exact(&mut len_buf).await.is_err() {
                                    return;
                                }
                                let len = u16::from_be_bytes(len_buf) as usize;
                                let mut msg = vec![0u8; len];
                                if stream.read_exact(&mut msg).await.is_err() {
                                    return;
                                }
                                if let Some(reply) = this.answer(&msg, "tcp").await {
                                    let mut framed =
                                        (reply.len() as u16).to_be_bytes().to_vec();
                                    framed.extend_from_slice(&reply);
                                    let _ = stream.write_all(&framed).await;
                                }
                            });
                        }
                        Err(e) => warn!("RetraceDns tcp accept err {e}"),
                    }
                }
            }
        };

        tokio::select! {
            _ = shutdown_rx.changed() => {
                info!("RetraceDns shutting down");
                Ok(())
            }
            _ = udp_task => Ok(()),
            _ = tcp_task => Ok(()),
        }
    }

    async fn answer(&self, wire: &[u8], transport: &'static str) -> Option<Vec<u8>> {
        let request = match Message::from_vec(wire) {
            Ok(m) => m,
            Err(e) => {
                warn!("RetraceDns malformed query: {e}");
                return None;
            }
        };
        counter_inc(
            DNS_QUERIES_TOTAL,
            1,
            Some(&vec![
                ("transport", transport.to_string()),
                ("node_name", common_labels()[0].1.clone()),
            ]),
        );

        let mut response = Message::new();
        response
            .set_id(request.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(request.recursion_desired())
            .set_recursion_available(true)
            .set_response_code(ResponseCode::NoError);

        for query in request.queries() {
            response.add_query(query.clone());
            let qname = query.name().to_string();
            let qtype = query.query_type();
            for ip in self.resolve(&qname, qtype).await {
                let rdata = match ip {
                    IpAddr::V4(v4) => RData::A(A(v4)),
                    IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
                };
                response.add_answer(Record::from_rdata(
                    query.name().clone(),
                    ANSWER_TTL,
                    rdata,
                ));
            }
        }
        response.to_vec().ok()
    }

    /// Answers for one question, consulting the cache first. Only
    /// A/AAAA produce records; other qtypes return empty.
    async fn resolve(&self, qname: &str, qtype: RecordType) -> Vec<IpAddr> {
        if !matches!(qtype, RecordType::A | RecordType::AAAA) {
            return Vec::new();
        }
        let key = (qname.to_string(), qtype);
        if let Some(cached) = self.cache.read().get(&key) {
            debug!("RetraceDns cache hit {qname} {qtype}");
            return cached.clone();
        }

        let ips = match (&self.resolver, self.mode) {
            (Some(resolver), SessionMode::Record) => match resolver.lookup_ip(qname).await {
                Ok(lookup) => {
                    let ips: Vec<IpAddr> = lookup
                        .iter()
                        .filter(|ip| match qtype {
                            RecordType::A => ip.is_ipv4(),
                            _ => ip.is_ipv6(),
                        })
                        .collect();
                    if ips.is_empty() {
                        self.fallback(qtype)
                    } else {
                        ips
                    }
                }
                Err(e) => {
                    debug!("RetraceDns upstream resolve failed for {qname}: {e}");
                    self.fallback(qtype)
                }
            },
            _ => self.fallback(qtype),
        };
        self.cache.write().insert(key, ips.clone());
        ips
    }

    fn fallback(&self, qtype: RecordType) -> Vec<IpAddr> {
        match qtype {
            RecordType::A => vec![IpAddr::V4(self.config.announce_ipv4)],
            RecordType::AAAA => vec![IpAddr::V6(self.config.announce_ipv6)],
            _ => Vec::new(),
        }
    }
}

/// Rewrites `/etc/nsswitch.conf` so the host resolver prefers `files`
/// then `dns`, making UDP interception reliable during REPLAY; the
/// original content is restored on shutdown.
pub struct NsswitchGuard {
    path: String,
    original: Option<String>,
}

impl NsswitchGuard {
    pub const DEFAULT_PATH: &'static str = "/etc/nsswitch.conf";

    pub fn apply(path: &str) -> std::io::Result<Self> {
        let original = std::fs::read_to_string(path)?;
        let rewritten: String = original
            .lines()
            .map(|line| {
                if line.trim_start().starts_with("hosts:") {
                    "hosts: files dns".to_string()
                } else {
                    line.to_string()
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(path, rewritten + "\n")?;
        Ok(Self {
            path: path.to_string(),
            original: Some(original),
        })
    }

    pub fn restore(&mut self) -> std::io::Result<()> {
        if let Some(original) = self.original.take() {
            std::fs::write(&self.path, original)?;
        }
        Ok(())
    }
}
