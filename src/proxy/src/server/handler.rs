use crate::config::{ProxyConfig, PEEK_LEN};
use crate::conn::{tunnel, FlowConn, Side};
use crate::error::{ProxyError, Result};
use crate::protocol::{ConditionalDst, ParserCtx, ProtocolParser, TlsUpstream};
use crate::session::{DestInfo, DestRegistry, Session, SessionMode, SessionTable};
#[cfg(feature = "tls")]
use crate::server::tls::TlsShim;

use common::metrics::metric_def::{PROXY_CURR_FLOWS, PROXY_FLOWS_TOTAL, PROXY_FLOW_LATENCY};
use common::metrics::{common_labels, counter_inc, gauge_dec, gauge_inc, MetricsTimer};
use nanoid::nanoid;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Accepted,
    DestLooked,
    Peeked,
    TlsTerminated,
    ParserChosen,
    Dispatched,
    Closed,
}

/// Lifecycle of one accepted flow. The legs are registered here as
/// soon as they are wrapped, and `close` runs on every exit path, so
/// transitions are total: however a flow ends, it lands in `Closed`
/// with its sockets released.
struct Flow {
    connection_id: String,
    state: FlowState,
    client: Option<FlowConn>,
    upstream: Option<FlowConn>,
}

impl Flow {
    fn new(connection_id: String) -> Self {
        Self {
            connection_id,
            state: FlowState::Accepted,
            client: None,
            upstream: None,
        }
    }

    fn state(&self) -> FlowState {
        self.state
    }

    fn advance(&mut self, next: FlowState) {
        debug!(
            "RetraceProxy {} flow {:?} -> {next:?}",
            self.connection_id, self.state
        );
        self.state = next;
    }

    /// Release resources in reverse order of acquisition: the upstream
    /// leg was dialed after the client was accepted, so it goes down
    /// first. "Closed network connection" errors are swallowed.
    async fn close(&mut self) {
        if let Some(upstream) = self.upstream.as_mut() {
            let _ = upstream.shutdown().await;
        }
        if let Some(client) = self.client.as_mut() {
            let _ = client.shutdown().await;
        }
        self.advance(FlowState::Closed);
    }
}

/// Per-flow orchestrator: destination lookup, dual-side peek, optional
/// TLS termination, parser choice and dispatch.
pub struct FlowHandler {
    pub config: Arc<ProxyConfig>,
    pub sessions: Arc<SessionTable>,
    pub dests: Arc<DestRegistry>,
    #[cfg(feature = "tls")]
    pub tls: Arc<TlsShim>,
    pub error_tx: mpsc::Sender<ProxyError>,
}

async fn peek_tcp(stream: &TcpStream, wait: Duration) -> std::io::Result<Vec<u8>> {
    let mut buf = [0u8; PEEK_LEN];
    match tokio::time::timeout(wait, stream.peek(&mut buf)).await {
        Ok(Ok(n)) => Ok(buf[..n].to_vec()),
        Ok(Err(e)) => Err(e),
        Err(_elapsed) => Ok(Vec::new()),
    }
}

impl FlowHandler {
    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let _latency = MetricsTimer::new_with_labels(PROXY_FLOW_LATENCY, common_labels());
        gauge_inc(PROXY_CURR_FLOWS, 1_f64, Some(common_labels()));
        let result = self.drive(stream, peer).await;
        gauge_dec(PROXY_CURR_FLOWS, 1_f64, Some(common_labels()));
        #[cfg(feature = "tls")]
        self.tls.forget_port(peer.port());

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_benign_disconnect() => Ok(()),
            Err(e) => {
                if !matches!(e, ProxyError::MockNotFound { .. }) {
                    // MockNotFound is pushed by the parser itself
                    if self.error_tx.try_send(e.clone_shallow()).is_err() {
                        warn!("RetraceProxy error channel full, dropping {e}");
                    }
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let mut flow = Flow::new(format!("conn-{}", nanoid!(10)));
        let outcome = self.run_flow(&mut flow, stream, peer).await;
        // transitions are total: success, parser error or an early
        // failure anywhere in the pipeline all land in Closed
        flow.close().await;
        outcome
    }

    async fn run_flow(&self, flow: &mut Flow, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        // destination lookup is one-shot; the entry dies here so the
        // port can be reused by the next flow
        let dest = self.dests.get(peer.port())?;
        self.dests.delete(peer.port());
        flow.advance(FlowState::DestLooked);

        let session = self
            .sessions
            .get(dest.app_id)
            .ok_or(ProxyError::SessionNotFound(dest.app_id))?;

        if self.config.pass_through
            || (session.mode == SessionMode::Test && !session.mocking_enabled)
        {
            debug!(
                "RetraceProxy {} pass-through tunnel to {}",
                flow.connection_id,
                dest.socket_addr()
            );
            return self.tunnel_plain(flow, stream, &session, &dest).await;
        }

        // RECORD dials upstream immediately; REPLAY defers until the
        // TLS branch forces it (and it never does for plain flows)
        let mut upstream_tcp = match session.mode {
            SessionMode::Record => Some(self.dial(&session, &dest).await?),
            SessionMode::Test => None,
        };

        let client_wait = self.config.peek_timeout;
        let (client_peek, server_peek) = tokio::join!(
            peek_tcp(&stream, client_wait),
            async {
                match &upstream_tcp {
                    Some(upstream) => peek_tcp(upstream, client_wait).await,
                    // REPLAY assumes no upstream traffic; the client
                    // peek decides alone
                    None => Ok(Vec::new()),
                }
            }
        );
        let mut client_peek = client_peek?;
        let mut server_peek = server_peek?;
        flow.advance(FlowState::Peeked);

        let mut dst = ConditionalDst {
            addr: dest.ip().to_string(),
            port: dest.port,
            tls: None,
        };

        // TLS branch: terminate on the client side, re-enter the peek
        // step on the decrypted stream, and upgrade the upstream leg
        // to TLS under the same SNI
        #[cfg(feature = "tls")]
        {
            if TlsShim::is_client_hello(&client_peek) {
                let tls_stream = self.tls.terminate(stream, peer.port()).await?;
                let sni = self
                    .tls
                    .sni_for_port(peer.port())
                    .unwrap_or_else(|| dst.addr.clone());
                dst.addr = sni.clone();
                dst.tls = Some(TlsUpstream {
                    server_name: sni.clone(),
                });
                flow.advance(FlowState::TlsTerminated);

                let mut client = FlowConn::new(Side::Client, Box::new(tls_stream));
                client_peek = client.peek_initial(PEEK_LEN, client_wait).await?;
                flow.client = Some(client);
                if let Some(tcp) = upstream_tcp.take() {
                    let tls_up = self.tls.upgrade_upstream(&sni, tcp).await?;
                    let mut upstream = FlowConn::new(Side::Upstream, Box::new(tls_up));
                    // the decision step re-runs on the decrypted legs
                    server_peek = upstream.peek_initial(PEEK_LEN, client_wait).await?;
                    flow.upstream = Some(upstream);
                }
            } else {
                flow.client = Some(FlowConn::new(Side::Client, Box::new(stream)));
                flow.upstream = upstream_tcp
                    .take()
                    .map(|tcp| FlowConn::new(Side::Upstream, Box::new(tcp)));
            }
        }
        #[cfg(not(feature = "tls"))]
        {
            flow.client = Some(FlowConn::new(Side::Client, Box::new(stream)));
            flow.upstream = upstream_tcp
                .take()
                .map(|tcp| FlowConn::new(Side::Upstream, Box::new(tcp)));
        }

        let parser = self.choose_parser(&session, &client_peek, &server_peek);
        flow.advance(FlowState::ParserChosen);
        debug!(
            "RetraceProxy {} parser={} dst={} state={:?}",
            flow.connection_id,
            parser.label(),
            dst.authority(),
            flow.state()
        );
        counter_inc(
            PROXY_FLOWS_TOTAL,
            1,
            Some(&vec![("parser", parser.label().to_string())]),
        );

        let ctx = ParserCtx {
            connection_id: flow.connection_id.clone(),
            session: Arc::clone(&session),
            dst,
            bypass_rules: self.config.bypass_rules.clone(),
            error_tx: self.error_tx.clone(),
        };
        flow.advance(FlowState::Dispatched);
        let Flow {
            client: Some(client),
            upstream,
            ..
        } = flow
        else {
            return Err(ProxyError::malformed("dispatch", "client leg missing"));
        };
        match session.mode {
            SessionMode::Record => {
                let upstream = upstream
                    .as_mut()
                    .ok_or_else(|| ProxyError::malformed("record", "missing upstream leg"))?;
                parser.record(&ctx, client, upstream).await
            }
            SessionMode::Test => parser.replay(&ctx, client).await,
        }
    }

    /// Server-first protocols cannot announce themselves in REPLAY (no
    /// upstream leg exists), so a silent client falls back to the
    /// kinds the store actually holds.
    fn choose_parser(
        &self,
        session: &Session,
        client_peek: &[u8],
        server_peek: &[u8],
    ) -> ProtocolParser {
        if session.mode == SessionMode::Test && client_peek.is_empty() {
            if let Some(store) = &session.mock_store {
                if !store
                    .get_filtered_by_kind(crate::mock::MockKind::MySql)
                    .is_empty()
                    || !store
                        .get_unfiltered_by_kind(crate::mock::MockKind::MySql)
                        .is_empty()
                {
                    return ProtocolParser::MySql;
                }
            }
        }
        ProtocolParser::select(client_peek, server_peek)
    }

    async fn dial(&self, session: &Session, dest: &DestInfo) -> Result<TcpStream> {
        let addr = dest.socket_addr();
        let mut attempt = 0;
        loop {
            match tokio::time::timeout(session.outgoing.dial_timeout, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(stream)) => return Ok(stream),
                Ok(Err(e)) => {
                    if attempt >= session.outgoing.retries {
                        return Err(ProxyError::UpstreamDial {
                            addr: addr.to_string(),
                            source: e,
                        });
                    }
                    warn!("RetraceProxy dial {addr} failed, retrying: {e}");
                    attempt += 1;
                }
                Err(_elapsed) => {
                    return Err(ProxyError::UpstreamDial {
                        addr: addr.to_string(),
                        source: std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "dial timeout",
                        ),
                    })
                }
            }
        }
    }

    async fn tunnel_plain(
        &self,
        flow: &mut Flow,
        stream: TcpStream,
        session: &Session,
        dest: &DestInfo,
    ) -> Result<()> {
        let upstream_tcp = self.dial(session, dest).await?;
        flow.client = Some(FlowConn::new(Side::Client, Box::new(stream)));
        flow.upstream = Some(FlowConn::new(Side::Upstream, Box::new(upstream_tcp)));
        flow.advance(FlowState::Dispatched);
        let Flow {
            client: Some(client),
            upstream: Some(upstream),
            ..
        } = flow
        else {
            return Err(ProxyError::malformed("tunnel", "flow legs missing"));
        };
        match tunnel(client, upstream).await {
            Ok((tx, rx)) => {
                debug!("RetraceProxy tunnel closed tx={tx} rx={rx}");
                Ok(())
            }
            Err(e) => Err(ProxyError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{HttpExchange, MessageLog, Mock, MockSpec, MockStore, WirePayload};
    use crate::session::OutgoingOptions;
    use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn replay_session_with_mysql_mock() -> Arc<Session> {
        let store = Arc::new(MockStore::new());
        store.set_filtered(vec![Mock::captured(
            "c1",
            MockSpec::MySql(MessageLog::default()),
        )]);
        Arc::new(Session::test(1, OutgoingOptions::default(), store))
    }

    fn handler_with(config: ProxyConfig, error_tx: mpsc::Sender<ProxyError>) -> FlowHandler {
        FlowHandler {
            config: Arc::new(config),
            sessions: Arc::new(SessionTable::new()),
            dests: Arc::new(DestRegistry::new()),
            #[cfg(feature = "tls")]
            tls: Arc::new(TlsShim::new().unwrap()),
            error_tx,
        }
    }

    fn handler() -> FlowHandler {
        handler_with(ProxyConfig::default(), mpsc::channel(8).0)
    }

    #[test]
    fn silent_replay_client_with_mysql_mocks_selects_mysql() {
        let handler = handler();
        let session = replay_session_with_mysql_mock();
        assert_eq!(
            handler.choose_parser(&session, &[], &[]),
            ProtocolParser::MySql
        );
    }

    #[test]
    fn replay_client_peek_still_wins() {
        let handler = handler();
        let session = replay_session_with_mysql_mock();
        assert_eq!(
            handler.choose_parser(&session, b"GET /", &[]),
            ProtocolParser::Http1
        );
    }

    #[test]
    fn record_selection_uses_server_peek() {
        let handler = handler();
        let (session, _rx) = Session::record(1, OutgoingOptions::default());
        let greeting = [0x0a, b'8', b'.', b'0', b'.'];
        assert_eq!(
            handler.choose_parser(&Arc::new(session), &[], &greeting),
            ProtocolParser::MySql
        );
    }

    #[tokio::test]
    async fn flow_close_is_total_and_releases_both_legs() {
        let (client_near, mut client_far) = duplex(64);
        let (upstream_near, mut upstream_far) = duplex(64);
        let mut flow = Flow::new("conn-test".to_string());
        flow.client = Some(FlowConn::new(Side::Client, Box::new(client_near)));
        flow.upstream = Some(FlowConn::new(Side::Upstream, Box::new(upstream_near)));
        assert_eq!(flow.state(), FlowState::Accepted);

        flow.close().await;
        assert_eq!(flow.state(), FlowState::Closed);
        // both far ends observe EOF: the legs were shut down, upstream
        // before client
        assert_eq!(upstream_far.read(&mut [0u8; 1]).await.unwrap(), 0);
        assert_eq!(client_far.read(&mut [0u8; 1]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn close_without_legs_still_lands_in_closed() {
        let mut flow = Flow::new("conn-test".to_string());
        flow.advance(FlowState::DestLooked);
        flow.close().await;
        assert_eq!(flow.state(), FlowState::Closed);
    }

    #[tokio::test]
    async fn early_dest_failure_reports_and_releases_the_client() {
        let (err_tx, mut err_rx) = mpsc::channel(8);
        let handler = handler_with(ProxyConfig::default(), err_tx);

        // no DestInfo was published for this flow
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut app = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        let (accepted, peer) = listener.accept().await.unwrap();

        let outcome = handler.handle(accepted, peer).await;
        assert!(matches!(outcome, Err(ProxyError::DestNotFound(_))));
        assert!(matches!(
            err_rx.try_recv().unwrap(),
            ProxyError::DestNotFound(_)
        ));

        // the accepted socket was released on the error path
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), app.read(&mut buf))
            .await
            .expect("client socket was not released")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn replay_flow_runs_the_full_lifecycle() {
        let raw_response = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
        let exchange = HttpExchange {
            method: "GET".to_string(),
            url: "/x".to_string(),
            proto: "HTTP/1.1".to_string(),
            request_headers: vec![("Host".to_string(), "a".to_string())],
            request_body: WirePayload::from_bytes(b""),
            status_code: 200,
            response_headers: vec![("Content-Length".to_string(), "2".to_string())],
            response_body: WirePayload::from_bytes(b"OK"),
            raw_request: WirePayload::from_bytes(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n"),
            raw_response: WirePayload::from_bytes(raw_response),
        };
        let store = Arc::new(MockStore::new());
        store.set_filtered(vec![Mock::captured("rec", MockSpec::Http(exchange))]);

        let config = ProxyConfig {
            peek_timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let handler = handler_with(config, mpsc::channel(8).0);
        handler
            .sessions
            .set(7, Arc::new(Session::test(7, OutgoingOptions::default(), store)));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut app = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        // bytes are in flight before the handler peeks
        app.write_all(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n")
            .await
            .unwrap();
        let src_port = app.local_addr().unwrap().port();
        handler.dests.publish(DestInfo::new_v4(
            src_port,
            u32::from(std::net::Ipv4Addr::LOCALHOST),
            80,
            7,
        ));

        let (accepted, peer) = listener.accept().await.unwrap();
        let driver = tokio::spawn(async move { handler.handle(accepted, peer).await });

        let mut got = vec![0u8; raw_response.len()];
        app.read_exact(&mut got).await.unwrap();
        assert_eq!(&got[..], &raw_response[..]);

        drop(app);
        driver.await.unwrap().unwrap();
    }
}
