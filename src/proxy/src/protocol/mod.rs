pub mod generic;
pub mod grpc;
pub mod http1;
pub mod http2;
pub mod mongo;
pub mod mysql;
pub mod postgres;
pub mod redis;

use crate::config::BypassRule;
use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{Mock, MockStore};
use crate::session::Session;

use common::metrics::metric_def::{PROXY_MOCKS_EMITTED, PROXY_REPLAY_MISSES};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub use generic::GenericParser;
pub use http1::Http1Parser;
pub use http2::Http2Parser;
pub use mongo::MongoParser;
pub use mysql::MySqlParser;
pub use postgres::PostgresParser;
pub use redis::RedisParser;

/// How the parser reaches the original destination when it needs to.
#[derive(Debug, Clone)]
pub struct ConditionalDst {
    pub addr: String,
    pub port: u16,
    pub tls: Option<TlsUpstream>,
}

#[derive(Debug, Clone)]
pub struct TlsUpstream {
    pub server_name: String,
}

impl ConditionalDst {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Everything a parser sees of the outside world: the owning session,
/// the destination, the mock emission path and the error channel.
pub struct ParserCtx {
    pub connection_id: String,
    pub session: Arc<Session>,
    pub dst: ConditionalDst,
    /// Global rules merged with the session's own.
    pub bypass_rules: Vec<BypassRule>,
    pub error_tx: mpsc::Sender<ProxyError>,
}

impl ParserCtx {
    /// Hand a captured mock to the persister channel. Failures are
    /// logged and never block traffic.
    pub async fn emit(&self, mut mock: Mock) {
        let Some(tx) = &self.session.mock_emit else {
            return;
        };
        if let Some(clock) = self.session.backdate_clock {
            mock.created_at -= clock.elapsed().as_millis() as i64;
        }
        debug!(
            "RetraceProxy emit mock {} kind={} conn={}",
            mock.name,
            mock.kind.as_ref(),
            self.connection_id
        );
        if tx.send(mock).await.is_err() {
            warn!("RetraceProxy mock channel closed, capture dropped");
            return;
        }
        common::metrics::counter_inc(PROXY_MOCKS_EMITTED, 1, Some(common::metrics::common_labels()));
    }

    /// Push a typed error to the external monitor channel.
    pub async fn report(&self, err: &ProxyError) {
        if matches!(err, ProxyError::MockNotFound { .. }) {
            common::metrics::counter_inc(
                PROXY_REPLAY_MISSES,
                1,
                Some(common::metrics::common_labels()),
            );
        }
        if self.error_tx.try_send(err.clone_shallow()).is_err() {
            warn!("RetraceProxy error channel full, dropping {err}");
        }
    }

    /// Record usage of a replayed mock; filtered mocks are spent on
    /// first use so repeated identical requests walk the total order.
    pub async fn consume(&self, store: &Arc<MockStore>, mock: &Mock) {
        store.flag_consumed(
            &mock.name,
            crate::mock::ConsumedState {
                usage: if mock.test_mode_info.is_filtered {
                    crate::mock::MockUsage::Deleted
                } else {
                    crate::mock::MockUsage::Updated
                },
                is_filtered: mock.test_mode_info.is_filtered,
                sort_order: mock.test_mode_info.sort_order,
            },
        );
        if mock.test_mode_info.is_filtered {
            store.delete_filtered(mock);
        }
    }

    pub fn bypassed(&self, host: &str, path: &str) -> bool {
        self.bypass_rules
            .iter()
            .chain(self.session.outgoing.bypass_rules.iter())
            .any(|rule| rule.matches(host, self.dst.port, path))
    }

    /// After dispatch, reads follow the session's outgoing policy
    /// instead of the peek deadline.
    pub async fn with_read_timeout<T>(
        &self,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.read_timeout(), fut).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "read timeout",
            ))),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        self.session.outgoing.read_timeout
    }
}

/// The parser registry: a tagged enum with a compile-time priority per
/// variant. Selection walks descending priority; the first match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolParser {
    Http2,
    MySql,
    Postgres,
    Mongo,
    Redis,
    Http1,
    Generic,
}

impl ProtocolParser {
    pub const fn priority(self) -> u8 {
        match self {
            ProtocolParser::Http2 => 100,
            ProtocolParser::MySql => 95,
            ProtocolParser::Postgres => 90,
            ProtocolParser::Redis => 80,
            ProtocolParser::Http1 => 70,
            ProtocolParser::Mongo => 60,
            ProtocolParser::Generic => 0,
        }
    }

    /// Client-first candidates in strict descending priority. MySQL is
    /// absent: it is detected on the destination side.
    pub const CLIENT_FIRST: [ProtocolParser; 6] = [
        ProtocolParser::Http2,
        ProtocolParser::Postgres,
        ProtocolParser::Redis,
        ProtocolParser::Http1,
        ProtocolParser::Mongo,
        ProtocolParser::Generic,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ProtocolParser::Http2 => "http2",
            ProtocolParser::MySql => "mysql",
            ProtocolParser::Postgres => "postgres",
            ProtocolParser::Mongo => "mongo",
            ProtocolParser::Redis => "redis",
            ProtocolParser::Http1 => "http",
            ProtocolParser::Generic => "generic",
        }
    }

    /// Cheap, I/O-free probe on peeked bytes.
    pub fn match_type(self, peek: &[u8]) -> bool {
        match self {
            ProtocolParser::Http2 => Http2Parser::match_type(peek),
            ProtocolParser::MySql => MySqlParser::match_type(peek),
            ProtocolParser::Postgres => PostgresParser::match_type(peek),
            ProtocolParser::Mongo => MongoParser::match_type(peek),
            ProtocolParser::Redis => RedisParser::match_type(peek),
            ProtocolParser::Http1 => Http1Parser::match_type(peek),
            ProtocolParser::Generic => GenericParser::match_type(peek),
        }
    }

    /// Registry selection: a silent client with a MySQL greeting on
    /// the destination side wins outright; otherwise candidates are
    /// probed on the client peek in priority order, generic last.
    pub fn select(client_peek: &[u8], server_peek: &[u8]) -> ProtocolParser {
        if client_peek.is_empty() && MySqlParser::match_type(server_peek) {
            return ProtocolParser::MySql;
        }
        for parser in ProtocolParser::CLIENT_FIRST {
            if parser.match_type(client_peek) {
                return parser;
            }
        }
        ProtocolParser::Generic
    }

    pub async fn record(
        self,
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        match self {
            ProtocolParser::Http2 => Http2Parser::record(ctx, client, upstream).await,
            ProtocolParser::MySql => MySqlParser::record(ctx, client, upstream).await,
            ProtocolParser::Postgres => PostgresParser::record(ctx, client, upstream).await,
            ProtocolParser::Mongo => MongoParser::record(ctx, client, upstream).await,
            ProtocolParser::Redis => RedisParser::record(ctx, client, upstream).await,
            ProtocolParser::Http1 => Http1Parser::record(ctx, client, upstream).await,
            ProtocolParser::Generic => GenericParser::record(ctx, client, upstream).await,
        }
    }

    pub async fn replay(self, ctx: &ParserCtx, client: &mut FlowConn) -> Result<()> {
        match self {
            ProtocolParser::Http2 => Http2Parser::replay(ctx, client).await,
            ProtocolParser::MySql => MySqlParser::replay(ctx, client).await,
            ProtocolParser::Postgres => PostgresParser::replay(ctx, client).await,
            ProtocolParser::Mongo => MongoParser::replay(ctx, client).await,
            ProtocolParser::Redis => RedisParser::replay(ctx, client).await,
            ProtocolParser::Http1 => Http1Parser::replay(ctx, client).await,
            ProtocolParser::Generic => GenericParser::replay(ctx, client).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_strictly_order_the_client_first_list() {
        let priorities: Vec<u8> = ProtocolParser::CLIENT_FIRST
            .iter()
            .map(|p| p.priority())
            .collect();
        let mut sorted = priorities.clone();
        sorted.sort_by(|a, b| b.cmp(a));
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn server_first_mysql_wins_outright() {
        let greeting_peek = [0x0a, b'8', b'.', b'0', b'.'];
        assert_eq!(
            ProtocolParser::select(&[], &greeting_peek),
            ProtocolParser::MySql
        );
        // a client that spoke first never selects mysql
        assert_eq!(
            ProtocolParser::select(b"GET /", &greeting_peek),
            ProtocolParser::Http1
        );
    }

    #[test]
    fn client_first_selection_by_peek() {
        assert_eq!(
            ProtocolParser::select(b"PRI *", &[]),
            ProtocolParser::Http2
        );
        assert_eq!(
            ProtocolParser::select(&[0x00, 0x00, 0x00, 0x52, 0x00], &[]),
            ProtocolParser::Postgres
        );
        assert_eq!(
            ProtocolParser::select(b"*1\r\n$", &[]),
            ProtocolParser::Redis
        );
        assert_eq!(
            ProtocolParser::select(b"POST ", &[]),
            ProtocolParser::Http1
        );
        let mongo_peek = [0x20, 0x00, 0x00, 0x00, 0x01];
        assert_eq!(
            ProtocolParser::select(&mongo_peek, &[]),
            ProtocolParser::Mongo
        );
    }

    #[test]
    fn generic_is_the_fallback() {
        assert_eq!(
            ProtocolParser::select(&[0xde, 0xad, 0xbe, 0xef, 0x00], &[]),
            ProtocolParser::Generic
        );
        assert_eq!(ProtocolParser::select(&[], &[]), ProtocolParser::Generic);
    }
}
