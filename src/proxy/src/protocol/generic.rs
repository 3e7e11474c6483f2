use crate::conn::FlowConn;
use crate::error::{ProxyError, Result};
use crate::mock::{MessageLog, Mock, MockKind, MockSpec, WirePayload};
use crate::protocol::ParserCtx;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

const BURST_BUFFER: usize = 16 * 1024;

/// Lowest-priority byte-stream parser: copies bytes both ways and
/// frames each burst as a request or response in arrival order.
pub struct GenericParser;

impl GenericParser {
    /// The generic parser always matches.
    pub fn match_type(_peek: &[u8]) -> bool {
        true
    }

    pub async fn record(
        ctx: &ParserCtx,
        client: &mut FlowConn,
        upstream: &mut FlowConn,
    ) -> Result<()> {
        let mut log = MessageLog::default();
        let mut client_buf = vec![0u8; BURST_BUFFER];
        let mut upstream_buf = vec![0u8; BURST_BUFFER];

        loop {
            tokio::select! {
                read = client.read(&mut client_buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    upstream.write_all(&client_buf[..n]).await?;
                    upstream.flush().await?;
                    log.requests.push(WirePayload::from_bytes(&client_buf[..n]));
                }
                read = upstream.read(&mut upstream_buf) => {
                    let n = read?;
                    if n == 0 {
                        break;
                    }
                    client.write_all(&upstream_buf[..n]).await?;
                    client.flush().await?;
                    log.responses.push(WirePayload::from_bytes(&upstream_buf[..n]));
                }
            }
        }

        if !log.requests.is_empty() || !log.responses.is_empty() {
            ctx.emit(Mock::captured(&ctx.connection_id, MockSpec::Generic(log)))
                .await;
        }
        Ok(())
    }

    pub async fn replay(ctx: &ParserCtx, client: &mut FlowConn) -> Result<()> {
        let store = ctx
            .session
            .mock_store
            .as_ref()
            .ok_or_else(|| ProxyError::malformed("replay", "session has no mock store"))?;
        let mut buf = vec![0u8; BURST_BUFFER];

        loop {
            let n = client.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            let burst = &buf[..n];

            let matched = store
                .get_filtered_by_kind(MockKind::Generic)
                .into_iter()
                .chain(store.get_unfiltered_by_kind(MockKind::Generic))
                .find(|m| match &m.spec {
                    MockSpec::Generic(log) => log
                        .requests
                        .first()
                        .map(|req| req.bytes() == burst)
                        .unwrap_or(false),
                    _ => false,
                });

            let Some(mock) = matched else {
                let err = ProxyError::MockNotFound {
                    kind: MockKind::Generic,
                    connection_id: ctx.connection_id.clone(),
                };
                ctx.report(&err).await;
                return Err(err);
            };

            debug!("RetraceProxy generic replay hit mock {}", mock.name);
            if let MockSpec::Generic(log) = &mock.spec {
                for response in &log.responses {
                    client.write_all(&response.bytes()).await?;
                }
                client.flush().await?;
            }
            ctx.consume(store, &mock).await;
        }
    }
}
