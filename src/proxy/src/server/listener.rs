use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::server::handler::FlowHandler;
#[cfg(feature = "tls")]
use crate::server::tls::TlsShim;
use crate::session::{DestRegistry, SessionTable, MOCK_CHANNEL_CAPACITY};

use common::ShutdownMessage;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Capacity of the external error monitor channel.
const ERROR_CHANNEL_CAPACITY: usize = 256;

/// The interception core: owns the shared registries, binds the proxy
/// port and runs the accept loop until shutdown.
pub struct RetraceProxy {
    pub config: Arc<ProxyConfig>,
    pub sessions: Arc<SessionTable>,
    pub dests: Arc<DestRegistry>,
    #[cfg(feature = "tls")]
    pub tls: Arc<TlsShim>,
    error_tx: mpsc::Sender<ProxyError>,
    error_rx: Option<mpsc::Receiver<ProxyError>>,
}

impl RetraceProxy {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let (error_tx, error_rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        Ok(Self {
            config: Arc::new(config),
            sessions: Arc::new(SessionTable::new()),
            dests: Arc::new(DestRegistry::new()),
            #[cfg(feature = "tls")]
            tls: Arc::new(TlsShim::new()?),
            error_tx,
            error_rx: Some(error_rx),
        })
    }

    /// The typed error stream for external monitors; take-once.
    pub fn take_error_channel(&mut self) -> Option<mpsc::Receiver<ProxyError>> {
        self.error_rx.take()
    }

    fn flow_handler(&self) -> FlowHandler {
        FlowHandler {
            config: Arc::clone(&self.config),
            sessions: Arc::clone(&self.sessions),
            dests: Arc::clone(&self.dests),
            #[cfg(feature = "tls")]
            tls: Arc::clone(&self.tls),
            error_tx: self.error_tx.clone(),
        }
    }

    pub async fn serve(
        &self,
        mut shutdown_rx: watch::Receiver<ShutdownMessage>,
    ) -> Result<()> {
        let port = self.config.proxy_port;
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!("RetraceProxy listening on 0.0.0.0:{port}");

        let mut flows: JoinSet<()> = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("RetraceProxy accept loop stopping");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let handler = self.flow_handler();
                            flows.spawn(async move {
                                if let Err(e) = handler.handle(stream, peer).await {
                                    warn!("RetraceProxy flow {peer} closed with error: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            warn!("RetraceProxy accept connection err. cause by {e:?}");
                        }
                    }
                }
                joined = flows.join_next(), if !flows.is_empty() => {
                    if let Some(Err(e)) = joined {
                        if e.is_panic() {
                            // a panicking flow must not take the proxy down
                            warn!("RetraceProxy recovered panicked flow task: {e}");
                        }
                    }
                }
            }
        }
        drop(listener);

        // graceful wind-down bounded by wait_delay, then hard abort
        let wind_down = async {
            while let Some(joined) = flows.join_next().await {
                if let Err(e) = joined {
                    if e.is_panic() {
                        warn!("RetraceProxy recovered panicked flow task: {e}");
                    }
                }
            }
        };
        if tokio::time::timeout(self.config.wait_delay, wind_down)
            .await
            .is_err()
        {
            warn!("RetraceProxy wind-down deadline hit, aborting open flows");
            flows.abort_all();
            while flows.join_next().await.is_some() {}
        }

        self.drain_mock_channels(self.config.wait_delay).await;
        info!("RetraceProxy shutdown complete");
        Ok(())
    }

    /// Already-produced mocks must reach the persister before close:
    /// wait until every session channel is empty or the deadline hits.
    async fn drain_mock_channels(&self, deadline: Duration) {
        let channels = self.sessions.all_mock_channels();
        if channels.is_empty() {
            return;
        }
        let wait = async {
            loop {
                let drained = channels
                    .iter()
                    .all(|tx| tx.capacity() == MOCK_CHANNEL_CAPACITY || tx.is_closed());
                if drained {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        if tokio::time::timeout(deadline, wait).await.is_err() {
            warn!("RetraceProxy mock channels still busy at shutdown deadline");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MessageLog, Mock, MockSpec};
    use crate::session::{OutgoingOptions, Session};

    #[tokio::test]
    async fn shutdown_drains_mock_channels() {
        let mut proxy = RetraceProxy::new(ProxyConfig::default()).unwrap();
        let _errors = proxy.take_error_channel().unwrap();
        let (session, mut rx) = Session::record(1, OutgoingOptions::default());
        let tx = session.mock_emit.clone().unwrap();
        proxy.sessions.set(1, Arc::new(session));

        tx.send(Mock::captured("c1", MockSpec::Generic(MessageLog::default())))
            .await
            .unwrap();

        let drained = tokio::spawn(async move {
            // the persister keeps consuming while the proxy drains
            rx.recv().await
        });
        proxy.drain_mock_channels(Duration::from_secs(1)).await;
        assert!(drained.await.unwrap().is_some());
    }

    #[tokio::test]
    async fn error_channel_is_take_once() {
        let mut proxy = RetraceProxy::new(ProxyConfig::default()).unwrap();
        assert!(proxy.take_error_channel().is_some());
        assert!(proxy.take_error_channel().is_none());
    }

    #[tokio::test]
    async fn serve_stops_on_shutdown_signal() {
        let config = ProxyConfig {
            proxy_port: 0,
            ..Default::default()
        };
        let proxy = RetraceProxy::new(config).unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

        let server = tokio::spawn(async move { proxy.serve(shutdown_rx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx
            .send(ShutdownMessage::Cancel("test".to_string()))
            .unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .expect("serve did not stop")
            .unwrap();
        assert!(outcome.is_ok());
    }
}
