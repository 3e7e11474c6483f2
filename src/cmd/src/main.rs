use clap::Parser;
use common::ShutdownMessage;
use proxy::config::ProxyConfig;
use proxy::dns::DnsResponder;
use proxy::server::RetraceProxy;
use proxy::session::{OutgoingOptions, Session, SessionMode};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "retrace",
    version = "0.0.1",
    about = "record-and-replay interception proxy for network-facing test runs."
)]
struct RetraceArgs {
    #[clap(long, value_name = "WORKS", default_value_t = 4)]
    works: usize,
    #[clap(long, value_name = "PORT", default_value_t = 16789)]
    port: u16,
    #[clap(long, value_name = "DNS_PORT", default_value_t = 26789)]
    dns_port: u16,
    /// record | test
    #[clap(long, value_name = "MODE", default_value = "record")]
    mode: String,
    #[clap(long, value_name = "APP_ID", default_value_t = 0)]
    app_id: u64,
    #[clap(long, value_name = "ANNOUNCE_IPV4", default_value = "127.0.0.1")]
    announce_ipv4: Ipv4Addr,
    #[clap(long, value_name = "ANNOUNCE_IPV6", default_value = "::1")]
    announce_ipv6: Ipv6Addr,
    #[clap(long, value_name = "PASS_THROUGH", default_value_t = false)]
    pass_through: bool,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", default_value_t = false)]
    enable_metrics: bool,
    #[clap(long, value_name = "LOG_LEVEL")]
    log_level: Option<String>,
}

impl RetraceArgs {
    fn session_mode(&self) -> anyhow::Result<SessionMode> {
        match self.mode.to_ascii_lowercase().as_str() {
            "record" => Ok(SessionMode::Record),
            "test" | "replay" => Ok(SessionMode::Test),
            other => anyhow::bail!("unknown mode {other}, expected record or test"),
        }
    }

    fn proxy_config(&self) -> ProxyConfig {
        ProxyConfig {
            proxy_port: self.port,
            dns_port: self.dns_port,
            announce_ipv4: self.announce_ipv4,
            announce_ipv6: self.announce_ipv6,
            pass_through: self.pass_through,
            ..Default::default()
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => ShutdownMessage::Cancel("RetraceProxy receive ctrl_c signal".to_string()),
        _ = terminate => ShutdownMessage::Cancel("RetraceProxy receive terminate signal".to_string()),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = RetraceArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hickory_proto=WARN,hickory_resolver=WARN"))
        .add_directive(level.into())
        .add_directive("hickory_proto=WARN".parse().unwrap())
        .add_directive("hickory_resolver=WARN".parse().unwrap());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("RETRACE_PROXY")
        .worker_threads(args.works)
        .build()?;

    info!("RetraceProxy running config args={:?}", args);
    if args.enable_metrics {
        common::metrics::init_metrics_context();
    }

    let mode = args.session_mode()?;
    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);

    runtime.block_on(async {
        let mut retrace = RetraceProxy::new(args.proxy_config())?;

        match mode {
            SessionMode::Record => {
                let (session, mut mock_rx) = Session::record(args.app_id, OutgoingOptions::default());
                retrace.sessions.set(args.app_id, Arc::new(session));
                // stand-in persister: the on-disk document writer is
                // wired here by the test harness
                tokio::spawn(async move {
                    while let Some(mock) = mock_rx.recv().await {
                        info!(
                            "RetracePersist mock name={} kind={:?} conn={}",
                            mock.name, mock.kind, mock.connection_id
                        );
                    }
                });
            }
            SessionMode::Test => {
                let store = Arc::new(proxy::mock::MockStore::new());
                let session = Session::test(args.app_id, OutgoingOptions::default(), store);
                retrace.sessions.set(args.app_id, Arc::new(session));
            }
        }

        let mut error_rx = retrace.take_error_channel().expect("error channel");
        tokio::spawn(async move {
            while let Some(err) = error_rx.recv().await {
                warn!("RetraceMonitor {err}");
            }
        });

        let dns = Arc::new(DnsResponder::new(args.proxy_config(), mode));
        let dns_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = dns.serve(dns_shutdown).await {
                warn!("RetraceDns exited with {e}");
            }
        });

        let serve_shutdown = shutdown_rx.clone();
        let mut serve_handle =
            tokio::spawn(async move { retrace.serve(serve_shutdown).await });
        tokio::select! {
            shutdown_msg = shutdown_signal() => {
                info!("RetraceProxy {shutdown_msg:?}");
                shutdown_tx.send(shutdown_msg)?;
                // the accept loop owns its graceful wind-down
                serve_handle.await??;
            }
            served = &mut serve_handle => {
                served??;
            }
        }
        Ok::<(), anyhow::Error>(())
    })?;
    Ok(())
}
