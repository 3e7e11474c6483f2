pub const PROXY_CURR_FLOWS: &str = "retrace_proxy_curr_flows";
pub const PROXY_FLOWS_TOTAL: &str = "retrace_proxy_flows_total";
pub const PROXY_FLOW_LATENCY: &str = "retrace_proxy_flow_latency";
pub const PROXY_MOCKS_EMITTED: &str = "retrace_proxy_mocks_emitted_total";
pub const PROXY_REPLAY_MISSES: &str = "retrace_proxy_replay_misses_total";
pub const DNS_QUERIES_TOTAL: &str = "retrace_dns_queries_total";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { ProxyCurrentFlows, current_flows, MetricType::Gauge, PROXY_CURR_FLOWS, "The number of flows currently dispatched by the proxy."},
    { ProxyFlowsTotal, flows_total, MetricType::Counter, PROXY_FLOWS_TOTAL, "Total flows accepted, labeled by chosen parser."},
    { ProxyFlowLatency, flow_latency, MetricType::Histogram, PROXY_FLOW_LATENCY, "Wall time from accept to flow close."},
    { ProxyMocksEmitted, mocks_emitted, MetricType::Counter, PROXY_MOCKS_EMITTED, "Mocks emitted to the persister channel in record mode."},
    { ProxyReplayMisses, replay_misses, MetricType::Counter, PROXY_REPLAY_MISSES, "Replay requests with no matching mock."},
    { DnsQueriesTotal, dns_queries, MetricType::Counter, DNS_QUERIES_TOTAL, "DNS questions answered, labeled by transport."}
);
