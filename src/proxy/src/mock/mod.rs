pub mod store;

pub use store::{ConsumedState, MockStore, MockUsage};

use base64::Engine;
use chrono::Utc;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use strum_macros::AsRefStr;

/// Protocol family a captured interaction belongs to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, PartialOrd, Ord,
)]
pub enum MockKind {
    Http,
    /// HTTP/2 flows, gRPC included.
    Grpc,
    MySql,
    Postgres,
    Mongo,
    Redis,
    Generic,
}

impl MockKind {
    pub const ALL: [MockKind; 7] = [
        MockKind::Http,
        MockKind::Grpc,
        MockKind::MySql,
        MockKind::Postgres,
        MockKind::Mongo,
        MockKind::Redis,
        MockKind::Generic,
    ];
}

/// Replay bookkeeping attached to every mock. `(sort_order, id)` is the
/// total order used for deterministic replay sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TestModeInfo {
    pub id: i64,
    pub sort_order: i64,
    pub is_filtered: bool,
}

pub type OrderKey = (i64, i64);

impl TestModeInfo {
    pub fn order_key(&self) -> OrderKey {
        (self.sort_order, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadEncoding {
    Plain,
    Base64,
}

/// One captured wire message. Non-ASCII payloads are re-emitted as
/// base64 so the downstream document persister needs no escaping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WirePayload {
    pub data: String,
    pub encoding: PayloadEncoding,
    /// Capture instant, unix millis.
    pub at_unix_ms: i64,
}

impl WirePayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let now = Utc::now().timestamp_millis();
        if bytes.iter().all(|b| b.is_ascii() && *b != 0) {
            Self {
                data: String::from_utf8_lossy(bytes).into_owned(),
                encoding: PayloadEncoding::Plain,
                at_unix_ms: now,
            }
        } else {
            Self {
                data: base64::engine::general_purpose::STANDARD.encode(bytes),
                encoding: PayloadEncoding::Base64,
                at_unix_ms: now,
            }
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        match self.encoding {
            PayloadEncoding::Plain => self.data.as_bytes().to_vec(),
            PayloadEncoding::Base64 => base64::engine::general_purpose::STANDARD
                .decode(&self.data)
                .unwrap_or_default(),
        }
    }
}

/// Ordered request/response message lists for stream protocols.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLog {
    pub requests: Vec<WirePayload>,
    pub responses: Vec<WirePayload>,
}

/// A single HTTP/1.1 transaction, both byte-exact and in parsed form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpExchange {
    pub method: String,
    pub url: String,
    pub proto: String,
    pub request_headers: Vec<(String, String)>,
    pub request_body: WirePayload,
    pub status_code: u16,
    pub response_headers: Vec<(String, String)>,
    pub response_body: WirePayload,
    /// Byte-for-byte dumps used for replay.
    pub raw_request: WirePayload,
    pub raw_response: WirePayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcPseudoHeaders {
    pub method: String,
    pub scheme: String,
    pub path: String,
    pub authority: String,
}

/// HTTP/2 flow captured through the pass-through codec; frame bytes are
/// preserved verbatim so replay is bit-exact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GrpcExchange {
    pub pseudo: GrpcPseudoHeaders,
    pub request_frames: Vec<WirePayload>,
    pub response_frames: Vec<WirePayload>,
    /// The first response message unwrapped from its length-prefixed
    /// gRPC framing; what hand-authored mocks populate.
    pub response_message: Option<WirePayload>,
    /// Trailer values when they could be read from the stream;
    /// `grpc_status` is the decimal status string.
    pub grpc_status: String,
    pub grpc_message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MockSpec {
    Http(HttpExchange),
    Grpc(GrpcExchange),
    MySql(MessageLog),
    Postgres(MessageLog),
    Mongo(MessageLog),
    Redis(MessageLog),
    Generic(MessageLog),
}

impl MockSpec {
    pub fn kind(&self) -> MockKind {
        match self {
            MockSpec::Http(_) => MockKind::Http,
            MockSpec::Grpc(_) => MockKind::Grpc,
            MockSpec::MySql(_) => MockKind::MySql,
            MockSpec::Postgres(_) => MockKind::Postgres,
            MockSpec::Mongo(_) => MockKind::Mongo,
            MockSpec::Redis(_) => MockKind::Redis,
            MockSpec::Generic(_) => MockKind::Generic,
        }
    }
}

/// Immutable unit of captured traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    pub name: String,
    pub kind: MockKind,
    pub version: String,
    pub connection_id: String,
    pub spec: MockSpec,
    pub metadata: HashMap<String, String>,
    /// Unix millis.
    pub created_at: i64,
    pub test_mode_info: TestModeInfo,
}

pub const MOCK_VERSION: &str = "retrace.dev/v1";

static MOCK_SEQ: AtomicU64 = AtomicU64::new(0);

impl Mock {
    /// Build a freshly-captured mock with a sortable name. The numeric
    /// suffix after the first dash is what `drain_consumed` sorts by.
    pub fn captured(connection_id: &str, spec: MockSpec) -> Self {
        let seq = MOCK_SEQ.fetch_add(1, Ordering::Relaxed);
        Self {
            name: format!("mock-{seq}"),
            kind: spec.kind(),
            version: MOCK_VERSION.to_string(),
            connection_id: connection_id.to_string(),
            spec,
            metadata: HashMap::new(),
            created_at: Utc::now().timestamp_millis(),
            test_mode_info: TestModeInfo::default(),
        }
    }

    pub fn with_meta(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn order_key(&self) -> OrderKey {
        self.test_mode_info.order_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_roundtrip_ascii() {
        let p = WirePayload::from_bytes(b"SELECT 1");
        assert_eq!(p.encoding, PayloadEncoding::Plain);
        assert_eq!(p.bytes(), b"SELECT 1");
    }

    #[test]
    fn payload_roundtrip_binary() {
        let raw = [0x00u8, 0xff, 0x10, 0x80];
        let p = WirePayload::from_bytes(&raw);
        assert_eq!(p.encoding, PayloadEncoding::Base64);
        assert_eq!(p.bytes(), raw);
    }

    #[test]
    fn captured_mock_names_are_sortable() {
        let a = Mock::captured("c1", MockSpec::Generic(MessageLog::default()));
        let b = Mock::captured("c1", MockSpec::Generic(MessageLog::default()));
        let na: u64 = a.name.strip_prefix("mock-").unwrap().parse().unwrap();
        let nb: u64 = b.name.strip_prefix("mock-").unwrap().parse().unwrap();
        assert!(nb > na);
        assert_eq!(a.kind, MockKind::Generic);
        assert_eq!(a.version, MOCK_VERSION);
    }
}
