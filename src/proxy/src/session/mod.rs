pub mod dest;

pub use dest::{DestInfo, DestRegistry, IpFamily};

use crate::config::BypassRule;
use crate::mock::{Mock, MockStore};

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Capacity of each session's mock emission queue.
pub const MOCK_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Record,
    Test,
}

/// Dial/read policy for upstream connections opened on behalf of a
/// session, plus per-session bypass rules.
#[derive(Debug, Clone)]
pub struct OutgoingOptions {
    pub dial_timeout: Duration,
    pub read_timeout: Duration,
    pub retries: u32,
    pub bypass_rules: Vec<BypassRule>,
}

impl Default for OutgoingOptions {
    fn default() -> Self {
        Self {
            dial_timeout: Duration::from_secs(4),
            read_timeout: Duration::from_secs(30),
            retries: 1,
            bypass_rules: vec![],
        }
    }
}

/// Per-app runtime state. RECORD sessions carry the emission channel,
/// REPLAY sessions a mock store handle.
pub struct Session {
    pub id: u64,
    pub mode: SessionMode,
    pub outgoing: OutgoingOptions,
    pub mock_emit: Option<mpsc::Sender<Mock>>,
    pub mock_store: Option<Arc<MockStore>>,
    pub mocking_enabled: bool,
    /// When set, replayed response timestamps are taken relative to
    /// this instant instead of the wall clock.
    pub backdate_clock: Option<Instant>,
}

impl Session {
    pub fn record(id: u64, outgoing: OutgoingOptions) -> (Self, mpsc::Receiver<Mock>) {
        let (tx, rx) = mpsc::channel(MOCK_CHANNEL_CAPACITY);
        (
            Self {
                id,
                mode: SessionMode::Record,
                outgoing,
                mock_emit: Some(tx),
                mock_store: None,
                mocking_enabled: true,
                backdate_clock: None,
            },
            rx,
        )
    }

    pub fn test(id: u64, outgoing: OutgoingOptions, store: Arc<MockStore>) -> Self {
        Self {
            id,
            mode: SessionMode::Test,
            outgoing,
            mock_emit: None,
            mock_store: Some(store),
            mocking_enabled: true,
            backdate_clock: None,
        }
    }
}

/// App-id keyed session registry.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<u64, Arc<Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, app_id: u64, session: Arc<Session>) {
        self.sessions.insert(app_id, session);
    }

    pub fn get(&self, app_id: u64) -> Option<Arc<Session>> {
        self.sessions.get(&app_id).map(|s| Arc::clone(s.value()))
    }

    /// Open emission channels, used by shutdown to drain before close.
    pub fn all_mock_channels(&self) -> Vec<mpsc::Sender<Mock>> {
        self.sessions
            .iter()
            .filter_map(|s| s.value().mock_emit.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MessageLog, MockSpec};

    #[tokio::test]
    async fn record_session_emits_into_channel() {
        let table = SessionTable::new();
        let (session, mut rx) = Session::record(7, OutgoingOptions::default());
        table.set(7, Arc::new(session));

        let session = table.get(7).unwrap();
        assert_eq!(session.mode, SessionMode::Record);
        session
            .mock_emit
            .as_ref()
            .unwrap()
            .send(Mock::captured("c1", MockSpec::Generic(MessageLog::default())))
            .await
            .unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.connection_id, "c1");
        assert_eq!(table.all_mock_channels().len(), 1);
    }

    #[test]
    fn test_session_holds_store() {
        let store = Arc::new(MockStore::new());
        let session = Session::test(9, OutgoingOptions::default(), Arc::clone(&store));
        assert!(session.mock_emit.is_none());
        assert!(session.mock_store.is_some());
        assert!(session.mocking_enabled);
    }
}
