use std::collections::VecDeque;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionMode {
    Live,
    Complete,
}

impl SessionMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Complete => "complete",
        }
    }
}

/// Client-managed liveness, set only by pause/resume actions issued from this
/// client. A status fetch never overwrites it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LocalStatus {
    Running,
    Paused,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Session {
    pub id: String,
    pub mode: SessionMode,
    pub local_status: Option<LocalStatus>,
    pub iteration: u64,
    pub hat: String,
    pub elapsed_secs: f64,
}

impl Session {
    /// Adopts a freshly fetched status document. `mode` is authoritative and
    /// always wins; `local_status` is client-managed and survives the fetch.
    pub fn adopt_status(&mut self, fetched: Session) {
        let local_status = self.local_status;
        *self = fetched;
        self.local_status = local_status;
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    Error { message: String },
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting { .. } => "reconnecting",
            Self::Error { .. } => "error",
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EventRecord {
    pub timestamp: String,
    pub topic: String,
    pub payload: String,
}

/// Display-ordered event container: newest first. Metrics folding never reads
/// this back; it happens on the arrival path. Backed by a deque so appends
/// stay O(1) over a long-lived stream.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct EventLog {
    records: VecDeque<EventRecord>,
}

impl EventLog {
    pub fn push_head(&mut self, record: EventRecord) {
        self.records.push_front(record);
    }

    pub fn head(&self) -> Option<&EventRecord> {
        self.records.front()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn snapshot(&self) -> Vec<EventRecord> {
        self.records.iter().cloned().collect()
    }
}
