mod backoff;
mod gate;
mod metrics;
mod sse;
mod types;

pub use backoff::{ReconnectPolicy, ReconnectState};
pub use gate::is_live_eligible;
pub use metrics::{TokenMetrics, fold_record};
pub use sse::FrameParser;
pub use types::{ConnectionState, EventLog, EventRecord, LocalStatus, Session, SessionMode};
