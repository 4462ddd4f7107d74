mod api;
mod config;
mod stream;

pub use api::{ApiClient, ApiError};
pub use config::{MonitorConfig, ResolveConfigError, resolve_config, resolve_config_path};
pub use stream::{EventByteStream, EventSource, SseEventSource, StreamError};
