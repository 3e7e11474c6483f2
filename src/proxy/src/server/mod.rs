pub mod handler;
pub mod listener;
#[cfg(feature = "tls")]
pub mod tls;

pub use handler::{FlowHandler, FlowState};
pub use listener::RetraceProxy;
