//! Chrome DevTools Protocol plumbing: the session adapter trait, a
//! `tokio-tungstenite` transport, input dispatch, and run-event capture.

pub mod capture;
pub mod input;
pub mod session;
pub mod transport;

pub use capture::RunEventCapture;
pub use input::InputDispatcher;
pub use session::{CdpSession, EventHandler, MockSession, SentCommand};
pub use transport::WsTransport;
