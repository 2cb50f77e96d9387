pub mod http;
pub mod retry;
pub mod session;
pub mod transport;

pub use self::http::HttpTransport;
pub use self::retry::{RetryFailure, RetryPolicy};
pub use self::session::{ClientSession, SessionError, SessionEvent, SessionEvents, SessionState};
pub use self::transport::{
    ChatTransport, LocalTransport, PushStream, SharedTransport, TransportError,
};
