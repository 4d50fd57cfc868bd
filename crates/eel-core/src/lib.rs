//! Bidirectional JSON RPC between a host process and one connected peer.
//!
//! Each side exposes named functions and calls the other's by name. Calls
//! are correlated by id; results come back through a callback or by
//! polling.

pub mod dispatcher;
pub mod errors;
pub mod executor;
pub mod ids;
pub mod message;
pub mod registry;
pub mod session;

pub use dispatcher::{PendingCall, PendingCalls, ResponseCallback};
pub use errors::{EelError, HandlerError, Result};
pub use ids::{CallId, ConnectionId};
pub use message::{Command, Message, Response, ADD_SERVER_FUNCTION};
pub use registry::{arg, from_async, from_fn, ExposedFunction, ExposureRegistry};
pub use session::{ConnectionState, Session, SessionConfig};
