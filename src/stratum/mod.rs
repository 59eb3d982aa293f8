//! Stratum v1 front end
//!
//! [`reactor::Reactor`] owns the sockets, [`server::StratumServer`] owns the
//! sessions and dispatches their requests.

pub mod extranonce;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod session;

pub use extranonce::SessionFactory;
pub use protocol::{codes, StratumMethod, StratumNotification, StratumRequest, StratumResponse};
pub use reactor::{ConnectionHandler, Reactor, ReactorConfig};
pub use server::{ServerContext, StratumServer};
pub use session::{Session, SessionIdentity, ShareStats};
