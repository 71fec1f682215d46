pub mod protocol;
pub mod handler;
pub mod server;

pub use handler::{Collaborators, ProtocolSettings, ShareProtocol, SubmitOutcome};
pub use protocol::{Outbound, ServerMessage, SubmitRequest};
pub use server::StratumServer;
