//! Streaming append: transport abstraction and the coordinator that persists
//! each completed assistant turn.

pub mod coordinator;
pub mod events;
pub mod transport;

pub use coordinator::StreamingAppendCoordinator;
pub use events::{TurnEvent, TurnEventSender, TurnOutcome, TurnRequest};
pub use transport::{AssistantTransport, Fragment, FragmentStream, TransportFuture};
