//! Server side of the fabric: per-client sessions and the sequencer that
//! totally orders their operations.

mod sequencer;
mod session;
mod subscription;

pub use sequencer::Sequencer;
pub use session::{Session, SessionError, SessionPhase};
pub use subscription::SubscriptionTable;
