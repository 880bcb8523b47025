#[allow(clippy::module_inception)]
pub mod actor;
pub mod messages;
pub mod progress;
pub mod reporter;
pub mod spawn;

pub use actor::{Actor, ActorContext, ActorRef};
pub use progress::ProgressHandle;
pub use reporter::Reporter;
pub use spawn::spawn_actor;
