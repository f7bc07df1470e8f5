pub mod decision;
pub mod enroll;
pub mod supervisor;

pub use decision::{decide, is_monitored, Action, DecisionContext};
pub use enroll::spawn_enroll_listener;
pub use supervisor::{Supervisor, TickSummary};
