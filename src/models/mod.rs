pub mod ask;
pub mod decision;

pub use ask::{AskRequest, Priority};
pub use decision::{Decision, Status};
