pub mod ids;
pub mod run;
pub mod task;

pub use ids::{RunId, TaskId};
pub use run::*;
pub use task::*;
