mod run;
mod state;

pub use run::{HistoryEntry, Run};
pub use state::{RunState, Signal};
