mod episode;
mod state;

pub use episode::{Episode, EpisodeId, EpisodeInput, EpisodeStatus};
pub use state::{StageOutcome, StateMachine, Transition};
