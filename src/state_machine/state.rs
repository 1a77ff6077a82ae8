use chrono::Utc;

use super::episode::{Episode, EpisodeStatus};
use crate::error::{ErrorKind, LifecycleError};

/// The result of the stage an episode just went through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Success,
    Failure(ErrorKind),
}

/// The result of evaluating a lifecycle transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Advanced to the next status.
    Next(EpisodeStatus),
    /// Moved to `failed`; the episode is now terminal.
    Failed(ErrorKind),
}

/// Drives an `Episode` through its lifecycle.
pub struct StateMachine;

impl StateMachine {
    /// Apply the outcome of the current stage to the episode.
    ///
    /// - Success advances to the next status in the fixed chain.
    /// - Failure moves to `failed` from any non-terminal status.
    /// - `synced` and `failed` are immutable; any outcome is rejected.
    pub fn next(episode: &mut Episode, outcome: StageOutcome) -> Result<Transition, LifecycleError> {
        if episode.status.is_terminal() {
            return Err(LifecycleError::Terminal {
                episode_id: episode.id.to_string(),
                status: episode.status.to_string(),
            });
        }

        let transition = match outcome {
            StageOutcome::Success => match episode.status.successor() {
                Some(next) => Transition::Next(next),
                None => {
                    return Err(LifecycleError::Illegal {
                        episode_id: episode.id.to_string(),
                        from: episode.status.to_string(),
                        to: "next".into(),
                    });
                }
            },
            StageOutcome::Failure(kind) => Transition::Failed(kind),
        };

        episode.status_history.push(episode.status);
        episode.status = match transition {
            Transition::Next(next) => next,
            Transition::Failed(_) => EpisodeStatus::Failed,
        };
        episode.updated_at = Utc::now();

        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_machine::EpisodeId;

    fn make_episode(status: EpisodeStatus) -> Episode {
        let mut ep = Episode::new(
            EpisodeId::new("feed", "guid"),
            "Test".into(),
            "audio.mp3".into(),
            Utc::now(),
        );
        ep.status = status;
        ep
    }

    #[test]
    fn happy_path_walks_all_statuses() {
        let mut ep = make_episode(EpisodeStatus::Transcribed);

        let t = StateMachine::next(&mut ep, StageOutcome::Success).unwrap();
        assert_eq!(t, Transition::Next(EpisodeStatus::Generated));
        let t = StateMachine::next(&mut ep, StageOutcome::Success).unwrap();
        assert_eq!(t, Transition::Next(EpisodeStatus::Imported));
        let t = StateMachine::next(&mut ep, StageOutcome::Success).unwrap();
        assert_eq!(t, Transition::Next(EpisodeStatus::Synced));

        assert_eq!(
            ep.status_history,
            vec![
                EpisodeStatus::Transcribed,
                EpisodeStatus::Generated,
                EpisodeStatus::Imported
            ]
        );
    }

    #[test]
    fn failure_is_allowed_from_any_open_status() {
        for status in [
            EpisodeStatus::Discovered,
            EpisodeStatus::Transcribed,
            EpisodeStatus::Generated,
            EpisodeStatus::Imported,
        ] {
            let mut ep = make_episode(status);
            let t = StateMachine::next(&mut ep, StageOutcome::Failure(ErrorKind::GenerationTimeout))
                .unwrap();
            assert_eq!(t, Transition::Failed(ErrorKind::GenerationTimeout));
            assert_eq!(ep.status, EpisodeStatus::Failed);
        }
    }

    #[test]
    fn terminal_episodes_are_immutable() {
        let mut synced = make_episode(EpisodeStatus::Synced);
        assert!(StateMachine::next(&mut synced, StageOutcome::Success).is_err());

        let mut failed = make_episode(EpisodeStatus::Failed);
        let err = StateMachine::next(&mut failed, StageOutcome::Failure(ErrorKind::GenerationError))
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Terminal { .. }));
        assert_eq!(failed.status, EpisodeStatus::Failed);
    }
}
