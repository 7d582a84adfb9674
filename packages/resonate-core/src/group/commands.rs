//! Controller command capability computation.
//!
//! `supported_commands` is the intersection of what the application can
//! service (via [`MediaController`]) and what the current playback state
//! admits. Commands the application cannot service never appear.

use crate::protocol::messages::{ControllerCommandKind, PlaybackState, RepeatMode};

/// Application-side media control surface.
///
/// [`capabilities`](MediaController::capabilities) declares which
/// controller commands the host can service; transport commands the
/// engine cannot satisfy internally (track navigation, repeat, shuffle)
/// are forwarded to the host through the remaining methods.
pub trait MediaController: Send + Sync {
    fn capabilities(&self) -> Vec<ControllerCommandKind>;

    fn next_track(&self, group_id: &str) {
        let _ = group_id;
    }

    fn previous_track(&self, group_id: &str) {
        let _ = group_id;
    }

    fn set_repeat(&self, group_id: &str, mode: RepeatMode) {
        let _ = (group_id, mode);
    }

    fn set_shuffle(&self, group_id: &str, enabled: bool) {
        let _ = (group_id, enabled);
    }

    /// Engine-owned playback transitions, reported for the host's benefit.
    fn playback_changed(&self, group_id: &str, state: PlaybackState) {
        let _ = (group_id, state);
    }
}

/// True when `command` makes sense in `state`.
fn valid_in_state(command: ControllerCommandKind, state: PlaybackState) -> bool {
    use ControllerCommandKind::*;
    match command {
        Play => state != PlaybackState::Playing,
        Pause => state == PlaybackState::Playing,
        Stop => state != PlaybackState::Stopped,
        _ => true,
    }
}

/// Commands currently offered to controllers of a group.
pub fn supported_commands(
    capabilities: &[ControllerCommandKind],
    state: PlaybackState,
) -> Vec<ControllerCommandKind> {
    capabilities
        .iter()
        .copied()
        .filter(|&c| valid_in_state(c, state))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ControllerCommandKind::*;

    struct FullController;

    impl MediaController for FullController {
        fn capabilities(&self) -> Vec<ControllerCommandKind> {
            vec![Play, Pause, Stop, Next, Previous, Volume, Mute, Switch]
        }
    }

    #[test]
    fn pause_only_offered_while_playing() {
        let caps = FullController.capabilities();
        let playing = supported_commands(&caps, PlaybackState::Playing);
        assert!(playing.contains(&Pause));
        assert!(!playing.contains(&Play));

        let paused = supported_commands(&caps, PlaybackState::Paused);
        assert!(paused.contains(&Play));
        assert!(!paused.contains(&Pause));
        assert!(paused.contains(&Stop));

        let stopped = supported_commands(&caps, PlaybackState::Stopped);
        assert!(stopped.contains(&Play));
        assert!(!stopped.contains(&Stop));
    }

    #[test]
    fn unserviceable_commands_never_appear() {
        // An app with no track navigation.
        let caps = vec![Play, Pause, Stop, Volume, Mute];
        for state in [
            PlaybackState::Playing,
            PlaybackState::Paused,
            PlaybackState::Stopped,
        ] {
            let offered = supported_commands(&caps, state);
            assert!(!offered.contains(&Next));
            assert!(!offered.contains(&Previous));
        }
    }
}
