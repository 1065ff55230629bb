use crate::types::{Action, Observation, ObservationState, Session};

/// Debounces classifier output into a sticky drowsiness alarm.
///
/// Holds only the threshold; all run state lives in the [`Session`] passed in.
#[derive(Debug, Clone, Copy)]
pub struct DrowsinessTracker {
    threshold: u32,
}

impl DrowsinessTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn step(&self, session: &mut Session, obs: Observation) -> Action {
        let (next, action) = transition(*session, obs, self.threshold);
        *session = next;
        action
    }

    /// Manual acknowledgement. Valid in any state, including after stop.
    pub fn reset_alert(&self, session: &mut Session) -> Action {
        session.alarm = false;
        session.drowsy_count = 0;
        Action::EndAlert
    }
}

fn transition(session: Session, obs: Observation, threshold: u32) -> (Session, Action) {
    let drowsy_count = match obs {
        Observation::Closed | Observation::Yawn => session.drowsy_count.saturating_add(1),
        Observation::Open | Observation::Unknown => 0,
    };

    let next = Session {
        drowsy_count,
        observation: ObservationState::Observed(obs),
        ..session
    };

    // Edge-triggered: only the first crossing raises the alarm.
    if drowsy_count >= threshold && !session.alarm {
        return (Session { alarm: true, ..next }, Action::BeginAlert);
    }

    (next, Action::None)
}
