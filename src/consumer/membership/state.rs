//! Member states and their legal transitions

use std::fmt;

/// Lifecycle state of a group member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberState {
    /// Not part of the group; initial state and state after leaving
    Unsubscribed,
    /// Sent or about to send the first heartbeat after subscribing
    Joining,
    /// Applying a new target assignment through rebalance callbacks
    Reconciling,
    /// Assignment applied; the next heartbeat acknowledges it
    Acknowledging,
    /// Owns the target assignment
    Stable,
    /// Releasing the assignment before sending the leave heartbeat
    PrepareLeaving,
    /// Leave heartbeat pending
    Leaving,
    /// Epoch rejected by the coordinator; releasing assignment to rejoin
    Fenced,
    /// Left the group because the poll timer expired; rejoins on next poll
    Stale,
    /// Unrecoverable error; heartbeats stop for good
    Fatal,
}

use MemberState::*;

impl MemberState {
    pub const ALL: [MemberState; 10] = [
        Unsubscribed,
        Joining,
        Reconciling,
        Acknowledging,
        Stable,
        PrepareLeaving,
        Leaving,
        Fenced,
        Stale,
        Fatal,
    ];

    /// States from which a transition into `self` is legal
    pub fn previous_valid_states(&self) -> &'static [MemberState] {
        match self {
            Unsubscribed => &[PrepareLeaving, Leaving, Fenced, Stale],
            Joining => &[Unsubscribed, Fenced, Stale],
            Reconciling => &[Joining, Reconciling, Acknowledging, Stable],
            Acknowledging => &[Joining, Reconciling, Stable],
            Stable => &[Joining, Reconciling, Acknowledging],
            PrepareLeaving => &[Joining, Reconciling, Acknowledging, Stable, Unsubscribed],
            Leaving => &[PrepareLeaving],
            Fenced => &[Joining, Reconciling, Acknowledging, Stable],
            Stale => &[Leaving],
            Fatal => &[
                Unsubscribed,
                Joining,
                Reconciling,
                Acknowledging,
                Stable,
                PrepareLeaving,
                Leaving,
                Fenced,
                Stale,
            ],
        }
    }

    pub fn can_transition_to(&self, next: MemberState) -> bool {
        next.previous_valid_states().contains(self)
    }

    /// No heartbeat is sent while the member is outside the group
    pub fn should_skip_heartbeat(&self) -> bool {
        matches!(self, Unsubscribed | Fenced | Fatal | Stale)
    }

    /// Heartbeat right away instead of waiting for the interval
    pub fn should_not_wait_for_heartbeat_interval(&self) -> bool {
        matches!(self, Joining | Acknowledging | Leaving)
    }

    pub fn is_leaving_group(&self) -> bool {
        matches!(self, PrepareLeaving | Leaving)
    }

    pub fn can_handle_new_assignment(&self) -> bool {
        matches!(self, Joining | Reconciling | Acknowledging | Stable)
    }

    pub fn is_not_in_group(&self) -> bool {
        matches!(self, Unsubscribed | Fenced | Fatal | Stale)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Unsubscribed => "UNSUBSCRIBED",
            Joining => "JOINING",
            Reconciling => "RECONCILING",
            Acknowledging => "ACKNOWLEDGING",
            Stable => "STABLE",
            PrepareLeaving => "PREPARE_LEAVING",
            Leaving => "LEAVING",
            Fenced => "FENCED",
            Stale => "STALE",
            Fatal => "FATAL",
        }
    }
}

impl fmt::Display for MemberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        let skip: Vec<_> = MemberState::ALL
            .iter()
            .filter(|s| s.should_skip_heartbeat())
            .collect();
        assert_eq!(skip, vec![&Unsubscribed, &Fenced, &Stale, &Fatal]);

        let now: Vec<_> = MemberState::ALL
            .iter()
            .filter(|s| s.should_not_wait_for_heartbeat_interval())
            .collect();
        assert_eq!(now, vec![&Joining, &Acknowledging, &Leaving]);

        assert!(PrepareLeaving.is_leaving_group());
        assert!(Leaving.is_leaving_group());
        assert!(!Stable.is_leaving_group());
        assert!(Stable.can_handle_new_assignment());
        assert!(!Fenced.can_handle_new_assignment());
    }

    #[test]
    fn test_transitions() {
        assert!(Unsubscribed.can_transition_to(Joining));
        assert!(Joining.can_transition_to(Reconciling));
        assert!(Reconciling.can_transition_to(Acknowledging));
        assert!(Acknowledging.can_transition_to(Stable));
        assert!(Stable.can_transition_to(PrepareLeaving));
        assert!(PrepareLeaving.can_transition_to(Leaving));
        assert!(Leaving.can_transition_to(Unsubscribed));
        assert!(Leaving.can_transition_to(Stale));

        assert!(!Unsubscribed.can_transition_to(Stable));
        assert!(!Fatal.can_transition_to(Joining));
        assert!(!Fatal.can_transition_to(Fatal));
        assert!(!Stable.can_transition_to(Leaving));
    }

    #[test]
    fn test_every_non_terminal_state_can_become_fatal() {
        for state in MemberState::ALL {
            assert_eq!(state.can_transition_to(Fatal), state != Fatal);
        }
    }
}
