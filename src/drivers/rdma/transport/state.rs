//! Connection lifecycle states.

use std::fmt;

/// Lifecycle of an iSER connection.
///
/// States only move forward along
/// `INIT -> UP -> FULL_FEATURE -> TERMINATING -> DOWN`. TERMINATING can be
/// entered from UP or FULL_FEATURE and INIT may drop straight to DOWN when
/// the handshake fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConnectionState {
    Init,
    Up,
    FullFeature,
    Terminating,
    Down,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Init, Up)
                | (Init, Down)
                | (Up, FullFeature)
                | (Up, Terminating)
                | (FullFeature, Terminating)
                | (Terminating, Down)
        )
    }

    /// Whether new work may be posted to the queue pair.
    pub fn accepts_posts(self) -> bool {
        matches!(self, ConnectionState::Up | ConnectionState::FullFeature)
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Down
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Init => "INIT",
            ConnectionState::Up => "UP",
            ConnectionState::FullFeature => "FULL_FEATURE",
            ConnectionState::Terminating => "TERMINATING",
            ConnectionState::Down => "DOWN",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use ConnectionState::*;

    const ALL: [ConnectionState; 5] = [Init, Up, FullFeature, Terminating, Down];

    #[test]
    fn test_allowed_edges() {
        assert!(Init.can_transition_to(Up));
        assert!(Init.can_transition_to(Down));
        assert!(Up.can_transition_to(FullFeature));
        assert!(Up.can_transition_to(Terminating));
        assert!(FullFeature.can_transition_to(Terminating));
        assert!(Terminating.can_transition_to(Down));

        assert!(!Init.can_transition_to(FullFeature));
        assert!(!Init.can_transition_to(Terminating));
        assert!(!Up.can_transition_to(Down));
        assert!(!FullFeature.can_transition_to(Up));
        assert!(!Down.can_transition_to(Init));
        for s in ALL {
            assert!(!s.can_transition_to(s));
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(FullFeature.to_string(), "FULL_FEATURE");
        assert_eq!(Down.to_string(), "DOWN");
    }

    proptest! {
        #[test]
        fn transitions_never_go_backwards(from in 0usize..5, to in 0usize..5) {
            let (a, b) = (ALL[from], ALL[to]);
            if a.can_transition_to(b) {
                prop_assert!(b > a);
            }
        }
    }
}
