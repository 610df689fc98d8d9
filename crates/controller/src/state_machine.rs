//! Node and link lifecycle state machines.
//!
//! Pure functions over the persisted state enums. Every write of an
//! `actual_state` column goes through [`NodeStateMachine::path`] or
//! [`LinkStateMachine::path`] so an observation that skips intermediate
//! states is only applied when a legal route exists.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use crate::persistence::{LinkActualState, LinkDesiredState, NodeActualState, NodeDesiredState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeAction {
    Start,
    Stop,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Start => "start",
            NodeAction::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Connect,
    Disconnect,
}

impl LinkAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkAction::Connect => "connect",
            LinkAction::Disconnect => "disconnect",
        }
    }
}

pub struct NodeStateMachine;

impl NodeStateMachine {
    fn successors(from: NodeActualState) -> &'static [NodeActualState] {
        use NodeActualState::*;
        match from {
            Undeployed => &[Pending, Running, Error],
            Pending => &[Starting, Stopped, Error, Undeployed],
            Starting => &[Running, Error, Exited, Stopping, Stopped],
            Running => &[Stopping, Exited, Error, Stopped],
            Stopping => &[Stopped, Error, Exited],
            Stopped => &[Pending, Starting, Undeployed, Error],
            Exited => &[Starting, Pending, Stopped, Error, Undeployed],
            Error => &[Pending, Starting, Stopping, Stopped, Undeployed],
        }
    }

    pub fn can_transition(from: NodeActualState, to: NodeActualState) -> bool {
        Self::successors(from).contains(&to)
    }

    /// Next state to move toward `desired`, or `None` once there.
    pub fn get_transition_for_desired(
        actual: NodeActualState,
        desired: NodeDesiredState,
    ) -> Option<NodeActualState> {
        use NodeActualState::*;
        match desired {
            NodeDesiredState::Running => match actual {
                Undeployed => Some(Pending),
                Pending => Some(Starting),
                Starting => Some(Running),
                Stopping => Some(Stopped),
                Stopped | Exited => Some(Starting),
                Error => Some(Pending),
                Running => None,
            },
            NodeDesiredState::Stopped => match actual {
                Running | Starting => Some(Stopping),
                Stopping | Pending | Error => Some(Stopped),
                Undeployed | Stopped | Exited => None,
            },
        }
    }

    pub fn matches_desired(actual: NodeActualState, desired: NodeDesiredState) -> bool {
        use NodeActualState::*;
        match desired {
            NodeDesiredState::Running => actual == Running,
            NodeDesiredState::Stopped => matches!(actual, Stopped | Undeployed | Exited),
        }
    }

    pub fn is_transitional(actual: NodeActualState) -> bool {
        matches!(
            actual,
            NodeActualState::Pending | NodeActualState::Starting | NodeActualState::Stopping
        )
    }

    /// Agent action that moves the node toward `desired`.
    ///
    /// Transitional states already have an action in flight and yield `None`,
    /// except `pending`, which is where a dispatched start parks.
    pub fn get_enforcement_action(
        actual: NodeActualState,
        desired: NodeDesiredState,
    ) -> Option<NodeAction> {
        use NodeActualState::*;
        match desired {
            NodeDesiredState::Running => match actual {
                Undeployed | Pending | Stopped | Exited | Error => Some(NodeAction::Start),
                Starting | Stopping | Running => None,
            },
            NodeDesiredState::Stopped => match actual {
                Running | Starting | Pending | Error => Some(NodeAction::Stop),
                Stopping | Stopped | Exited | Undeployed => None,
            },
        }
    }

    pub fn needs_enforcement(actual: NodeActualState, desired: NodeDesiredState) -> bool {
        Self::get_enforcement_action(actual, desired).is_some()
    }

    /// Shortest legal path from `from` to `to`, excluding `from`.
    pub fn path(from: NodeActualState, to: NodeActualState) -> Option<Vec<NodeActualState>> {
        shortest_path(from, to, Self::successors)
    }
}

pub struct LinkStateMachine;

impl LinkStateMachine {
    fn successors(from: LinkActualState) -> &'static [LinkActualState] {
        use LinkActualState::*;
        match from {
            Unknown => &[Pending, Down, Error],
            Pending => &[Creating, Down, Error],
            Creating => &[Up, Error, Down],
            Up => &[Down, Error, Pending],
            Down => &[Pending, Error],
            Error => &[Pending, Creating, Up, Down],
        }
    }

    pub fn can_transition(from: LinkActualState, to: LinkActualState) -> bool {
        Self::successors(from).contains(&to)
    }

    pub fn get_transition_for_desired(
        actual: LinkActualState,
        desired: LinkDesiredState,
    ) -> Option<LinkActualState> {
        use LinkActualState::*;
        match desired {
            LinkDesiredState::Up => match actual {
                Unknown | Down | Error => Some(Pending),
                Pending => Some(Creating),
                Creating => Some(Up),
                Up => None,
            },
            LinkDesiredState::Down => match actual {
                Down => None,
                _ => Some(Down),
            },
        }
    }

    pub fn matches_desired(actual: LinkActualState, desired: LinkDesiredState) -> bool {
        match desired {
            LinkDesiredState::Up => actual == LinkActualState::Up,
            LinkDesiredState::Down => actual == LinkActualState::Down,
        }
    }

    pub fn is_transitional(actual: LinkActualState) -> bool {
        matches!(actual, LinkActualState::Pending | LinkActualState::Creating)
    }

    pub fn get_enforcement_action(
        actual: LinkActualState,
        desired: LinkDesiredState,
    ) -> Option<LinkAction> {
        use LinkActualState::*;
        match desired {
            LinkDesiredState::Up => match actual {
                Unknown | Pending | Down | Error => Some(LinkAction::Connect),
                Creating | Up => None,
            },
            LinkDesiredState::Down => match actual {
                Down => None,
                _ => Some(LinkAction::Disconnect),
            },
        }
    }

    pub fn needs_enforcement(actual: LinkActualState, desired: LinkDesiredState) -> bool {
        Self::get_enforcement_action(actual, desired).is_some()
    }

    /// Auto-connect only once both endpoint nodes report running.
    pub fn should_auto_connect(
        actual: LinkActualState,
        desired: LinkDesiredState,
        source_running: bool,
        target_running: bool,
    ) -> bool {
        desired == LinkDesiredState::Up
            && !matches!(actual, LinkActualState::Up | LinkActualState::Creating)
            && source_running
            && target_running
    }

    pub fn path(from: LinkActualState, to: LinkActualState) -> Option<Vec<LinkActualState>> {
        shortest_path(from, to, Self::successors)
    }
}

fn shortest_path<S>(from: S, to: S, successors: fn(S) -> &'static [S]) -> Option<Vec<S>>
where
    S: Copy + Eq + Hash,
{
    if from == to {
        return Some(Vec::new());
    }
    let mut seen = HashSet::from([from]);
    let mut queue = VecDeque::from([vec![from]]);
    while let Some(route) = queue.pop_front() {
        let Some(&last) = route.last() else {
            continue;
        };
        for &next in successors(last) {
            if !seen.insert(next) {
                continue;
            }
            let mut extended = route.clone();
            extended.push(next);
            if next == to {
                extended.remove(0);
                return Some(extended);
            }
            queue.push_back(extended);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const NODE_STATES: [NodeActualState; 8] = [
        NodeActualState::Undeployed,
        NodeActualState::Pending,
        NodeActualState::Starting,
        NodeActualState::Running,
        NodeActualState::Stopping,
        NodeActualState::Stopped,
        NodeActualState::Exited,
        NodeActualState::Error,
    ];
    const NODE_DESIRED: [NodeDesiredState; 2] =
        [NodeDesiredState::Running, NodeDesiredState::Stopped];
    const LINK_STATES: [LinkActualState; 6] = [
        LinkActualState::Unknown,
        LinkActualState::Pending,
        LinkActualState::Creating,
        LinkActualState::Up,
        LinkActualState::Down,
        LinkActualState::Error,
    ];
    const LINK_DESIRED: [LinkDesiredState; 2] = [LinkDesiredState::Up, LinkDesiredState::Down];

    #[test]
    fn node_actions_always_have_a_legal_next_state() {
        for actual in NODE_STATES {
            for desired in NODE_DESIRED {
                let action = NodeStateMachine::get_enforcement_action(actual, desired);
                assert_eq!(
                    action.is_some(),
                    NodeStateMachine::needs_enforcement(actual, desired)
                );
                if action.is_some() {
                    let next = NodeStateMachine::get_transition_for_desired(actual, desired)
                        .unwrap_or_else(|| panic!("{actual:?}/{desired:?} has no transition"));
                    assert!(
                        NodeStateMachine::can_transition(actual, next),
                        "{actual:?} -> {next:?} is not legal"
                    );
                }
                if NodeStateMachine::matches_desired(actual, desired) {
                    assert!(action.is_none(), "{actual:?} already matches {desired:?}");
                }
            }
        }
    }

    #[test]
    fn node_targets_follow_the_transition_table() {
        for actual in NODE_STATES {
            for desired in NODE_DESIRED {
                if let Some(next) = NodeStateMachine::get_transition_for_desired(actual, desired) {
                    assert!(NodeStateMachine::can_transition(actual, next));
                }
            }
        }
    }

    #[test]
    fn node_transitional_states_do_not_redispatch() {
        assert!(NodeStateMachine::is_transitional(NodeActualState::Starting));
        assert_eq!(
            NodeStateMachine::get_enforcement_action(
                NodeActualState::Starting,
                NodeDesiredState::Running
            ),
            None
        );
        assert_eq!(
            NodeStateMachine::get_enforcement_action(
                NodeActualState::Stopping,
                NodeDesiredState::Stopped
            ),
            None
        );
    }

    #[test]
    fn exited_node_counts_as_stopped() {
        assert!(NodeStateMachine::matches_desired(
            NodeActualState::Exited,
            NodeDesiredState::Stopped
        ));
        assert!(!NodeStateMachine::matches_desired(
            NodeActualState::Exited,
            NodeDesiredState::Running
        ));
    }

    #[test]
    fn node_path_finds_multi_step_route() {
        assert_eq!(
            NodeStateMachine::path(NodeActualState::Pending, NodeActualState::Running),
            Some(vec![NodeActualState::Starting, NodeActualState::Running])
        );
        assert_eq!(
            NodeStateMachine::path(NodeActualState::Running, NodeActualState::Running),
            Some(Vec::new())
        );
        assert!(!NodeStateMachine::can_transition(
            NodeActualState::Stopping,
            NodeActualState::Running
        ));
    }

    #[test]
    fn link_actions_always_have_a_legal_next_state() {
        for actual in LINK_STATES {
            for desired in LINK_DESIRED {
                let action = LinkStateMachine::get_enforcement_action(actual, desired);
                assert_eq!(
                    action.is_some(),
                    LinkStateMachine::needs_enforcement(actual, desired)
                );
                if action.is_some() {
                    let next = LinkStateMachine::get_transition_for_desired(actual, desired)
                        .unwrap_or_else(|| panic!("{actual:?}/{desired:?} has no transition"));
                    assert!(
                        LinkStateMachine::can_transition(actual, next),
                        "{actual:?} -> {next:?} is not legal"
                    );
                }
            }
        }
    }

    #[test]
    fn error_link_can_recover_straight_to_up() {
        assert!(LinkStateMachine::can_transition(
            LinkActualState::Error,
            LinkActualState::Up
        ));
        assert_eq!(
            LinkStateMachine::path(LinkActualState::Pending, LinkActualState::Up),
            Some(vec![LinkActualState::Creating, LinkActualState::Up])
        );
    }

    #[test]
    fn auto_connect_requires_both_endpoints_running() {
        use LinkActualState::*;
        let up = LinkDesiredState::Up;
        assert!(LinkStateMachine::should_auto_connect(Down, up, true, true));
        assert!(LinkStateMachine::should_auto_connect(Error, up, true, true));
        assert!(!LinkStateMachine::should_auto_connect(Down, up, true, false));
        assert!(!LinkStateMachine::should_auto_connect(Up, up, true, true));
        assert!(!LinkStateMachine::should_auto_connect(Creating, up, true, true));
        assert!(!LinkStateMachine::should_auto_connect(
            Down,
            LinkDesiredState::Down,
            true,
            true
        ));
    }
}
