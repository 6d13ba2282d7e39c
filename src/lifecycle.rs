//! Order status state machine and the role-aware transition policy.
//!
//! Every status change in the system goes through [`can_transition`] so the
//! role-based branching lives in exactly one place instead of being scattered
//! per endpoint.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::api::v1::auth::UserRole;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    New,
    Assigned,
    PickedUp,
    Delivered,
    Canceled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        Self::New,
        Self::Assigned,
        Self::PickedUp,
        Self::Delivered,
        Self::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Assigned => "assigned",
            Self::PickedUp => "picked_up",
            Self::Delivered => "delivered",
            Self::Canceled => "canceled",
        }
    }

    /// Transitions an admin or dispatcher may apply.
    pub fn allowed_transitions(&self) -> &'static [OrderStatus] {
        match self {
            Self::New => &[Self::Assigned, Self::Canceled],
            Self::Assigned => &[Self::PickedUp, Self::Canceled],
            Self::PickedUp => &[Self::Delivered],
            Self::Delivered | Self::Canceled => &[],
        }
    }

    /// Transitions a courier may apply to an order assigned to them.
    pub fn courier_transitions(&self) -> &'static [OrderStatus] {
        match self {
            Self::Assigned => &[Self::PickedUp],
            Self::PickedUp => &[Self::Delivered],
            Self::New | Self::Delivered | Self::Canceled => &[],
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|it| it.as_str() == s)
            .ok_or(())
    }
}

/// Whether `role` may move an order from `from` to `to`.
///
/// `owns_order` is only meaningful for couriers and must be true when the
/// order's assigned courier is the caller's own courier profile.
pub fn can_transition(role: UserRole, owns_order: bool, from: OrderStatus, to: OrderStatus) -> bool {
    match role {
        UserRole::Admin | UserRole::Dispatcher => from.allowed_transitions().contains(&to),
        UserRole::Courier => owns_order && from.courier_transitions().contains(&to),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use OrderStatus::*;
    use UserRole::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>(), Ok(status));
        }

        assert!("cancelled".parse::<OrderStatus>().is_err());
        assert!("".parse::<OrderStatus>().is_err());
        assert!("NEW".parse::<OrderStatus>().is_err());
    }

    #[test]
    fn test_privileged_transitions() {
        for role in [Admin, Dispatcher] {
            assert!(can_transition(role, false, New, Assigned));
            assert!(can_transition(role, false, New, Canceled));
            assert!(can_transition(role, false, Assigned, PickedUp));
            assert!(can_transition(role, false, Assigned, Canceled));
            assert!(can_transition(role, false, PickedUp, Delivered));

            assert!(!can_transition(role, false, New, PickedUp));
            assert!(!can_transition(role, false, New, Delivered));
            assert!(!can_transition(role, false, PickedUp, Canceled));
            for to in OrderStatus::ALL {
                assert!(!can_transition(role, false, Delivered, to));
                assert!(!can_transition(role, false, Canceled, to));
            }
        }
    }

    #[test]
    fn test_courier_transitions_require_ownership() {
        assert!(can_transition(Courier, true, Assigned, PickedUp));
        assert!(can_transition(Courier, true, PickedUp, Delivered));

        assert!(!can_transition(Courier, false, Assigned, PickedUp));
        assert!(!can_transition(Courier, false, PickedUp, Delivered));
    }

    #[test]
    fn test_courier_cannot_assign_or_cancel() {
        assert!(!can_transition(Courier, true, New, Assigned));
        assert!(!can_transition(Courier, true, New, Canceled));
        assert!(!can_transition(Courier, true, Assigned, Canceled));
        for to in OrderStatus::ALL {
            assert!(!can_transition(Courier, true, Delivered, to));
            assert!(!can_transition(Courier, true, Canceled, to));
        }
    }

    #[test]
    fn test_self_transition_never_allowed() {
        for role in [Admin, Dispatcher, Courier] {
            for status in OrderStatus::ALL {
                assert!(!can_transition(role, true, status, status));
            }
        }
    }
}
