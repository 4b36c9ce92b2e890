//! Work-item priority levels

use serde::{Deserialize, Serialize};

/// Priority of a work item, P0 (urgent) through P3 (background).
///
/// The derived ordering sorts P0 first, which is what hook queues rely
/// on: a P0 item is always claimed before any P1-P3 item regardless of
/// arrival order.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    P0,
    P1,
    #[default]
    P2,
    P3,
}

impl Priority {
    pub fn is_urgent(&self) -> bool {
        matches!(self, Priority::P0)
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::P0 => write!(f, "P0"),
            Priority::P1 => write!(f, "P1"),
            Priority::P2 => write!(f, "P2"),
            Priority::P3 => write!(f, "P3"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p0_sorts_before_everything() {
        let mut priorities = vec![Priority::P3, Priority::P1, Priority::P0, Priority::P2];
        priorities.sort();
        assert_eq!(
            priorities,
            vec![Priority::P0, Priority::P1, Priority::P2, Priority::P3]
        );
    }

    #[test]
    fn default_is_p2() {
        assert_eq!(Priority::default(), Priority::P2);
    }
}
