use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Persisted conversation state of one client on one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConversationState {
    #[default]
    Start,
    MainMenu,
    Course,
    Phone,
}

impl ConversationState {
    pub const ALL: [ConversationState; 4] = [Self::Start, Self::MainMenu, Self::Course, Self::Phone];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::MainMenu => "MAIN_MENU",
            Self::Course => "COURSE",
            Self::Phone => "PHONE",
        }
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown conversation state '{s}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_round_trips_through_str() {
        for state in ConversationState::ALL {
            assert_eq!(state.as_str().parse::<ConversationState>().unwrap(), state);
        }
    }

    #[test]
    fn test_unknown_state_rejected() {
        assert!("LIMBO".parse::<ConversationState>().is_err());
    }
}
