use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::CacheError;

/// Identifier of a cached server resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceKey {
    TodayCheckins,
    WeeklyRanking,
    Streak(String),
    Party(String),
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKey::TodayCheckins => f.write_str("today_checkins"),
            ResourceKey::WeeklyRanking => f.write_str("weekly_ranking"),
            ResourceKey::Streak(user) => write!(f, "streak:{}", user),
            ResourceKey::Party(party) => write!(f, "party:{}", party),
        }
    }
}

impl FromStr for ResourceKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "today_checkins" => return Ok(ResourceKey::TodayCheckins),
            "weekly_ranking" => return Ok(ResourceKey::WeeklyRanking),
            _ => {}
        }
        match s.split_once(':') {
            Some(("streak", user)) if !user.is_empty() => Ok(ResourceKey::Streak(user.to_string())),
            Some(("party", party)) if !party.is_empty() => Ok(ResourceKey::Party(party.to_string())),
            _ => Err(CacheError::UnknownKey(s.to_string())),
        }
    }
}

impl TryFrom<String> for ResourceKey {
    type Error = CacheError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKey> for String {
    fn from(key: ResourceKey) -> Self {
        key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names() {
        assert_eq!(ResourceKey::TodayCheckins.to_string(), "today_checkins");
        assert_eq!(ResourceKey::Streak("u7".into()).to_string(), "streak:u7");
        assert_eq!("party:p1".parse::<ResourceKey>().unwrap(), ResourceKey::Party("p1".into()));
        assert_eq!("streak:a:b".parse::<ResourceKey>().unwrap(), ResourceKey::Streak("a:b".into()));
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!("nutrition".parse::<ResourceKey>().is_err());
        assert!("streak:".parse::<ResourceKey>().is_err());
    }
}
