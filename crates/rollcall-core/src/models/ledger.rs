//! Wire types exchanged with the remote attendance ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInAck {
    #[serde(rename = "alreadyCheckedIn")]
    pub already_checked_in: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyCreated {
    #[serde(rename = "partyId", alias = "party_id")]
    pub party_id: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyJoined {
    #[serde(rename = "partyId", alias = "party_id")]
    pub party_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodayCheckin {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "userRef")]
    pub user_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    #[serde(rename = "userRef")]
    pub user_ref: String,
    pub count: u32,
    /// When the user reached `count`; earlier wins ties.
    #[serde(rename = "achievedAt")]
    pub achieved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Streak {
    pub current: u32,
    pub longest: u32,
    #[serde(rename = "lastCheckIn", default)]
    pub last_check_in: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartySnapshot {
    #[serde(rename = "partyId")]
    pub party_id: String,
    pub code: String,
    pub active: bool,
    #[serde(default)]
    pub members: Vec<String>,
}

/// Order the weekly ranking by count descending, then earliest achievement,
/// then user ref, so every client renders the same order.
pub fn sort_ranking(entries: &mut [RankingEntry]) {
    entries.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then_with(|| a.achieved_at.cmp(&b.achieved_at))
            .then_with(|| a.user_ref.cmp(&b.user_ref))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn entry(user: &str, count: u32, minute: u32) -> RankingEntry {
        RankingEntry {
            user_ref: user.to_string(),
            count,
            achieved_at: Utc.with_ymd_and_hms(2026, 1, 5, 8, minute, 0).unwrap(),
        }
    }

    #[test]
    fn test_ranking_ties_break_on_earliest() {
        let mut entries = vec![
            entry("carol", 3, 10),
            entry("alice", 4, 30),
            entry("bob", 3, 5),
            entry("dave", 3, 5),
        ];
        sort_ranking(&mut entries);
        let order: Vec<&str> = entries.iter().map(|e| e.user_ref.as_str()).collect();
        assert_eq!(order, vec!["alice", "bob", "dave", "carol"]);
    }

    #[test]
    fn test_check_in_ack_wire_format() {
        let ack: CheckInAck = serde_json::from_str(r#"{"alreadyCheckedIn":true}"#).unwrap();
        assert!(ack.already_checked_in);
    }
}
