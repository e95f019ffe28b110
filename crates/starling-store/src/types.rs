use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One person who was present in the channel during a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub uid: String,
    pub name: String,
}

/// Metadata of one loudness sidecar attached to a recording.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaveformInfo {
    pub uid: String,
    pub name: String,
    pub sample_rate: u32,
    pub samples: u32,
    pub max_sample: u8,
    pub size_bytes: u64,
    pub file_id: String,
}

/// One recording segment as stored in the index.
#[derive(Debug, Clone, Serialize)]
pub struct RecordingEntry {
    /// Stable id: the forward-slash-normalized path below the recording root.
    pub id: String,
    pub bot_id: i64,
    pub file_id: String,
    pub file_name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub duration_ms: Option<u64>,
    pub is_open: bool,
    pub participants: Vec<Participant>,
    pub waveforms: Vec<WaveformInfo>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Time window and participant filter for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the start instant.
    pub to: Option<DateTime<Utc>>,
    pub uid: Option<String>,
    pub name: Option<String>,
}

/// Lowercased tokens split out of a `,`/`;` separated filter string.
pub fn filter_tokens(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split([',', ';'])
            .map(|t| t.trim().to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

/// A row matches when some participant name contains a name token (or no
/// name tokens were given) and some participant uid equals a uid token (or
/// no uid tokens were given).
pub fn participants_match(
    participants: &[Participant],
    uid_tokens: &[String],
    name_tokens: &[String],
) -> bool {
    let name_ok = name_tokens.is_empty()
        || participants.iter().any(|p| {
            let lowered = p.name.to_lowercase();
            name_tokens.iter().any(|t| lowered.contains(t.as_str()))
        });
    let uid_ok = uid_tokens.is_empty()
        || participants
            .iter()
            .any(|p| uid_tokens.contains(&p.uid.to_lowercase()));
    name_ok && uid_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    fn who(uid: &str, name: &str) -> Participant {
        Participant {
            uid: uid.into(),
            name: name.into(),
        }
    }

    #[test]
    fn tokens_split_trim_and_lowercase() {
        assert_eq!(
            filter_tokens(Some("Alice, BOB ;carol,,")),
            vec!["alice", "bob", "carol"]
        );
        assert!(filter_tokens(None).is_empty());
        assert!(filter_tokens(Some("  ")).is_empty());
    }

    #[test]
    fn name_tokens_match_substrings() {
        let people = [who("u1", "Alice Cooper")];
        assert!(participants_match(&people, &[], &["coop".into()]));
        assert!(!participants_match(&people, &[], &["bob".into()]));
    }

    #[test]
    fn uid_tokens_require_exact_match() {
        let people = [who("UID-1", "Alice")];
        assert!(participants_match(&people, &["uid-1".into()], &[]));
        assert!(!participants_match(&people, &["uid".into()], &[]));
    }

    #[test]
    fn both_filters_must_hold() {
        let people = [who("u1", "Alice"), who("u2", "Bob")];
        assert!(participants_match(
            &people,
            &["u2".into()],
            &["alice".into()]
        ));
        assert!(!participants_match(
            &people,
            &["u3".into()],
            &["alice".into()]
        ));
    }

    #[test]
    fn empty_filters_match_everything() {
        assert!(participants_match(&[], &[], &[]));
    }
}
