use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type AlertId = i64;
pub type SentenceId = i64;
pub type EventId = i64;
pub type SenderId = i64;

// --- Phrases ---

/// Ordered set of normalized keyphrases.
///
/// Backed by a `BTreeSet` so iteration, comparison and the array written to
/// Postgres are deterministic. Blank phrases are dropped on insert; anything
/// else is kept verbatim because normalization happens upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PhraseSet(BTreeSet<String>);

impl PhraseSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, phrase: impl Into<String>) -> bool {
        let phrase = phrase.into();
        if phrase.trim().is_empty() {
            return false;
        }
        self.0.insert(phrase)
    }

    /// True when every phrase in `other` is also in `self` (`self ⊇ other`).
    /// The empty set is contained in everything.
    pub fn contains_all(&self, other: &PhraseSet) -> bool {
        other.0.is_subset(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sorted owned copy, suitable for binding as a `TEXT[]`.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: Into<String>> FromIterator<S> for PhraseSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut set = PhraseSet::new();
        for phrase in iter {
            set.insert(phrase);
        }
        set
    }
}

impl From<Vec<String>> for PhraseSet {
    fn from(phrases: Vec<String>) -> Self {
        phrases.into_iter().collect()
    }
}

// --- Alerts ---

/// One sentence of an alert body with its own keyphrases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    /// Assigned by the store.
    pub id: Option<SentenceId>,
    /// Owning alert, assigned by the store.
    pub alert_id: Option<AlertId>,
    pub value: String,
    pub phrases: PhraseSet,
}

impl Sentence {
    pub fn new(value: impl Into<String>, phrases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            id: None,
            alert_id: None,
            value: value.into(),
            phrases: phrases.into_iter().collect(),
        }
    }
}

/// A news alert plus the features extracted from it.
///
/// On write, `sender` carries the display name and `id`, `sender_id` and
/// `top_sentence_id` are ignored. On read, the store fills those in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Option<AlertId>,
    pub sender: String,
    pub sender_id: Option<SenderId>,
    pub article_url: String,
    pub timestamp: DateTime<Utc>,
    /// Stored keyphrases. This is the set candidates are matched against.
    pub top_phrases: PhraseSet,
    /// Tags an incoming alert is matched with. Not persisted; empty means
    /// "use `top_phrases`".
    #[serde(default)]
    pub tags: PhraseSet,
    pub subject: String,
    pub raw_body: String,
    pub body: String,
    pub sentences: Vec<Sentence>,
    pub top_sentence: String,
    pub top_sentence_id: Option<SentenceId>,
}

impl Alert {
    pub fn new(
        sender: impl Into<String>,
        article_url: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            sender_id: None,
            article_url: article_url.into(),
            timestamp,
            top_phrases: PhraseSet::new(),
            tags: PhraseSet::new(),
            subject: String::new(),
            raw_body: String::new(),
            body: String::new(),
            sentences: Vec::new(),
            top_sentence: String::new(),
            top_sentence_id: None,
        }
    }

    pub fn with_top_phrases(mut self, phrases: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.top_phrases = phrases.into_iter().collect();
        self
    }

    pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.tags = tags.into_iter().collect();
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn with_body(mut self, raw_body: impl Into<String>, body: impl Into<String>) -> Self {
        self.raw_body = raw_body.into();
        self.body = body.into();
        self
    }

    pub fn with_sentence(mut self, sentence: Sentence) -> Self {
        self.sentences.push(sentence);
        self
    }

    pub fn with_top_sentence(mut self, value: impl Into<String>) -> Self {
        self.top_sentence = value.into();
        self
    }

    /// The tag set used to look for duplicates of this alert.
    pub fn match_tags(&self) -> &PhraseSet {
        if self.tags.is_empty() {
            &self.top_phrases
        } else {
            &self.tags
        }
    }

    /// Index of the first sentence whose text equals `top_sentence`. An
    /// empty `top_sentence` means none was chosen and never matches.
    pub fn top_sentence_index(&self) -> Option<usize> {
        if self.top_sentence.is_empty() {
            return None;
        }
        self.sentences
            .iter()
            .position(|s| s.value == self.top_sentence)
    }
}

// --- Events ---

/// A cluster of alerts believed to report the same happening.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Absent until the event is first upserted.
    pub id: Option<EventId>,
    pub alert_ids: BTreeSet<AlertId>,
}

impl Event {
    pub fn new(alert_ids: impl IntoIterator<Item = AlertId>) -> Self {
        Self {
            id: None,
            alert_ids: alert_ids.into_iter().collect(),
        }
    }

    pub fn with_id(mut self, id: EventId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn intersects(&self, ids: &[AlertId]) -> bool {
        ids.iter().any(|id| self.alert_ids.contains(id))
    }

    /// Membership as a sorted vec, suitable for binding as a `BIGINT[]`.
    pub fn alert_id_vec(&self) -> Vec<AlertId> {
        self.alert_ids.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn phrase_set_drops_blank_entries_and_sorts() {
        let set: PhraseSet = ["zeta", " ", "alpha", "", "alpha"].into_iter().collect();
        assert_eq!(set.to_vec(), vec!["alpha".to_string(), "zeta".to_string()]);
    }

    #[test]
    fn containment_is_asymmetric() {
        let stored: PhraseSet = ["p1", "p2"].into_iter().collect();
        let incoming: PhraseSet = ["p1"].into_iter().collect();
        assert!(stored.contains_all(&incoming));
        assert!(!incoming.contains_all(&stored));
        assert!(stored.contains_all(&PhraseSet::new()));
    }

    #[test]
    fn match_tags_fall_back_to_top_phrases() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let alert = Alert::new("NYT", "https://example.com/a", ts).with_top_phrases(["p1", "p2"]);
        assert_eq!(alert.match_tags().len(), 2);

        let tagged = alert.with_tags(["p1"]);
        assert_eq!(tagged.match_tags().to_vec(), vec!["p1".to_string()]);
    }

    #[test]
    fn top_sentence_index_finds_first_match() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let alert = Alert::new("NYT", "https://example.com/a", ts)
            .with_sentence(Sentence::new("one", ["a"]))
            .with_sentence(Sentence::new("two", ["b"]))
            .with_top_sentence("two");
        assert_eq!(alert.top_sentence_index(), Some(1));

        let missing = alert.with_top_sentence("three");
        assert_eq!(missing.top_sentence_index(), None);
    }

    #[test]
    fn unset_top_sentence_never_matches_an_empty_sentence() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let alert = Alert::new("NYT", "https://example.com/a", ts)
            .with_sentence(Sentence::new("", Vec::<String>::new()))
            .with_sentence(Sentence::new("two", ["b"]));
        assert_eq!(alert.top_sentence_index(), None);
    }

    #[test]
    fn phrase_set_serializes_as_sorted_array() {
        let set: PhraseSet = ["b", "a"].into_iter().collect();
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["a","b"]"#);
    }

    #[test]
    fn event_membership_is_deduplicated() {
        let event = Event::new([3, 1, 3, 2]);
        assert_eq!(event.alert_id_vec(), vec![1, 2, 3]);
        assert!(event.intersects(&[9, 2]));
        assert!(!event.intersects(&[9]));
    }
}
