use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Who produced a turn. `Agent` is the character itself; `Player` carries the
/// in-world name of whoever spoke.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    System,
    Agent,
    Player(String),
}

impl Speaker {
    pub fn is_self_or_system(&self) -> bool {
        matches!(self, Speaker::System | Speaker::Agent)
    }
}

impl std::fmt::Display for Speaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Speaker::System => write!(f, "system"),
            Speaker::Agent => write!(f, "self"),
            Speaker::Player(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Turn {
    pub speaker: Speaker,
    pub content: String,
    #[serde(default)]
    pub ts_ms: u64,
}

impl Turn {
    pub fn new(speaker: Speaker, content: impl Into<String>) -> Self {
        Self {
            speaker,
            content: content.into(),
            ts_ms: now_ms(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Speaker::System, content)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Ordered, length-bounded conversation log. Oldest turns are evicted first
/// once the configured bound is reached.
#[derive(Debug, Clone)]
pub struct History {
    turns: VecDeque<Turn>,
    limit: usize,
}

impl History {
    pub fn new(limit: usize) -> Self {
        Self {
            turns: VecDeque::new(),
            limit: limit.max(1),
        }
    }

    pub fn append(&mut self, speaker: Speaker, content: impl Into<String>) {
        self.turns.push_back(Turn::new(speaker, content));
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    pub fn restore(&mut self, turns: Vec<Turn>) {
        self.turns = turns.into();
        while self.turns.len() > self.limit {
            self.turns.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn turns(&self) -> Vec<Turn> {
        self.turns.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_preserves_order() {
        let mut h = History::new(10);
        h.append(Speaker::Player("steve".into()), "hi");
        h.append(Speaker::Agent, "hello");
        let turns = h.turns();
        assert_eq!(turns[0].content, "hi");
        assert_eq!(turns[1].content, "hello");
        assert_eq!(turns[1].speaker, Speaker::Agent);
    }

    #[test]
    fn overflow_evicts_oldest_first() {
        let mut h = History::new(3);
        for i in 0..5 {
            h.append(Speaker::System, format!("turn {i}"));
        }
        let turns = h.turns();
        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "turn 2");
        assert_eq!(turns[2].content, "turn 4");
    }

    #[test]
    fn restore_applies_bound() {
        let mut h = History::new(2);
        h.restore(vec![
            Turn::system("a"),
            Turn::system("b"),
            Turn::system("c"),
        ]);
        let turns = h.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].content, "b");
    }
}
