//! The replicated log
//!
//! The log is the source of truth for all commands that have been proposed.
//! It always begins with a sentinel entry at index 0 carrying term 0, so the
//! consistency check for the first real entry has something to match against.
//! The log is owned by the peer state and only touched under the peer lock.

use crate::types::{Entry, LogIndex, Term};
use crate::{RaftError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftLog {
    entries: Vec<Entry>,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: vec![Entry::new(Term(0), LogIndex::ZERO, vec![])],
        }
    }

    /// Rebuilds a log from persisted entries, checking that every entry sits
    /// at the index it claims.
    pub fn from_entries(entries: Vec<Entry>) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::new());
        }
        for (position, entry) in entries.iter().enumerate() {
            if entry.index != LogIndex(position as u64) {
                return Err(RaftError::LogIndexOutOfRange(entry.index));
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Index of the last entry (the sentinel when no command was appended)
    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64 - 1)
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or_default()
    }

    pub fn get(&self, index: LogIndex) -> Option<&Entry> {
        self.entries.get(index.as_usize())
    }

    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        self.get(index).map(|e| e.term)
    }

    /// Appends a new command at the end of the log and returns its index.
    pub fn append_command(&mut self, term: Term, command: Vec<u8>) -> LogIndex {
        let index = self.last_index() + 1;
        self.entries.push(Entry::new(term, index, command));
        index
    }

    /// Up to `max` entries starting at `start`.
    pub fn entries_from(&self, start: LogIndex, max: usize) -> Vec<Entry> {
        let start = start.as_usize().max(1);
        if start >= self.entries.len() {
            return vec![];
        }
        let end = (start + max).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// Entries in `[start, end]`, clamped to the log.
    pub fn range_inclusive(&self, start: LogIndex, end: LogIndex) -> Vec<Entry> {
        let start = start.as_usize().max(1);
        let end = end.as_usize().min(self.entries.len().saturating_sub(1));
        if start > end {
            return vec![];
        }
        self.entries[start..=end].to_vec()
    }

    /// Whether our log contains an entry at `index` whose term is `term`.
    pub fn matches(&self, index: LogIndex, term: Term) -> bool {
        self.term_at(index) == Some(term)
    }

    /// Installs a leader's entries that follow `prev`.
    ///
    /// Entries already present with the same term are kept. At the first
    /// position whose term differs, or past the end of the log, the log is
    /// truncated there and extended with the remaining entries. Returns true
    /// if the log changed. The caller must have checked that `prev` matches.
    pub fn merge(&mut self, prev: LogIndex, entries: &[Entry]) -> bool {
        debug_assert!(prev <= self.last_index());

        for (offset, entry) in entries.iter().enumerate() {
            let index = prev + 1 + offset as u64;
            match self.term_at(index) {
                Some(term) if term == entry.term => continue,
                Some(_) => self.entries.truncate(index.as_usize()),
                None => {}
            }

            self.entries.extend(
                entries[offset..]
                    .iter()
                    .enumerate()
                    .map(|(i, e)| Entry::new(e.term, index + i as u64, e.command.clone())),
            );
            return true;
        }
        false
    }

    /// Whether a candidate whose log ends at (`last_index`, `last_term`) is
    /// at least as up-to-date as this log.
    pub fn is_up_to_date(&self, last_index: LogIndex, last_term: Term) -> bool {
        let our_term = self.last_term();
        last_term > our_term || (last_term == our_term && last_index >= self.last_index())
    }
}

impl Default for RaftLog {
    fn default() -> Self {
        Self::new()
    }
}
