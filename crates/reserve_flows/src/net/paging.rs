//! Cursor pagination guard: detects no-progress, cycles and runaway page counts.

use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PagingError {
    #[error("pagination stuck: cursor {cursor} returned {repeats} times without progress")]
    Stuck { cursor: String, repeats: u32 },
    #[error("pagination cycle: cursor {0} was already visited")]
    Cycle(String),
    #[error("page ceiling of {0} pages reached")]
    PageCeiling(u32),
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct PagingLimits {
    pub max_pages: u32,
    pub max_no_progress: u32,
    pub max_consecutive_errors: u32,
}

impl Default for PagingLimits {
    fn default() -> Self {
        Self {
            max_pages: 400,
            max_no_progress: 2,
            max_consecutive_errors: 8,
        }
    }
}

/// What the caller should do after [`PageGuard::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// New cursor; fetch the next page.
    Next,
    /// Same cursor as last time; the page made no progress.
    Repeat,
}

#[derive(Debug)]
pub struct PageGuard {
    limits: PagingLimits,
    seen: HashSet<String>,
    last: Option<String>,
    pages: u32,
    no_progress: u32,
}

impl PageGuard {
    pub fn new(limits: PagingLimits) -> Self {
        Self {
            limits,
            seen: HashSet::new(),
            last: None,
            pages: 0,
            no_progress: 0,
        }
    }

    pub fn limits(&self) -> &PagingLimits {
        &self.limits
    }

    pub fn pages(&self) -> u32 {
        self.pages
    }

    pub fn cursor(&self) -> Option<&str> {
        self.last.as_deref()
    }

    /// Count one fetched page against the ceiling.
    pub fn record_page(&mut self) -> Result<(), PagingError> {
        self.pages += 1;
        if self.pages > self.limits.max_pages {
            return Err(PagingError::PageCeiling(self.limits.max_pages));
        }
        Ok(())
    }

    /// Move to `next` as the continuation cursor.
    pub fn advance(&mut self, next: &str) -> Result<Advance, PagingError> {
        if self.last.as_deref() == Some(next) {
            self.no_progress += 1;
            if self.no_progress >= self.limits.max_no_progress {
                return Err(PagingError::Stuck {
                    cursor: next.to_string(),
                    repeats: self.no_progress,
                });
            }
            return Ok(Advance::Repeat);
        }
        if !self.seen.insert(next.to_string()) {
            return Err(PagingError::Cycle(next.to_string()));
        }
        self.no_progress = 0;
        self.last = Some(next.to_string());
        Ok(Advance::Next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_cursor_is_stuck() {
        let mut g = PageGuard::new(PagingLimits::default());
        assert_eq!(g.advance("a").unwrap(), Advance::Next);
        assert_eq!(g.advance("a").unwrap(), Advance::Repeat);
        assert!(matches!(g.advance("a"), Err(PagingError::Stuck { repeats: 2, .. })));
    }

    #[test]
    fn progress_resets_no_progress_counter() {
        let mut g = PageGuard::new(PagingLimits::default());
        g.advance("a").unwrap();
        assert_eq!(g.advance("a").unwrap(), Advance::Repeat);
        assert_eq!(g.advance("b").unwrap(), Advance::Next);
        assert_eq!(g.advance("b").unwrap(), Advance::Repeat);
        assert_eq!(g.cursor(), Some("b"));
    }

    #[test]
    fn revisited_cursor_is_a_cycle() {
        let mut g = PageGuard::new(PagingLimits::default());
        g.advance("a").unwrap();
        g.advance("b").unwrap();
        assert_eq!(g.advance("a"), Err(PagingError::Cycle("a".into())));
    }

    #[test]
    fn ceiling() {
        let mut g = PageGuard::new(PagingLimits {
            max_pages: 2,
            ..Default::default()
        });
        g.record_page().unwrap();
        g.record_page().unwrap();
        assert_eq!(g.record_page(), Err(PagingError::PageCeiling(2)));
        assert_eq!(g.pages(), 3);
    }
}
