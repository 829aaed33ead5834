use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;

/// An ordered list of compiled host patterns loaded at startup and read-only
/// afterwards. Matching is unanchored: a pattern hits if it matches anywhere
/// in the hostname.
#[derive(Debug)]
pub struct BlockList {
    patterns: Vec<Regex>,
}

impl BlockList {
    /// Reads one pattern per non-blank line. There is no comment syntax: a
    /// leading `#` is part of the pattern. Any compile failure fails the load.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read blocklist {}", path.display()))?;
        Self::from_patterns(contents.lines())
            .with_context(|| format!("failed to compile blocklist {}", path.display()))
    }

    pub fn from_patterns<'a, I>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut patterns = Vec::new();
        for line in lines {
            if line.trim().is_empty() {
                continue;
            }
            let pattern = Regex::new(line)
                .with_context(|| format!("invalid blocklist pattern '{line}'"))?;
            patterns.push(pattern);
        }
        Ok(Self { patterns })
    }

    /// First-hit scan in input order.
    pub fn is_blocked(&self, host: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(host))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
