use std::fmt;

use crate::error::{HarnessError, Result};

/// Ordered build output, one entry per line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    #[must_use]
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    pub(crate) fn push(&mut self, line: String) {
        self.lines.push(line);
    }

    #[must_use]
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Index of the first line containing `needle`.
    #[must_use]
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.lines.iter().position(|line| line.contains(needle))
    }

    #[must_use]
    pub fn contains_line(&self, needle: &str) -> bool {
        self.position(needle).is_some()
    }

    /// Checks every needle appears on some line, each strictly after the previous one.
    ///
    /// # Errors
    /// Returns [`HarnessError::Assertion`] naming the first needle that is missing or
    /// out of order.
    pub fn expect_in_order<S: AsRef<str>>(&self, needles: &[S]) -> Result<()> {
        let mut start = 0usize;
        let mut previous: Option<&str> = None;
        for needle in needles {
            let needle = needle.as_ref();
            let found = self.lines[start..]
                .iter()
                .position(|line| line.contains(needle))
                .map(|offset| start + offset);
            match (found, previous) {
                (Some(index), _) => {
                    start = index + 1;
                    previous = Some(needle);
                }
                (None, Some(before)) if self.contains_line(needle) => {
                    return Err(HarnessError::assertion(format!(
                        "expected '{needle}' after '{before}' in build transcript\n{self}"
                    )));
                }
                (None, _) => {
                    return Err(HarnessError::assertion(format!(
                        "expected build transcript to contain '{needle}'\n{self}"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Checks none of the needles appear on any line.
    ///
    /// # Errors
    /// Returns [`HarnessError::Assertion`] naming the first needle that is present.
    pub fn expect_absent<S: AsRef<str>>(&self, needles: &[S]) -> Result<()> {
        for needle in needles {
            let needle = needle.as_ref();
            if let Some(index) = self.position(needle) {
                return Err(HarnessError::assertion(format!(
                    "expected build transcript not to contain '{needle}', found on line {}: {}",
                    index + 1,
                    self.lines[index]
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for Transcript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}
