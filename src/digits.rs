use std::time::{Duration, Instant};

/// Jump-to-position by typing its 1-based number.
///
/// Digits accumulate; whenever the number would point past the end of the
/// catalog the oldest digit is dropped, so a non-empty buffer is always a
/// valid position. After `commit_delay` without input the position is
/// handed out once, after `clear_delay` the buffer is emptied.
#[derive(Debug)]
pub struct IndexBuffer {
    digits: String,
    commit_at: Option<Instant>,
    clear_at: Option<Instant>,
    commit_delay: Duration,
    clear_delay: Duration,
}

impl IndexBuffer {
    pub fn new(commit_delay: Duration, clear_delay: Duration) -> Self {
        Self {
            digits: String::new(),
            commit_at: None,
            clear_at: None,
            commit_delay,
            clear_delay,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.digits
    }

    pub fn is_empty(&self) -> bool {
        self.digits.is_empty()
    }

    fn value(&self) -> Option<usize> {
        // Bounded by the catalog length, so this cannot overflow.
        self.digits.parse().ok()
    }

    /// Returns false if `digit` is not an ASCII digit or the catalog is empty.
    pub fn push_digit(&mut self, digit: char, count: usize, now: Instant) -> bool {
        if count == 0 || !digit.is_ascii_digit() {
            return false;
        }
        self.digits.push(digit);
        loop {
            let trimmed = self.digits.trim_start_matches('0').len();
            if trimmed < self.digits.len() {
                self.digits.drain(..self.digits.len() - trimmed);
            }
            match self.value() {
                Some(n) if n > count => {
                    self.digits.remove(0);
                }
                _ => break,
            }
        }
        if self.digits.is_empty() {
            self.commit_at = None;
            self.clear_at = None;
        } else {
            self.commit_at = Some(now + self.commit_delay);
            self.clear_at = Some(now + self.clear_delay);
        }
        true
    }

    /// Zero-based index to jump to, once per burst of typing.
    pub fn poll(&mut self, now: Instant) -> Option<usize> {
        let mut commit = None;
        if self.commit_at.is_some_and(|at| now >= at) {
            self.commit_at = None;
            commit = self.value().and_then(|n| n.checked_sub(1));
        }
        if self.clear_at.is_some_and(|at| now >= at) {
            self.clear();
        }
        commit
    }

    pub fn clear(&mut self) {
        self.digits.clear();
        self.commit_at = None;
        self.clear_at = None;
    }
}
