//! Post-processing of transcribed words into readable lines.
//!
//! The STT server emits one word at a time; this module decides where the
//! line breaks go. Three signals insert a break, checked in order: a long
//! silence since the previous word, a sentence boundary (terminal
//! punctuation followed by a capitalized word), and the soft line-width
//! limit. VAD end-of-turn inserts a paragraph break.

use std::time::{Duration, Instant};

/// Soft wrap column for transcript lines.
pub const MAX_LINE_LENGTH: usize = 80;

/// Words ending in a period that do not terminate a sentence.
const ABBREVIATIONS: &[&str] = &[
    "dr.", "mr.", "mrs.", "ms.", "prof.", "sr.", "jr.", "etc.", "vs.", "e.g.", "i.e.", "no.",
    "vol.", "rev.", "est.", "approx.",
];

/// Options for the post-processor.
#[derive(Debug, Clone)]
pub struct Options {
    /// Silence gap after which a line break is inserted.
    pub pause_threshold: Duration,
    /// Soft wrap column.
    pub max_line_length: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            pause_threshold: Duration::from_secs(2),
            max_line_length: MAX_LINE_LENGTH,
        }
    }
}

/// Stateful formatter for the inbound word stream. Owned by the single
/// consumer of server events.
#[derive(Debug)]
pub struct PostProcessor {
    opts: Options,
    last_word_time: Option<Instant>,
    current_line: String,
    last_word: String,
    has_content: bool,
}

impl PostProcessor {
    pub fn new(opts: Options) -> Self {
        Self {
            opts,
            last_word_time: None,
            current_line: String::new(),
            last_word: String::new(),
            has_content: false,
        }
    }

    /// Process a transcribed word and return the text to append to the
    /// transcript, including any line break and spacing.
    pub fn process_word(&mut self, word: &str) -> String {
        self.process_word_at(word, Instant::now())
    }

    /// Like [`process_word`](Self::process_word) with an explicit arrival
    /// time, so silence handling is testable.
    pub fn process_word_at(&mut self, word: &str, now: Instant) -> String {
        let word = word.trim();
        if word.is_empty() {
            return String::new();
        }

        let mut result = String::new();

        let paused_long = self
            .last_word_time
            .is_some_and(|t| now.duration_since(t) > self.opts.pause_threshold);

        if self.has_content && paused_long {
            result.push('\n');
            self.current_line.clear();
        } else if self.has_content
            && ends_sentence(&self.last_word)
            && starts_with_capital(word)
        {
            result.push('\n');
            self.current_line.clear();
        } else if !self.current_line.is_empty()
            && self.current_line.len() + 1 + word.len() > self.opts.max_line_length
        {
            result.push('\n');
            self.current_line.clear();
        }

        if !self.current_line.is_empty() {
            result.push(' ');
            self.current_line.push(' ');
        }

        result.push_str(word);
        self.current_line.push_str(word);

        self.last_word = word.to_string();
        self.last_word_time = Some(now);
        self.has_content = true;

        result
    }

    /// Handle a VAD end-of-turn: a paragraph break if anything has been
    /// written since the last one.
    pub fn process_end_of_turn(&mut self) -> String {
        if !self.has_content {
            return String::new();
        }

        self.current_line.clear();
        self.last_word.clear();
        "\n\n".to_string()
    }

    /// Clear all state.
    pub fn reset(&mut self) {
        self.current_line.clear();
        self.last_word.clear();
        self.last_word_time = None;
        self.has_content = false;
    }

    /// Length of the line currently being built.
    pub fn current_line_length(&self) -> usize {
        self.current_line.len()
    }
}

/// True when the word ends a sentence: terminal punctuation, excluding the
/// known abbreviations.
fn ends_sentence(word: &str) -> bool {
    if word.is_empty() {
        return false;
    }

    let lower = word.to_lowercase();
    if ABBREVIATIONS.contains(&lower.as_str()) {
        return false;
    }

    matches!(word.chars().last(), Some('.' | '!' | '?'))
}

fn starts_with_capital(word: &str) -> bool {
    word.trim()
        .chars()
        .next()
        .is_some_and(|c| c.is_uppercase())
}

#[cfg(test)]
#[path = "processor_test.rs"]
mod tests;
