//! Dialog fragmenter
//!
//! Splits a turn's text into synthesis fragments with natural pauses. The
//! first audio should reach the caller as early as possible, so long
//! opening sentences are cut at the first usable break point and emitted
//! without a trailing pause.

use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use uuid::Uuid;

use voxcall_config::DialogSettings;
use voxcall_core::Fragment;

/// Per-turn speaking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Speaking,
    Listening,
    Processing,
    Interrupted,
}

/// A completed turn kept in the conversation history.
#[derive(Debug, Clone)]
pub struct TurnRecord {
    pub turn_id: String,
    pub text: String,
    pub fragment_count: usize,
    pub started_at: Instant,
    pub duration_ms: f64,
}

const MAX_HISTORY: usize = 100;

/// Words after which a long clause can break.
const CLAUSE_BREAK_WORDS: &[&str] = &[
    "and", "but", "or", "because", "when", "if", "that", "with", "by", "for", "to", "in", "on",
    "at",
];

fn default_punctuation_pauses() -> HashMap<char, u64> {
    HashMap::from([
        (',', 150),
        ('.', 300),
        (';', 200),
        (':', 200),
        ('?', 350),
        ('!', 350),
        ('…', 400),
    ])
}

/// Splits turns into fragments and tracks turn-taking state.
pub struct DialogFragmenter {
    settings: DialogSettings,
    punctuation_pause_ms: HashMap<char, u64>,
    state: Mutex<TurnState>,
    history: Mutex<Vec<TurnRecord>>,
}

impl DialogFragmenter {
    pub fn new(settings: DialogSettings) -> Self {
        Self {
            settings,
            punctuation_pause_ms: default_punctuation_pauses(),
            state: Mutex::new(TurnState::Idle),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Produce the full fragment sequence for one turn.
    ///
    /// Deterministic in (text, urgency, settings): identical inputs yield
    /// identical fragments and pauses, and the concatenated fragment text
    /// equals the input modulo whitespace.
    pub fn fragment_turn(&self, text: &str, urgency: f32, turn_id: Option<String>) -> Vec<Fragment> {
        let turn_id = turn_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let urgency = urgency.clamp(0.0, 1.0);
        let text = text.trim();
        if text.is_empty() {
            return Vec::new();
        }

        // (fragment text, base pause before urgency scaling)
        let mut pieces: Vec<(String, u64)> = Vec::new();

        let mut remaining = text;
        if text.len() > self.settings.initial_fragment_length && urgency < 0.8 {
            if let Some(initial) = self.initial_fragment(text) {
                remaining = text[initial.len()..].trim_start();
                pieces.push((initial, 0));
            }
        }

        let sentences = split_sentences(remaining);
        let sentence_count = sentences.len();
        for (i, sentence) in sentences.into_iter().enumerate() {
            let is_last_sentence = i + 1 == sentence_count;
            let sentence_pause = if is_last_sentence {
                self.settings.end_of_turn_pause_ms
            } else {
                self.settings.inter_sentence_pause_ms
            };

            if sentence.len() > self.settings.max_sentence_length {
                let clauses = split_long_sentence(&sentence, self.settings.max_sentence_length);
                let clause_count = clauses.len();
                for (j, clause) in clauses.into_iter().enumerate() {
                    // Only the sentence-final clause carries the sentence
                    // pause; interior breaks use the punctuation table.
                    let pause = if j + 1 == clause_count {
                        sentence_pause
                    } else {
                        self.clause_pause(&clause)
                    };
                    pieces.push((clause, pause));
                }
            } else {
                pieces.push((sentence, sentence_pause));
            }
        }

        let total = pieces.len();
        pieces
            .into_iter()
            .enumerate()
            .map(|(index, (text, base_pause))| Fragment {
                text,
                pause_after_ms: (base_pause as f64 * (1.0 - urgency as f64)).round() as u64,
                is_first: index == 0,
                is_last: index + 1 == total,
                turn_id: turn_id.clone(),
                index,
            })
            .collect()
    }

    /// Short prefix of a long opening sentence, used to cut first-audio
    /// latency. Returns `None` when the first sentence is already short
    /// enough to be its own fragment.
    fn initial_fragment(&self, text: &str) -> Option<String> {
        let min = self.settings.min_fragment_size;

        // Natural break: first punctuation mark at or past the minimum.
        for (pos, c) in text.char_indices() {
            if matches!(c, '.' | '!' | '?' | ',' | ';' | ':') {
                let end = pos + c.len_utf8();
                let candidate = &text[..end];
                if candidate.len() < min {
                    continue;
                }
                // A full sentence is a normal fragment, not an initial one.
                if matches!(c, '.' | '!' | '?')
                    && text[end..].chars().next().map_or(true, char::is_whitespace)
                {
                    return None;
                }
                return Some(candidate.to_string());
            }
        }

        // No punctuation: word boundary near the target length.
        let target = self
            .settings
            .initial_fragment_length
            .max(30)
            .min(text.len());
        let mut boundary = None;
        for (pos, c) in text.char_indices() {
            if pos > target {
                break;
            }
            if c == ' ' && pos >= min {
                boundary = Some(pos);
            }
        }
        boundary.map(|pos| text[..pos].to_string())
    }

    fn clause_pause(&self, clause: &str) -> u64 {
        clause
            .chars()
            .next_back()
            .and_then(|c| self.punctuation_pause_ms.get(&c).copied())
            .unwrap_or(150)
    }

    // Turn-taking state machine -------------------------------------------

    pub fn begin_turn(&self) {
        *self.state.lock() = TurnState::Speaking;
    }

    /// Record a finished turn and return to idle.
    pub fn complete_turn(
        &self,
        turn_id: &str,
        text: &str,
        fragment_count: usize,
        started_at: Instant,
    ) {
        let mut history = self.history.lock();
        history.push(TurnRecord {
            turn_id: turn_id.to_string(),
            text: text.to_string(),
            fragment_count,
            started_at,
            duration_ms: started_at.elapsed().as_secs_f64() * 1000.0,
        });
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }
        *self.state.lock() = TurnState::Idle;
    }

    /// Interrupt the current turn. Only a speaking turn can be
    /// interrupted; emission stops after the in-flight fragment.
    pub fn interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if *state == TurnState::Speaking {
            *state = TurnState::Interrupted;
            true
        } else {
            false
        }
    }

    pub fn start_listening(&self) {
        *self.state.lock() = TurnState::Listening;
    }

    pub fn start_processing(&self) {
        *self.state.lock() = TurnState::Processing;
    }

    pub fn state(&self) -> TurnState {
        *self.state.lock()
    }

    pub fn is_interrupted(&self) -> bool {
        *self.state.lock() == TurnState::Interrupted
    }

    pub fn history(&self, max_turns: Option<usize>) -> Vec<TurnRecord> {
        let history = self.history.lock();
        match max_turns {
            Some(n) if n < history.len() => history[history.len() - n..].to_vec(),
            _ => history.clone(),
        }
    }
}

/// Rule-based sentence split: a sentence ends at `.`, `!` or `?` followed
/// by whitespace (or end of input). Trailing text without a terminator is
/// its own sentence.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut start = 0;

    for (i, &(pos, c)) in chars.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let next = chars.get(i + 1).map(|&(_, n)| n);
            if next.is_none() || next.is_some_and(char::is_whitespace) {
                let end = pos + c.len_utf8();
                let sentence = text[start..end].trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                start = end;
            }
        }
    }

    let tail = text[start..].trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Break an over-long sentence at punctuation, then at clause words.
fn split_long_sentence(sentence: &str, max_len: usize) -> Vec<String> {
    // First pass: break after `,`, `;`, `:` followed by whitespace.
    let mut pieces = Vec::new();
    let chars: Vec<(usize, char)> = sentence.char_indices().collect();
    let mut start = 0;

    for (i, &(pos, c)) in chars.iter().enumerate() {
        if matches!(c, ',' | ';' | ':') && chars.get(i + 1).is_some_and(|&(_, n)| n.is_whitespace())
        {
            let end = pos + c.len_utf8();
            let piece = sentence[start..end].trim();
            if !piece.is_empty() {
                pieces.push(piece.to_string());
            }
            start = end;
        }
    }
    let tail = sentence[start..].trim();
    if !tail.is_empty() {
        pieces.push(tail.to_string());
    }

    // Second pass: pieces still over the limit break after clause words.
    let mut result = Vec::new();
    for piece in pieces {
        if piece.len() > max_len {
            result.extend(split_at_clause_words(&piece));
        } else {
            result.push(piece);
        }
    }
    result
}

fn split_at_clause_words(piece: &str) -> Vec<String> {
    let mut fragments = Vec::new();
    let mut current = String::new();

    for word in piece.split_whitespace() {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);

        let lowered = word.to_ascii_lowercase();
        if CLAUSE_BREAK_WORDS.contains(&lowered.as_str()) && current.len() >= 20 {
            fragments.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        fragments.push(current);
    }
    fragments
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragmenter() -> DialogFragmenter {
        DialogFragmenter::new(DialogSettings::default())
    }

    // Default settings, urgency 0.
    #[test]
    fn three_sentence_turn_with_default_pauses() {
        let fragments = fragmenter().fragment_turn(
            "Hello there. How are you doing today? I hope so!",
            0.0,
            Some("t1".into()),
        );

        let texts: Vec<&str> = fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["Hello there.", "How are you doing today?", "I hope so!"]
        );

        let pauses: Vec<u64> = fragments.iter().map(|f| f.pause_after_ms).collect();
        assert_eq!(pauses, vec![300, 300, 800]);

        assert!(fragments[0].is_first);
        assert!(fragments[2].is_last);
        assert!(fragments.iter().all(|f| f.turn_id == "t1"));
        assert_eq!(
            fragments.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn deterministic_and_lossless() {
        let text = "The appointment is on Thursday, at half past nine. Please bring your \
                    documents and your glasses. See you then!";
        let a = fragmenter().fragment_turn(text, 0.3, Some("t".into()));
        let b = fragmenter().fragment_turn(text, 0.3, Some("t".into()));

        assert_eq!(a, b);

        let rejoined: String = a
            .iter()
            .map(|f| f.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let normalise = |s: &str| s.split_whitespace().collect::<Vec<_>>().join(" ");
        assert_eq!(normalise(&rejoined), normalise(text));
    }

    #[test]
    fn long_opening_sentence_yields_initial_fragment() {
        let text = "Well, let me take a moment to think about everything you just told me \
                    before answering.";
        let fragments = fragmenter().fragment_turn(text, 0.0, Some("t".into()));

        assert_eq!(fragments[0].text, "Well,");
        assert_eq!(fragments[0].pause_after_ms, 0);
        assert!(fragments[0].is_first);
        assert!(fragments.len() >= 2);
    }

    #[test]
    fn urgency_scales_pauses_down() {
        let text = "First part. Second part.";
        let relaxed = fragmenter().fragment_turn(text, 0.0, Some("t".into()));
        let urgent = fragmenter().fragment_turn(text, 0.5, Some("t".into()));

        assert_eq!(relaxed[0].pause_after_ms, 300);
        assert_eq!(urgent[0].pause_after_ms, 150);
        assert_eq!(relaxed[1].pause_after_ms, 800);
        assert_eq!(urgent[1].pause_after_ms, 400);
    }

    #[test]
    fn high_urgency_skips_initial_fragment() {
        let text = "Well, we really must hurry because the call window is closing now.";
        let fragments = fragmenter().fragment_turn(text, 0.9, Some("t".into()));
        assert_ne!(fragments[0].text, "Well,");
    }

    #[test]
    fn long_sentences_break_at_punctuation() {
        let text = "This opening clause runs on for quite a while without stopping, then \
                    continues with a second clause that is also rather long, and finally \
                    wraps up with a conclusion at the very end of the sentence.";
        let fragments = fragmenter().fragment_turn(text, 0.0, Some("t".into()));

        assert!(fragments.len() > 1);
        // Interior comma breaks use the punctuation table (150 ms).
        let interior: Vec<&Fragment> = fragments.iter().filter(|f| !f.is_last).collect();
        assert!(interior
            .iter()
            .any(|f| f.text.ends_with(',') && f.pause_after_ms == 150));
        // The turn still ends with the end-of-turn pause.
        assert_eq!(fragments.last().unwrap().pause_after_ms, 800);
    }

    #[test]
    fn empty_text_yields_nothing() {
        assert!(fragmenter().fragment_turn("   ", 0.0, None).is_empty());
    }

    #[test]
    fn interrupt_only_while_speaking() {
        let f = fragmenter();
        assert!(!f.interrupt());

        f.begin_turn();
        assert_eq!(f.state(), TurnState::Speaking);
        assert!(f.interrupt());
        assert_eq!(f.state(), TurnState::Interrupted);
        assert!(!f.interrupt());
    }

    #[test]
    fn turn_lifecycle_records_history() {
        let f = fragmenter();
        f.begin_turn();
        f.complete_turn("t1", "Hello.", 1, Instant::now());

        assert_eq!(f.state(), TurnState::Idle);
        let history = f.history(None);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].turn_id, "t1");
        assert_eq!(history[0].fragment_count, 1);
    }

    #[test]
    fn listening_and_processing_states() {
        let f = fragmenter();
        f.start_listening();
        assert_eq!(f.state(), TurnState::Listening);
        f.start_processing();
        assert_eq!(f.state(), TurnState::Processing);
    }
}
