//! Splits streamed model output into speakable sentences

/// Characters that end a sentence when followed by whitespace
const SENTENCE_ENDINGS: &[char] = &['.', '!', '?', ';', '。', '！', '？', '；'];

/// Accumulates text fragments and releases complete sentences
#[derive(Debug, Default, Clone)]
pub struct SentenceAggregator {
    buffer: String,
}

impl SentenceAggregator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fragment, returning every sentence it completed
    pub fn push(&mut self, text: &str) -> Vec<String> {
        self.buffer.push_str(text);

        let mut sentences = Vec::new();
        while let Some(end) = find_sentence_end(&self.buffer) {
            let rest = self.buffer.split_off(end);
            let sentence = std::mem::replace(&mut self.buffer, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Take whatever is left, if it contains anything speakable
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.trim().is_empty()
    }
}

/// Byte offset just past the first sentence ending followed by whitespace
///
/// Full-width endings split immediately. ASCII endings need the whitespace,
/// so "3.14" never splits and a trailing "." waits for the next fragment.
fn find_sentence_end(text: &str) -> Option<usize> {
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        if !SENTENCE_ENDINGS.contains(&c) {
            continue;
        }
        let end = idx + c.len_utf8();
        if !c.is_ascii() {
            return Some(end);
        }
        if chars.peek().is_some_and(|&(_, next)| next.is_whitespace()) {
            return Some(end);
        }
    }

    None
}
