use crate::consts::ASCII_CLAUSE_ENDINGS;

/// Accumulates streamed tokens and releases text at sentence boundaries.
///
/// A boundary is terminal punctuation followed by whitespace, so `3.5` never splits and a
/// trailing `.` waits for the next token (or [`SentenceBuffer::finish`]) before it counts.
#[derive(Debug, Default)]
pub struct SentenceBuffer {
    buf: String,
}

impl SentenceBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a token; returns every sentence it completed.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buf.push_str(token);
        let mut sentences = vec![];
        loop {
            let Some(end) = self.boundary() else { break };
            let rest = self.buf.split_off(end);
            let sentence = std::mem::replace(&mut self.buf, rest);
            let sentence = sentence.trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_string());
            }
        }
        sentences
    }

    /// Flush whatever remains at end of stream.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let rest = rest.trim();
        (!rest.is_empty()).then(|| rest.to_string())
    }

    pub fn is_empty(&self) -> bool {
        self.buf.trim().is_empty()
    }

    /// Byte offset just past the first boundary punctuation.
    fn boundary(&self) -> Option<usize> {
        let mut chars = self.buf.char_indices().peekable();
        while let Some((idx, c)) = chars.next() {
            if ASCII_CLAUSE_ENDINGS.contains(&c) {
                if let Some((_, next)) = chars.peek() {
                    if next.is_whitespace() {
                        return Some(idx + c.len_utf8());
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(tokens: &[&str]) -> (Vec<String>, Option<String>) {
        let mut b = SentenceBuffer::new();
        let mut out = vec![];
        for t in tokens {
            out.extend(b.push(t));
        }
        (out, b.finish())
    }

    #[test]
    fn emits_as_soon_as_boundary_is_seen() {
        let mut b = SentenceBuffer::new();
        assert!(b.push("I can").is_empty());
        assert!(b.push(" help with that.").is_empty());
        assert_eq!(b.push(" What"), vec!["I can help with that.".to_string()]);
        assert_eq!(b.finish(), Some("What".to_string()));
    }

    #[test]
    fn decimals_do_not_split() {
        let (out, rest) = feed(&["The total is 3", ".", "5 dollars. Anything", " else?"]);
        assert_eq!(out, vec!["The total is 3.5 dollars.".to_string()]);
        assert_eq!(rest, Some("Anything else?".to_string()));
    }

    #[test]
    fn several_sentences_in_one_token() {
        let (out, rest) = feed(&["Yes! Sure; right away. "]);
        assert_eq!(out, vec!["Yes!", "Sure;", "right away."]);
        assert_eq!(rest, None);
    }
}
