use base64::{engine, read, Engine};
use std::io::{Cursor, Read};

pub fn b64_decode_to_buf(enc: String, buf: &mut Vec<u8>) -> std::io::Result<usize> {
    let mut cur = Cursor::new(enc);
    let mut decoder = read::DecoderReader::new(&mut cur, &engine::general_purpose::STANDARD);
    decoder.read_to_end(buf)
}

pub fn b64_encode(bytes: &[u8]) -> String {
    engine::general_purpose::STANDARD.encode(bytes)
}

pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// The first `n` whitespace-separated words of `text`, single-space joined.
pub fn word_prefix(text: &str, n: usize) -> String {
    text.split_whitespace()
        .take(n)
        .collect::<Vec<&str>>()
        .join(" ")
}

/// Rough token estimate: one token per four characters, never zero for non-empty text.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    if chars == 0 {
        0
    } else {
        (chars / 4).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_prefix_takes_whole_words() {
        let text = "Your order will arrive on Tuesday.";
        assert_eq!(word_prefix(text, 5), "Your order will arrive on");
        assert_eq!(word_prefix(text, 0), "");
        assert_eq!(word_prefix(text, 50), text);
    }

    #[test]
    fn b64_round_trip() {
        let mut buf = vec![];
        b64_decode_to_buf(b64_encode(&[0xff, 0x7f, 0x00]), &mut buf).unwrap();
        assert_eq!(buf, vec![0xff, 0x7f, 0x00]);
    }
}
