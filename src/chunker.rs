//! Position-anchored text chunker.
//!
//! Splits a document's full text into overlapping segments that carry
//! `char_start`/`char_end` offsets into the combined text (title prefix plus
//! body), so a digest citation can point back at the exact source range.
//!
//! Strategy: pack whole paragraphs up to the target size; paragraphs larger
//! than the target are split into sentences; a sentence larger than the
//! target is kept whole. Each new chunk is seeded with the tail of the
//! previous one so context survives the boundary.

/// Target chunk size in characters (~256 tokens at 4 chars/token).
pub const CHUNK_SIZE: usize = 800;
/// Overlap carried into the next chunk (20% of the target).
pub const CHUNK_OVERLAP: usize = 160;
/// Accumulations shorter than this are never emitted as chunks.
pub const MIN_CHUNK_SIZE: usize = 100;

/// A chunk with position data for citations.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub index: i64,
    pub text: String,
    pub char_start: i64,
    pub char_end: i64,
    pub token_count: i64,
}

/// Rough token estimate: ~4 characters per token for English/German text.
pub fn estimate_tokens(text: &str) -> i64 {
    (text.len() / 4) as i64
}

/// Chunk a document with the default parameters.
pub fn chunk_document(fulltext: &str, title: &str) -> Vec<Chunk> {
    chunk_with_params(fulltext, title, CHUNK_SIZE, CHUNK_OVERLAP, MIN_CHUNK_SIZE)
}

/// Chunk a document into overlapping, position-anchored segments.
///
/// Returns an empty vector for blank input. When `title` is non-empty it is
/// prepended as `title\n\n` and all offsets are relative to that combined
/// text.
pub fn chunk_with_params(
    fulltext: &str,
    title: &str,
    chunk_size: usize,
    chunk_overlap: usize,
    min_chunk_size: usize,
) -> Vec<Chunk> {
    let body = fulltext.trim();
    if body.is_empty() {
        return Vec::new();
    }

    let text = if title.is_empty() {
        body.to_string()
    } else {
        format!("{}\n\n{}", title, body)
    };

    let mut chunks: Vec<Chunk> = Vec::new();
    let mut current = String::new();
    let mut current_start = 0usize;

    for (para, para_start) in split_into_paragraphs(&text) {
        // Paragraph fits alongside the accumulator (+2 for the separator).
        if current.len() + para.len() + 2 <= chunk_size {
            if current.is_empty() {
                current_start = para_start;
                current.push_str(para);
            } else {
                current.push_str("\n\n");
                current.push_str(para);
            }
            continue;
        }

        if !current.is_empty() && current.len() >= min_chunk_size {
            push_chunk(&mut chunks, &current, current_start);
            let overlap = tail_chars(&current, chunk_overlap);
            // The overlap tail ends right before the paragraph separator the
            // join re-adds, so the seed start backs off both.
            current_start = para_start.saturating_sub(overlap.len() + 2);
            current = overlap;
        }

        if para.len() > chunk_size {
            for (sent, sent_start) in split_into_sentences(para) {
                let abs_start = para_start + sent_start;
                if current.len() + sent.len() + 1 <= chunk_size {
                    if current.is_empty() {
                        current_start = abs_start;
                        current.push_str(sent);
                    } else {
                        current.push(' ');
                        current.push_str(sent);
                    }
                } else {
                    if !current.is_empty() && current.len() >= min_chunk_size {
                        push_chunk(&mut chunks, &current, current_start);
                    }
                    let overlap = tail_chars(&current, chunk_overlap);
                    if overlap.is_empty() {
                        current_start = abs_start;
                        current = sent.to_string();
                    } else {
                        current_start = abs_start.saturating_sub(overlap.len() + 1);
                        current = format!("{} {}", overlap, sent).trim().to_string();
                    }
                }
            }
        } else {
            if current.is_empty() {
                current_start = para_start;
                current.push_str(para);
            } else {
                current.push_str("\n\n");
                current.push_str(para);
            }
        }
    }

    if !current.is_empty() && current.len() >= min_chunk_size {
        push_chunk(&mut chunks, &current, current_start);
    }

    chunks
}

fn push_chunk(chunks: &mut Vec<Chunk>, text: &str, start: usize) {
    chunks.push(Chunk {
        index: chunks.len() as i64,
        text: text.to_string(),
        char_start: start as i64,
        char_end: (start + text.len()) as i64,
        token_count: estimate_tokens(text),
    });
}

/// Last `n` bytes of `s`, backed off to a char boundary.
fn tail_chars(s: &str, n: usize) -> String {
    if n == 0 || s.is_empty() {
        return String::new();
    }
    if s.len() <= n {
        return s.to_string();
    }
    let mut start = s.len() - n;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].to_string()
}

/// Split text into trimmed paragraphs with their absolute start offsets.
/// Paragraphs are separated by whitespace runs containing two or more
/// newlines.
fn split_into_paragraphs(text: &str) -> Vec<(&str, usize)> {
    let bytes = text.as_bytes();
    let mut parts = Vec::new();
    let mut seg_start = 0usize;
    let mut i = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'\n' {
            let mut j = i + 1;
            let mut newlines = 1usize;
            while j < bytes.len() && bytes[j].is_ascii_whitespace() {
                if bytes[j] == b'\n' {
                    newlines += 1;
                }
                j += 1;
            }
            if newlines >= 2 {
                push_trimmed_segment(text, seg_start, i, &mut parts);
                seg_start = j;
                i = j;
                continue;
            }
            i = j;
            continue;
        }
        i += 1;
    }
    push_trimmed_segment(text, seg_start, text.len(), &mut parts);
    parts
}

fn push_trimmed_segment<'a>(
    text: &'a str,
    start: usize,
    end: usize,
    parts: &mut Vec<(&'a str, usize)>,
) {
    let segment = &text[start..end];
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return;
    }
    let offset = start + (segment.len() - segment.trim_start().len());
    parts.push((trimmed, offset));
}

/// Split a paragraph into sentences with their start offsets relative to the
/// paragraph. A boundary is a `.`/`!`/`?` followed by whitespace and an
/// uppercase letter (English or German); end-of-string closes the last
/// sentence. Within-sentence splitting is never performed.
fn split_into_sentences(text: &str) -> Vec<(&str, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut sentences = Vec::new();
    let mut last_end = 0usize;
    let mut k = 0usize;

    while k < chars.len() {
        let (idx, ch) = chars[k];
        if matches!(ch, '.' | '!' | '?') {
            let mut j = k + 1;
            while j < chars.len() && chars[j].1.is_whitespace() {
                j += 1;
            }
            if j > k + 1 && j < chars.len() && is_sentence_start(chars[j].1) {
                let seg_end = idx + ch.len_utf8();
                push_trimmed_sentence(text, last_end, seg_end, &mut sentences);
                last_end = chars[j].0;
                k = j;
                continue;
            }
        }
        k += 1;
    }

    if last_end < text.len() {
        push_trimmed_sentence(text, last_end, text.len(), &mut sentences);
    }
    sentences
}

fn is_sentence_start(c: char) -> bool {
    c.is_ascii_uppercase() || matches!(c, 'Ä' | 'Ö' | 'Ü')
}

fn push_trimmed_sentence<'a>(
    text: &'a str,
    start: usize,
    end: usize,
    out: &mut Vec<(&'a str, usize)>,
) {
    let segment = &text[start..end];
    let trimmed = segment.trim();
    if trimmed.is_empty() {
        return;
    }
    let offset = start + (segment.len() - segment.trim_start().len());
    out.push((trimmed, offset));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_no_chunks() {
        assert!(chunk_document("", "").is_empty());
        assert!(chunk_document("   \n\n  ", "Title").is_empty());
    }

    #[test]
    fn test_below_minimum_no_chunks() {
        let chunks = chunk_document("Too short.", "");
        assert!(chunks.is_empty());
    }

    #[test]
    fn test_single_paragraph_positions() {
        let text = "A".repeat(150);
        let chunks = chunk_document(&text, "");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end, 150);
        assert_eq!(chunks[0].token_count, 150 / 4);
    }

    #[test]
    fn test_title_prefix_shifts_positions() {
        let body = "B".repeat(150);
        let chunks = chunk_document(&body, "My Title");
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].text.starts_with("My Title\n\n"));
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end as usize, "My Title\n\n".len() + 150);
    }

    #[test]
    fn test_paragraph_packing_and_overlap() {
        let para = "Sentence one goes here with several words in it. ".repeat(6);
        let text = format!("{}\n\n{}\n\n{}", para.trim(), para.trim(), para.trim());
        let chunks = chunk_document(&text, "");
        assert!(chunks.len() >= 2);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
            assert!(c.char_start < c.char_end);
        }
        // Consecutive starts advance by at most chunk_size - overlap plus the
        // paragraph separator slack.
        for pair in chunks.windows(2) {
            assert!(pair[1].char_start > pair[0].char_start);
            assert!(pair[1].char_start <= pair[0].char_end);
        }
    }

    #[test]
    fn test_long_paragraph_splits_by_sentences() {
        let text = "Words make sentences here and the text keeps going onward. "
            .repeat(34)
            .trim()
            .to_string();
        assert!(text.len() > 1900);
        let chunks = chunk_document(&text, "");
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!((c.char_end - c.char_start) as usize <= CHUNK_SIZE);
        }
        for pair in chunks.windows(2) {
            let step = (pair[1].char_start - pair[0].char_start) as usize;
            assert!(step <= CHUNK_SIZE);
        }
    }

    #[test]
    fn test_oversized_sentence_kept_whole() {
        let text = "word ".repeat(400).trim().to_string();
        let chunks = chunk_document(&text, "");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text.len(), text.len());
    }

    #[test]
    fn test_deterministic() {
        let text = "First thought here. Second thought follows. ".repeat(40);
        let a = chunk_document(&text, "Notes");
        let b = chunk_document(&text, "Notes");
        assert_eq!(a, b);
    }

    #[test]
    fn test_indices_dense_from_zero() {
        let text = "A paragraph with enough words to be kept around after splits. "
            .repeat(30);
        let chunks = chunk_document(&text, "");
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.index, i as i64);
        }
    }

    #[test]
    fn test_char_end_bounded_by_combined_text() {
        let body = "Sentences accumulate into paragraphs over time. ".repeat(50);
        let title = "Bounded";
        let combined_len = title.len() + 2 + body.trim().len();
        let chunks = chunk_document(&body, title);
        let last = chunks.last().unwrap();
        assert!(last.char_end as usize <= combined_len);
    }

    #[test]
    fn test_sentence_split_positions() {
        let sents = split_into_sentences("One is first. Two is second! Drei kommt. Ähnlich endet es.");
        assert_eq!(sents.len(), 4);
        assert_eq!(sents[0].0, "One is first.");
        assert_eq!(sents[1].0, "Two is second!");
        assert_eq!(sents[3].1, "One is first. Two is second! Drei kommt. ".len());
    }

    #[test]
    fn test_paragraph_split_positions() {
        let parts = split_into_paragraphs("alpha\n\nbeta\n   \n\ngamma");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], ("alpha", 0));
        assert_eq!(parts[1], ("beta", 7));
        assert_eq!(parts[2].0, "gamma");
    }
}
