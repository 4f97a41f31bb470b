pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    if s.starts_with("```json") {
        s.trim_start_matches("```json")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else if s.starts_with("```") {
        s.trim_start_matches("```")
            .trim_end_matches("```")
            .trim()
            .to_string()
    } else {
        s.to_string()
    }
}

fn is_emoji(c: char) -> bool {
    matches!(c as u32,
        0x1F000..=0x1FAFF | 0x2600..=0x27BF | 0xFE00..=0xFE0F | 0x200D | 0x1F1E6..=0x1F1FF)
}

fn is_trimmable(c: char) -> bool {
    c.is_whitespace() || c.is_ascii_punctuation() || is_cjk_punctuation(c) || is_emoji(c)
}

fn is_cjk_punctuation(c: char) -> bool {
    matches!(c, '。' | '，' | '、' | '；' | '：' | '？' | '！' | '…' | '“' | '”' | '‘' | '’'
        | '「' | '」' | '『' | '』' | '（' | '）' | '《' | '》' | '—' | '～')
}

/// Trims punctuation, whitespace and emoji from both ends of `text`.
pub fn trim_punctuation(text: &str) -> &str {
    text.trim_matches(is_trimmable)
}

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | ';' | '。' | '！' | '？' | '；' | '…')
}

fn is_closing(c: char) -> bool {
    matches!(c, '"' | '\'' | ')' | '”' | '’' | '」' | '』' | '）')
}

/// Splits prose into sentences on sentence-ending punctuation.
///
/// Runs of terminators (`...`, `?!`) and trailing closing quotes stay with the
/// sentence. A lone ASCII `.` only ends a sentence when followed by whitespace
/// or the end of the text, so `3.5` and `e.g` do not split. Each chunk is
/// punctuation-trimmed and empty chunks are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if !is_terminator(c) {
            i += 1;
            continue;
        }

        let mut end = i + 1;
        while end < chars.len() && (is_terminator(chars[end]) || is_closing(chars[end])) {
            end += 1;
        }

        let only_ascii_dot = chars[i..end].iter().all(|&ch| ch == '.' || is_closing(ch))
            && chars[i..end].iter().filter(|&&ch| ch == '.').count() == 1;
        let boundary = !only_ascii_dot || end == chars.len() || chars[end].is_whitespace();

        if boundary {
            push_sentence(&mut sentences, &chars[start..end]);
            start = end;
        }
        i = end;
    }

    if start < chars.len() {
        push_sentence(&mut sentences, &chars[start..]);
    }
    sentences
}

fn push_sentence(out: &mut Vec<String>, chars: &[char]) {
    let raw: String = chars.iter().collect();
    let trimmed = trim_punctuation(&raw);
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}
