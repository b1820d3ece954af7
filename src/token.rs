use bitflags::bitflags;

bitflags! {
    /// Lexical traits of one token, used by the atom classifier.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TokenTraits: u8 {
        const CHARACTER = 0x1;
        const QUOTED = 0x2;
        const ALPHA = 0x4;
        const DIGIT = 0x8;
        const DOT = 0x10;
    }
}

#[inline]
fn is_delimiter(byte: u8) -> bool {
    byte.is_ascii_whitespace() || byte == b'(' || byte == b')' || byte == b'\''
}

/// Splits a balanced-expression buffer into tokens: `(`, `)`, `'`, or a
/// maximal run of non-space, non-paren, non-quote characters.
pub struct Scanner<'input> {
    buffer: &'input str,
    offset: usize,
}

impl<'input> Scanner<'input> {
    #[must_use]
    pub fn new(buffer: &'input str) -> Self {
        Self { buffer, offset: 0 }
    }

    /// The next token, or `None` when the buffer is exhausted.
    pub fn next_token(&mut self) -> Option<&'input str> {
        let bytes = self.buffer.as_bytes();
        while self.offset < bytes.len() && bytes[self.offset].is_ascii_whitespace() {
            self.offset += 1;
        }
        if self.offset >= bytes.len() {
            return None;
        }
        let start = self.offset;
        if matches!(bytes[start], b'(' | b')' | b'\'') {
            self.offset += 1;
            return Some(&self.buffer[start..self.offset]);
        }
        while self.offset < bytes.len() && !is_delimiter(bytes[self.offset]) {
            self.offset += 1;
        }
        Some(&self.buffer[start..self.offset])
    }
}

/// Classify a token for the atom parser.
#[must_use]
pub fn classify(token: &str) -> TokenTraits {
    let mut traits = TokenTraits::empty();
    let bytes = token.as_bytes();
    if bytes.is_empty() {
        return traits;
    }
    if bytes.len() >= 2 && bytes[0] == b'#' && bytes[1] == b'\\' {
        return TokenTraits::CHARACTER;
    }
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        return TokenTraits::QUOTED;
    }
    for &byte in bytes {
        if byte.is_ascii_alphabetic() {
            traits |= TokenTraits::ALPHA;
        }
        if byte.is_ascii_digit() {
            traits |= TokenTraits::DIGIT;
        }
        if byte == b'.' {
            traits |= TokenTraits::DOT;
        }
    }
    traits
}

#[test]
fn test_scanner_tokens() {
    let mut sc = Scanner::new("(cons 1 '(2 3))");
    let mut tokens = Vec::new();
    while let Some(t) = sc.next_token() {
        tokens.push(t);
    }
    assert_eq!(tokens, ["(", "cons", "1", "'", "(", "2", "3", ")", ")"]);
}

#[test]
fn test_scanner_whitespace_and_newlines() {
    let mut sc = Scanner::new("  (a\n\tb)  ");
    assert_eq!(sc.next_token(), Some("("));
    assert_eq!(sc.next_token(), Some("a"));
    assert_eq!(sc.next_token(), Some("b"));
    assert_eq!(sc.next_token(), Some(")"));
    assert_eq!(sc.next_token(), None);
    assert_eq!(sc.next_token(), None);
}

#[test]
fn test_scanner_string_token() {
    let mut sc = Scanner::new("(display \"hi\")");
    assert_eq!(sc.next_token(), Some("("));
    assert_eq!(sc.next_token(), Some("display"));
    assert_eq!(sc.next_token(), Some("\"hi\""));
    assert_eq!(sc.next_token(), Some(")"));
}

#[test]
fn test_classify() {
    assert_eq!(classify("#\\a"), TokenTraits::CHARACTER);
    assert_eq!(classify("\"abc\""), TokenTraits::QUOTED);
    assert_eq!(classify("42"), TokenTraits::DIGIT);
    assert_eq!(classify("-42"), TokenTraits::DIGIT);
    assert_eq!(classify("4.2"), TokenTraits::DIGIT | TokenTraits::DOT);
    assert_eq!(classify("x1"), TokenTraits::ALPHA | TokenTraits::DIGIT);
    assert_eq!(classify("."), TokenTraits::DOT);
    assert_eq!(classify("+"), TokenTraits::empty());
}
