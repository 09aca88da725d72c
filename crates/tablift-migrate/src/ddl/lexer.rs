//! DDL tokenizer
//!
//! Produces tokens with byte spans into the source text. Lexing never fails:
//! an unterminated quote or comment simply runs to the end of the input.

/// Token classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Bare word: keyword or unquoted identifier
    Word,
    /// `"…"`, `` `…` `` or `[…]`
    QuotedIdent,
    /// `'…'` or a dollar-quoted `$tag$…$tag$` body
    StringLit,
    Number,
    LParen,
    RParen,
    Comma,
    Semicolon,
    Dot,
    Whitespace,
    /// `-- …` or `/* … */`
    Comment,
    /// Any other single character
    Other,
}

/// A token and its byte span in the source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    /// The token's source text
    pub fn text<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }

    /// Whitespace and comments
    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }

    /// Whether this is the bare word `keyword`, compared case-insensitively
    pub fn is_keyword(&self, src: &str, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text(src).eq_ignore_ascii_case(keyword)
    }
}

/// Split `src` into tokens, trivia included.
pub fn tokenize(src: &str) -> Vec<Token> {
    let bytes = src.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let start = pos;
        let c = bytes[pos];
        let next = bytes.get(pos + 1).copied();

        let kind = match c {
            b'-' if next == Some(b'-') => {
                pos = find_byte(bytes, pos + 2, b'\n').unwrap_or(bytes.len());
                TokenKind::Comment
            }
            b'/' if next == Some(b'*') => {
                pos = src[pos + 2..]
                    .find("*/")
                    .map_or(bytes.len(), |offset| pos + 2 + offset + 2);
                TokenKind::Comment
            }
            b'\'' => {
                pos = quoted_end(bytes, pos, b'\'');
                TokenKind::StringLit
            }
            b'"' => {
                pos = quoted_end(bytes, pos, b'"');
                TokenKind::QuotedIdent
            }
            b'`' => {
                pos = quoted_end(bytes, pos, b'`');
                TokenKind::QuotedIdent
            }
            b'[' => {
                pos = find_byte(bytes, pos + 1, b']').map_or(bytes.len(), |end| end + 1);
                TokenKind::QuotedIdent
            }
            b'$' if dollar_delimiter(src, pos).is_some() => {
                pos = dollar_quoted_end(src, pos);
                TokenKind::StringLit
            }
            b'(' => {
                pos += 1;
                TokenKind::LParen
            }
            b')' => {
                pos += 1;
                TokenKind::RParen
            }
            b',' => {
                pos += 1;
                TokenKind::Comma
            }
            b';' => {
                pos += 1;
                TokenKind::Semicolon
            }
            b'.' if !next.is_some_and(|n| n.is_ascii_digit()) => {
                pos += 1;
                TokenKind::Dot
            }
            c if c.is_ascii_whitespace() => {
                while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
                    pos += 1;
                }
                TokenKind::Whitespace
            }
            c if c.is_ascii_digit() || c == b'.' => {
                pos += 1;
                while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'.')
                {
                    pos += 1;
                }
                TokenKind::Number
            }
            _ => {
                let ch = src[pos..].chars().next().unwrap_or_default();
                if ch.is_alphabetic() || ch == '_' {
                    pos = word_end(src, pos);
                    TokenKind::Word
                } else {
                    pos += ch.len_utf8().max(1);
                    TokenKind::Other
                }
            }
        };

        tokens.push(Token {
            kind,
            start,
            end: pos,
        });
    }

    tokens
}

/// Tokens that carry meaning: everything except whitespace and comments.
pub fn significant_tokens(src: &str) -> Vec<Token> {
    tokenize(src).into_iter().filter(|t| !t.is_trivia()).collect()
}

fn find_byte(bytes: &[u8], from: usize, needle: u8) -> Option<usize> {
    bytes[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|offset| from + offset)
}

/// End of a quoted run starting at `start`, where a doubled quote escapes itself.
fn quoted_end(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut pos = start + 1;
    while pos < bytes.len() {
        if bytes[pos] == quote {
            if bytes.get(pos + 1) == Some(&quote) {
                pos += 2;
                continue;
            }
            return pos + 1;
        }
        pos += 1;
    }
    bytes.len()
}

/// The `$tag$` opening a dollar-quoted string at `start`. Tags follow
/// identifier rules, so `$1` placeholders are not delimiters.
fn dollar_delimiter(src: &str, start: usize) -> Option<&str> {
    let rest = &src[start + 1..];
    let close = rest.find('$')?;
    let tag = &rest[..close];
    let valid = tag.chars().enumerate().all(|(i, ch)| {
        ch == '_' || ch.is_alphabetic() || (i > 0 && ch.is_ascii_digit())
    });
    valid.then(|| &src[start..start + close + 2])
}

fn dollar_quoted_end(src: &str, start: usize) -> usize {
    let Some(delimiter) = dollar_delimiter(src, start) else {
        return start + 1;
    };
    let body = start + delimiter.len();
    src[body..]
        .find(delimiter)
        .map_or(src.len(), |offset| body + offset + delimiter.len())
}

fn word_end(src: &str, start: usize) -> usize {
    src[start..]
        .char_indices()
        .find(|&(_, ch)| !(ch.is_alphanumeric() || ch == '_' || ch == '$'))
        .map_or(src.len(), |(offset, _)| start + offset)
}

/// Cursor over significant tokens
pub(crate) struct TokenCursor<'a> {
    src: &'a str,
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> TokenCursor<'a> {
    pub(crate) fn new(src: &'a str, tokens: &'a [Token]) -> Self {
        Self {
            src,
            tokens,
            pos: 0,
        }
    }

    pub(crate) fn src(&self) -> &'a str {
        self.src
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn is_at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    pub(crate) fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    pub(crate) fn peek_nth(&self, n: usize) -> Option<&'a Token> {
        self.tokens.get(self.pos + n)
    }

    pub(crate) fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        Some(token)
    }

    pub(crate) fn peek_keyword(&self, keyword: &str) -> bool {
        self.peek().is_some_and(|t| t.is_keyword(self.src, keyword))
    }

    pub(crate) fn peek_nth_keyword(&self, n: usize, keyword: &str) -> bool {
        self.peek_nth(n)
            .is_some_and(|t| t.is_keyword(self.src, keyword))
    }

    pub(crate) fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Consume a sequence of keywords, or nothing if any of them is missing.
    pub(crate) fn eat_keywords(&mut self, keywords: &[&str]) -> bool {
        let matches = keywords
            .iter()
            .enumerate()
            .all(|(i, kw)| self.peek_nth_keyword(i, kw));
        if matches {
            self.pos += keywords.len();
        }
        matches
    }

    pub(crate) fn eat_kind(&mut self, kind: TokenKind) -> bool {
        if self.peek().is_some_and(|t| t.kind == kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn kinds_and_text(src: &str) -> Vec<(TokenKind, &str)> {
        tokenize(src)
            .into_iter()
            .map(|t| (t.kind, t.text(src)))
            .collect()
    }

    #[test]
    fn test_basic_statement() {
        assert_eq!(
            kinds_and_text("CREATE TABLE t (id INT);"),
            vec![
                (TokenKind::Word, "CREATE"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Word, "TABLE"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Word, "t"),
                (TokenKind::Whitespace, " "),
                (TokenKind::LParen, "("),
                (TokenKind::Word, "id"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Word, "INT"),
                (TokenKind::RParen, ")"),
                (TokenKind::Semicolon, ";"),
            ]
        );
    }

    #[test]
    fn test_quotes_and_escapes() {
        let src = r#""a ""b""" 'it''s;' `c` [d e]"#;
        let significant: Vec<(TokenKind, &str)> = significant_tokens(src)
            .into_iter()
            .map(|t| (t.kind, t.text(src)))
            .collect();
        assert_eq!(
            significant,
            vec![
                (TokenKind::QuotedIdent, r#""a ""b""""#),
                (TokenKind::StringLit, "'it''s;'"),
                (TokenKind::QuotedIdent, "`c`"),
                (TokenKind::QuotedIdent, "[d e]"),
            ]
        );
    }

    #[test]
    fn test_comments() {
        let src = "a -- x; y\nb /* ; */ c";
        let significant: Vec<&str> = significant_tokens(src)
            .into_iter()
            .map(|t| t.text(src))
            .collect();
        assert_eq!(significant, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_unterminated_runs_to_end() {
        let src = "x 'never closed; y";
        let tokens = tokenize(src);
        let last = tokens.last().unwrap();
        assert_eq!(last.kind, TokenKind::StringLit);
        assert_eq!(last.end, src.len());

        let tokens = tokenize("a /* open");
        assert_eq!(tokens.last().unwrap().kind, TokenKind::Comment);
    }

    #[test]
    fn test_numbers_and_dots() {
        assert_eq!(
            kinds_and_text("s.t 10.5 .5"),
            vec![
                (TokenKind::Word, "s"),
                (TokenKind::Dot, "."),
                (TokenKind::Word, "t"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Number, "10.5"),
                (TokenKind::Whitespace, " "),
                (TokenKind::Number, ".5"),
            ]
        );
    }

    #[test]
    fn test_non_ascii_words() {
        let src = "prénom TEXT, ±";
        let significant: Vec<(TokenKind, &str)> = significant_tokens(src)
            .into_iter()
            .map(|t| (t.kind, t.text(src)))
            .collect();
        assert_eq!(
            significant,
            vec![
                (TokenKind::Word, "prénom"),
                (TokenKind::Word, "TEXT"),
                (TokenKind::Comma, ","),
                (TokenKind::Other, "±"),
            ]
        );
    }

    #[test]
    fn test_cursor_keywords() {
        let src = "if not exists foo";
        let tokens = significant_tokens(src);
        let mut cursor = TokenCursor::new(src, &tokens);
        assert!(!cursor.eat_keywords(&["IF", "EXISTS"]));
        assert_eq!(cursor.position(), 0);
        assert!(cursor.eat_keywords(&["IF", "NOT", "EXISTS"]));
        assert!(cursor.peek_keyword("FOO"));
        cursor.advance();
        assert!(cursor.is_at_end());
    }
}
