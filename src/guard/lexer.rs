//! Flat SQL tokenizer
//!
//! Produces just enough structure for the guard: words, literals, comments,
//! punctuation and statement terminators, each with its byte span and
//! parenthesis depth. It is not a grammar; it only has to know where literals
//! and comments begin and end so that keyword checks and row-cap splicing never
//! look inside them.

use crate::dialect::SqlDialect;

/// Token category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword (also `@var`, `#temp`)
    Word,
    /// Delimited identifier: `"x"`, `[x]`, `` `x` ``
    QuotedIdent,
    /// String literal: `'x'`, `N'x'`, `E'x'`
    StringLit,
    /// Numeric literal
    Number,
    /// Any other single character (`(`, `)`, `,`, `.`, `*`, operators)
    Punct,
    /// Statement terminator `;`
    Semicolon,
    Whitespace,
    LineComment,
    BlockComment,
}

/// A token borrowed from the source text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    /// Byte offset of the first character
    pub start: usize,
    /// Parenthesis depth; a `(` and its matching `)` share the depth of their surroundings
    pub depth: u32,
}

impl<'a> Token<'a> {
    /// Byte offset just past the last character
    #[must_use]
    pub fn end(&self) -> usize {
        self.start + self.text.len()
    }

    /// Whitespace and comments are not significant
    #[must_use]
    pub fn is_significant(&self) -> bool {
        !matches!(self.kind, TokenKind::Whitespace | TokenKind::LineComment | TokenKind::BlockComment)
    }

    /// Case-insensitive keyword test (unquoted words only)
    #[must_use]
    pub fn is_word(&self, keyword: &str) -> bool {
        self.kind == TokenKind::Word && self.text.eq_ignore_ascii_case(keyword)
    }

    #[must_use]
    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct && self.text.starts_with(c)
    }

    /// Identifier text without delimiters (`[dbo]` → `dbo`)
    #[must_use]
    pub fn ident_name(&self) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text.to_string()),
            TokenKind::QuotedIdent => {
                let inner = &self.text[1..self.text.len() - 1];
                Some(match self.text.as_bytes()[0] {
                    b'[' => inner.replace("]]", "]"),
                    b'`' => inner.replace("``", "`"),
                    _ => inner.replace("\"\"", "\""),
                })
            }
            _ => None,
        }
    }
}

/// Tokenizer failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    /// A literal, delimited identifier or block comment never closed
    Unterminated { kind: TokenKind, start: usize },
    /// A `)` without a matching `(`, or `(` left open at the end
    UnbalancedParens,
}

impl std::fmt::Display for LexError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unterminated { kind, start } => write!(f, "unterminated {kind:?} at byte {start}"),
            Self::UnbalancedParens => write!(f, "unbalanced parentheses"),
        }
    }
}

struct Lexer<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: u32,
    dialect: SqlDialect,
    /// Unmatched `)` keeps depth at zero instead of failing
    lenient: bool,
}

/// Tokenize `src` for `dialect`
///
/// The concatenated token texts always reproduce `src` exactly.
pub fn tokenize(src: &str, dialect: SqlDialect) -> Result<Vec<Token<'_>>, LexError> {
    let mut lexer = Lexer { src, bytes: src.as_bytes(), pos: 0, depth: 0, dialect, lenient: false };
    let mut tokens = Vec::new();

    while lexer.pos < lexer.bytes.len() {
        tokens.push(lexer.next_token()?);
    }

    if lexer.depth != 0 {
        return Err(LexError::UnbalancedParens);
    }

    Ok(tokens)
}

/// Tokenize as far as possible
///
/// Stops before the first unterminated literal or comment and tolerates
/// unbalanced parentheses. Model output is often cut short mid-statement.
pub fn tokenize_partial(src: &str, dialect: SqlDialect) -> Vec<Token<'_>> {
    let mut lexer = Lexer { src, bytes: src.as_bytes(), pos: 0, depth: 0, dialect, lenient: true };
    let mut tokens = Vec::new();

    while lexer.pos < lexer.bytes.len() {
        match lexer.next_token() {
            Ok(token) => tokens.push(token),
            Err(_) => break,
        }
    }

    tokens
}

impl<'a> Lexer<'a> {
    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn current_char(&self) -> char {
        self.src[self.pos..].chars().next().unwrap_or('\0')
    }

    fn token(&mut self, kind: TokenKind, start: usize, depth: u32) -> Token<'a> {
        Token { kind, text: &self.src[start..self.pos], start, depth }
    }

    fn next_token(&mut self) -> Result<Token<'a>, LexError> {
        let start = self.pos;
        let depth = self.depth;
        let c = self.current_char();

        match c {
            c if c.is_whitespace() => {
                while self.pos < self.bytes.len() && self.current_char().is_whitespace() {
                    self.pos += self.current_char().len_utf8();
                }
                Ok(self.token(TokenKind::Whitespace, start, depth))
            }
            '-' if self.peek(1) == Some(b'-') => Ok(self.line_comment(start, depth)),
            '#' if self.dialect == SqlDialect::MySql => Ok(self.line_comment(start, depth)),
            '/' if self.peek(1) == Some(b'*') => self.block_comment(start, depth),
            '\'' => {
                let backslash = self.dialect == SqlDialect::MySql;
                self.quoted(b'\'', backslash, TokenKind::StringLit, start, depth)
            }
            'N' | 'n' | 'E' | 'e' | 'X' | 'x' | 'B' | 'b' if self.peek(1) == Some(b'\'') => {
                let backslash = matches!(c, 'E' | 'e') || self.dialect == SqlDialect::MySql;
                self.pos += 1;
                self.quoted(b'\'', backslash, TokenKind::StringLit, start, depth)
            }
            '"' => self.quoted(b'"', false, TokenKind::QuotedIdent, start, depth),
            '[' if matches!(self.dialect, SqlDialect::SqlServer | SqlDialect::Sqlite) => {
                self.quoted(b']', false, TokenKind::QuotedIdent, start, depth)
            }
            '`' if matches!(self.dialect, SqlDialect::MySql | SqlDialect::Sqlite) => {
                self.quoted(b'`', false, TokenKind::QuotedIdent, start, depth)
            }
            ';' => {
                self.pos += 1;
                Ok(self.token(TokenKind::Semicolon, start, depth))
            }
            '(' => {
                self.pos += 1;
                self.depth += 1;
                Ok(self.token(TokenKind::Punct, start, depth))
            }
            ')' => {
                self.pos += 1;
                self.depth = match self.depth.checked_sub(1) {
                    Some(depth) => depth,
                    None if self.lenient => 0,
                    None => return Err(LexError::UnbalancedParens),
                };
                let depth = self.depth;
                Ok(self.token(TokenKind::Punct, start, depth))
            }
            c if c.is_ascii_digit() => {
                while self.pos < self.bytes.len() {
                    let b = self.bytes[self.pos];
                    if b.is_ascii_alphanumeric() || b == b'.' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                Ok(self.token(TokenKind::Number, start, depth))
            }
            c if is_word_start(c) => {
                while self.pos < self.bytes.len() && is_word_continue(self.current_char()) {
                    self.pos += self.current_char().len_utf8();
                }
                Ok(self.token(TokenKind::Word, start, depth))
            }
            c => {
                self.pos += c.len_utf8();
                Ok(self.token(TokenKind::Punct, start, depth))
            }
        }
    }

    fn line_comment(&mut self, start: usize, depth: u32) -> Token<'a> {
        while self.pos < self.bytes.len() && self.bytes[self.pos] != b'\n' {
            self.pos += 1;
        }
        self.token(TokenKind::LineComment, start, depth)
    }

    fn block_comment(&mut self, start: usize, depth: u32) -> Result<Token<'a>, LexError> {
        self.pos += 2;
        let mut nesting = 1u32;
        while nesting > 0 {
            match (self.peek(0), self.peek(1)) {
                (Some(b'/'), Some(b'*')) => {
                    nesting += 1;
                    self.pos += 2;
                }
                (Some(b'*'), Some(b'/')) => {
                    nesting -= 1;
                    self.pos += 2;
                }
                (Some(_), _) => self.pos += 1,
                (None, _) => {
                    return Err(LexError::Unterminated { kind: TokenKind::BlockComment, start })
                }
            }
        }
        Ok(self.token(TokenKind::BlockComment, start, depth))
    }

    /// Consume a delimited run; a doubled closing delimiter is an escape
    fn quoted(
        &mut self,
        close: u8,
        backslash_escapes: bool,
        kind: TokenKind,
        start: usize,
        depth: u32,
    ) -> Result<Token<'a>, LexError> {
        self.pos += 1;
        loop {
            match self.peek(0) {
                None => return Err(LexError::Unterminated { kind, start }),
                Some(b'\\') if backslash_escapes => self.pos += 2,
                Some(b) if b == close => {
                    if self.peek(1) == Some(close) {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        break;
                    }
                }
                Some(_) => self.pos += 1,
            }
        }
        if self.pos > self.bytes.len() {
            return Err(LexError::Unterminated { kind, start });
        }
        Ok(self.token(kind, start, depth))
    }
}

fn is_word_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '@' || c == '#'
}

fn is_word_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '@' || c == '#' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<(TokenKind, &str)> {
        tokenize(src, SqlDialect::SqlServer)
            .unwrap()
            .into_iter()
            .filter(Token::is_significant)
            .map(|t| (t.kind, t.text))
            .collect()
    }

    #[test]
    fn test_partial_tokenize_stops_at_unterminated() {
        let toks = tokenize_partial("SELECT COUNT(*)) FROM t WHERE n = 'abc", SqlDialect::Sqlite);
        let last = toks.iter().filter(|t| t.is_significant()).last().unwrap();
        assert_eq!(last.text, "=");
        assert!(toks.iter().all(|t| t.depth <= 1));
    }

    #[test]
    fn test_round_trip_text() {
        let src = "SELECT [p].[Name], 'it''s' -- note\nFROM /* a /* nested */ b */ t;";
        let joined: String = tokenize(src, SqlDialect::SqlServer).unwrap().iter().map(|t| t.text).collect();
        assert_eq!(joined, src);
    }

    #[test]
    fn test_literals_hide_keywords() {
        let toks = kinds("SELECT 'DROP TABLE x; --' AS [delete]");
        assert_eq!(toks[1], (TokenKind::StringLit, "'DROP TABLE x; --'"));
        assert_eq!(toks[3], (TokenKind::QuotedIdent, "[delete]"));
        assert!(!toks.iter().any(|(k, _)| *k == TokenKind::Semicolon));
    }

    #[test]
    fn test_national_string_prefix() {
        let toks = kinds("SELECT N'منتج'");
        assert_eq!(toks[1], (TokenKind::StringLit, "N'منتج'"));
    }

    #[test]
    fn test_depth_tracking() {
        let toks = tokenize("SELECT (SELECT 1) x", SqlDialect::Postgres).unwrap();
        let inner = toks.iter().filter(|t| t.is_word("SELECT")).map(|t| t.depth).collect::<Vec<_>>();
        assert_eq!(inner, vec![0, 1]);
        let parens = toks.iter().filter(|t| t.kind == TokenKind::Punct).map(|t| t.depth).collect::<Vec<_>>();
        assert_eq!(parens, vec![0, 0]);
    }

    #[test]
    fn test_unterminated_string() {
        let err = tokenize("SELECT 'abc", SqlDialect::Sqlite).unwrap_err();
        assert!(matches!(err, LexError::Unterminated { kind: TokenKind::StringLit, .. }));
    }

    #[test]
    fn test_unbalanced_parens() {
        assert_eq!(tokenize("SELECT (1", SqlDialect::Sqlite).unwrap_err(), LexError::UnbalancedParens);
        assert_eq!(tokenize("SELECT 1)", SqlDialect::Sqlite).unwrap_err(), LexError::UnbalancedParens);
    }

    #[test]
    fn test_mysql_hash_comment_and_backslash() {
        let toks = tokenize("SELECT 'a\\'b' # trailing", SqlDialect::MySql).unwrap();
        assert!(toks.iter().any(|t| t.kind == TokenKind::LineComment));
        assert!(toks.iter().any(|t| t.kind == TokenKind::StringLit && t.text == "'a\\'b'"));
    }

    #[test]
    fn test_ident_name_unquotes() {
        let toks = tokenize("[a]]b] \"c\"\"d\"", SqlDialect::Sqlite).unwrap();
        assert_eq!(toks[0].ident_name().as_deref(), Some("a]b"));
        assert_eq!(toks[2].ident_name().as_deref(), Some("c\"d"));
    }
}
