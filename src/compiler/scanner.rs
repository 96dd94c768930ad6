use radix_trie::Trie;
use thiserror::Error;

use super::token::{Token, TokenKind};
use super::util::StrCursor;

#[derive(Debug, Clone, Error)]
pub enum ScannerError {
    #[error("Unterminated string.")]
    UnterminatedString { line: u64 },

    #[error("Unexpected character.")]
    UnexpectedCharacter { line: u64 },
}

impl ScannerError {
    pub fn line(&self) -> u64 {
        match self {
            ScannerError::UnterminatedString { line } => *line,
            ScannerError::UnexpectedCharacter { line } => *line,
        }
    }
}

const KEYWORDS: [(&str, TokenKind); 16] = [
    ("and", TokenKind::And),
    ("class", TokenKind::Class),
    ("else", TokenKind::Else),
    ("false", TokenKind::False),
    ("for", TokenKind::For),
    ("fun", TokenKind::Fun),
    ("if", TokenKind::If),
    ("nil", TokenKind::Nil),
    ("or", TokenKind::Or),
    ("print", TokenKind::Print),
    ("return", TokenKind::Return),
    ("super", TokenKind::Super),
    ("this", TokenKind::This),
    ("true", TokenKind::True),
    ("var", TokenKind::Var),
    ("while", TokenKind::While),
];

/// Hand-written lexer. Produces tokens on demand by slicing the source;
/// the only state is the cursor and the current line.
pub struct Scanner<'a> {
    source: &'a str,
    cursor: StrCursor<'a>,
    start: usize,
    keywords: Trie<&'static str, TokenKind>,
    line: u64,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &'a str) -> Self {
        let mut keywords = Trie::new();
        for (keyword, kind) in KEYWORDS.iter() {
            keywords.insert(*keyword, *kind);
        }

        Self {
            source,
            cursor: StrCursor::new(source),
            start: 0,
            keywords,
            line: 1,
        }
    }

    pub fn scan_token(&mut self) -> Result<Token, ScannerError> {
        self.skip_whitespace();
        self.start = self.cursor.index;

        if let Some(ch) = self.cursor.advance() {
            let token = match ch {
                '(' => self.create_token(TokenKind::ParenLeft),
                ')' => self.create_token(TokenKind::ParenRight),
                '{' => self.create_token(TokenKind::BraceLeft),
                '}' => self.create_token(TokenKind::BraceRight),
                ';' => self.create_token(TokenKind::Semicolon),
                ',' => self.create_token(TokenKind::Comma),
                '.' => self.create_token(TokenKind::Dot),
                '-' => self.create_token(TokenKind::Minus),
                '+' => self.create_token(TokenKind::Plus),
                '/' => self.create_token(TokenKind::Slash),
                '*' => self.create_token(TokenKind::Star),
                '!' => self.create_token_match('=', TokenKind::BangEqual, TokenKind::Bang),
                '=' => self.create_token_match('=', TokenKind::EqualEqual, TokenKind::Equal),
                '<' => self.create_token_match('=', TokenKind::LessEqual, TokenKind::Less),
                '>' => self.create_token_match('=', TokenKind::GreaterEqual, TokenKind::Greater),
                '"' => self.create_string_token()?,
                ch if ch.is_ascii_digit() => self.create_digit_token(),
                ch if ch.is_alphabetic() || ch == '_' => self.create_identifier_token(),
                _ => return Err(ScannerError::UnexpectedCharacter { line: self.line }),
            };
            Ok(token)
        } else {
            Ok(self.create_token(TokenKind::EOF))
        }
    }

    fn match_token(&mut self, expected: char) -> bool {
        if let Some(ch) = self.cursor.peek() {
            if ch == expected {
                self.cursor.advance();
                return true;
            }
        }
        false
    }

    fn create_token(&self, kind: TokenKind) -> Token {
        let data = &self.source[self.start..self.cursor.index];
        Token::new(kind, data.to_owned(), self.line)
    }

    fn create_token_match(&mut self, matches: char, if_matches: TokenKind, otherwise: TokenKind) -> Token {
        if self.match_token(matches) {
            self.create_token(if_matches)
        } else {
            self.create_token(otherwise)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(ch) = self.cursor.peek() {
            match ch {
                '\n' => {
                    self.line += 1;
                    self.cursor.advance();
                }
                '/' => {
                    if let Some('/') = self.cursor.peek_next() {
                        // A comment runs to the end of the line.
                        while let Some(ch) = self.cursor.peek() {
                            if ch == '\n' {
                                break;
                            }
                            self.cursor.advance();
                        }
                    } else {
                        return;
                    }
                }
                val if val.is_whitespace() => {
                    self.cursor.advance();
                }
                _ => return,
            }
        }
    }

    fn create_identifier_token(&mut self) -> Token {
        self.cursor
            .advance_when(|ch| ch.is_alphanumeric() || ch == '_');

        let identifier = &self.source[self.start..self.cursor.index];
        if let Some(kind) = self.keywords.get(identifier) {
            self.create_token(*kind)
        } else {
            self.create_token(TokenKind::Identifier)
        }
    }

    fn create_digit_token(&mut self) -> Token {
        let check_digit = |ch: char| ch.is_ascii_digit();

        self.cursor.advance_when(check_digit);

        // Check for a fractional part and scan that.
        if let Some('.') = self.cursor.peek() {
            if let Some(ch) = self.cursor.peek_next() {
                if check_digit(ch) {
                    self.cursor.advance(); // Consume the dot.
                    self.cursor.advance_when(check_digit);
                }
            }
        }

        self.create_token(TokenKind::Number)
    }

    fn create_string_token(&mut self) -> Result<Token, ScannerError> {
        loop {
            if let Some(ch) = self.cursor.advance() {
                if ch == '\n' {
                    self.line += 1;
                }
                if ch == '"' {
                    break;
                }
            } else {
                return Err(ScannerError::UnterminatedString { line: self.line });
            }
        }

        Ok(self.create_token(TokenKind::String))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut scanner = Scanner::new(source);
        let mut kinds = Vec::new();
        loop {
            let token = scanner.scan_token().expect("scan failure");
            let kind = token.kind;
            kinds.push(kind);
            if kind == TokenKind::EOF {
                return kinds;
            }
        }
    }

    #[test]
    fn scan_punctuation_and_operators() {
        assert_eq!(
            kinds("( ) { } , . - + ; / * ! != = == > >= < <="),
            vec![
                TokenKind::ParenLeft,
                TokenKind::ParenRight,
                TokenKind::BraceLeft,
                TokenKind::BraceRight,
                TokenKind::Comma,
                TokenKind::Dot,
                TokenKind::Minus,
                TokenKind::Plus,
                TokenKind::Semicolon,
                TokenKind::Slash,
                TokenKind::Star,
                TokenKind::Bang,
                TokenKind::BangEqual,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_keywords_and_identifiers() {
        assert_eq!(
            kinds("class fun var classy funny variable"),
            vec![
                TokenKind::Class,
                TokenKind::Fun,
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::EOF,
            ]
        );
    }

    #[test]
    fn scan_number_literals() {
        let mut scanner = Scanner::new("12 3.25 4.");
        assert_eq!(scanner.scan_token().unwrap().data, "12");
        assert_eq!(scanner.scan_token().unwrap().data, "3.25");
        // A trailing dot is not part of the number.
        assert_eq!(scanner.scan_token().unwrap().data, "4");
        assert_eq!(scanner.scan_token().unwrap().kind, TokenKind::Dot);
    }

    #[test]
    fn scan_string_literal_keeps_quotes() {
        let mut scanner = Scanner::new("\"hi there\"");
        let token = scanner.scan_token().unwrap();
        assert_eq!(token.kind, TokenKind::String);
        assert_eq!(token.data, "\"hi there\"");
    }

    #[test]
    fn unterminated_string_errors() {
        let mut scanner = Scanner::new("\"oops");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn unexpected_character_errors() {
        let mut scanner = Scanner::new("@");
        assert!(matches!(
            scanner.scan_token(),
            Err(ScannerError::UnexpectedCharacter { .. })
        ));
    }

    #[test]
    fn comments_and_newlines_update_lines() {
        let mut scanner = Scanner::new("// comment\nfoo\nbar");
        let foo = scanner.scan_token().unwrap();
        assert_eq!(foo.line, 2);
        let bar = scanner.scan_token().unwrap();
        assert_eq!(bar.line, 3);
    }

    #[test]
    fn multiline_string_counts_lines() {
        let mut scanner = Scanner::new("\"one\ntwo\" foo");
        let string = scanner.scan_token().unwrap();
        assert_eq!(string.kind, TokenKind::String);
        let foo = scanner.scan_token().unwrap();
        assert_eq!(foo.line, 2);
    }
}
