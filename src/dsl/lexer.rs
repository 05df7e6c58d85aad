//! Lexer (tokenizer) for the model description language.

use crate::error::{DendriteError, Result};

/// A token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    /// The kind of token
    pub kind: TokenKind,
    /// The token's text
    pub text: String,
    /// Line number (1-indexed)
    pub line: usize,
    /// Column number (1-indexed)
    pub column: usize,
}

/// Token types in the description language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// Keyword, node name or instance name
    Identifier,
    /// A number (integer or floating point, possibly with suffix)
    Number,
    /// A directive (starts with '.')
    Directive,
    /// Equals sign '='
    Equals,
    /// Newline
    Newline,
    /// End of file
    Eof,
}

/// SI suffixes accepted after a number.
const SUFFIXES: [char; 8] = ['p', 'n', 'u', 'µ', 'm', 'k', 'M', 'G'];

/// Lexer for tokenizing description input.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    /// Create a new lexer for the given input.
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
            line: 1,
            column: 1,
        }
    }

    /// Get the next token.
    pub fn next_token(&mut self) -> Result<Token> {
        self.skip_whitespace_and_comments();

        let line = self.line;
        let column = self.column;
        let token = |kind, text: String| Token { kind, text, line, column };

        let Some(&ch) = self.chars.peek() else {
            return Ok(token(TokenKind::Eof, String::new()));
        };

        match ch {
            '\n' => {
                self.advance();
                Ok(token(TokenKind::Newline, "\n".to_string()))
            }
            '.' => {
                self.advance();
                let name = self.read_identifier();
                if name.is_empty() {
                    return Err(DendriteError::lexer(line, column, "directive name expected after '.'"));
                }
                Ok(token(TokenKind::Directive, format!(".{}", name)))
            }
            '=' => {
                self.advance();
                Ok(token(TokenKind::Equals, "=".to_string()))
            }
            '-' | '+' | '0'..='9' => Ok(token(TokenKind::Number, self.read_number())),
            _ if ch.is_alphabetic() || ch == '_' => Ok(token(TokenKind::Identifier, self.read_identifier())),
            _ => Err(DendriteError::lexer(
                line,
                column,
                format!("unexpected character '{}'", ch),
            )),
        }
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn skip_whitespace_and_comments(&mut self) {
        while let Some(&ch) = self.chars.peek() {
            if ch == ' ' || ch == '\t' || ch == '\r' {
                self.advance();
            } else if ch == '#' || ch == ';' {
                while let Some(&c) = self.chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.advance();
                }
            } else {
                break;
            }
        }
    }

    fn read_identifier(&mut self) -> String {
        let mut text = String::new();
        while let Some(&ch) = self.chars.peek() {
            if ch.is_alphanumeric() || ch == '_' {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        text
    }

    fn read_digits(&mut self, text: &mut String) {
        while let Some(&ch) = self.chars.peek() {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
    }

    fn read_number(&mut self) -> String {
        let mut text = String::new();

        if let Some(&ch) = self.chars.peek() {
            if ch == '-' || ch == '+' {
                text.push(ch);
                self.advance();
            }
        }

        self.read_digits(&mut text);

        if let Some(&'.') = self.chars.peek() {
            text.push('.');
            self.advance();
            self.read_digits(&mut text);
        }

        if let Some(&ch) = self.chars.peek() {
            if ch == 'e' || ch == 'E' {
                text.push(ch);
                self.advance();
                if let Some(&sign) = self.chars.peek() {
                    if sign == '-' || sign == '+' {
                        text.push(sign);
                        self.advance();
                    }
                }
                self.read_digits(&mut text);
            }
        }

        if let Some(&ch) = self.chars.peek() {
            if SUFFIXES.contains(&ch) {
                text.push(ch);
                self.advance();
            }
        }

        text
    }
}

/// Parse a number string with optional SI suffix.
pub fn parse_value(text: &str) -> Option<f64> {
    let text = text.trim();
    let last = text.chars().last()?;
    let multiplier = match last {
        'p' => 1e-12,
        'n' => 1e-9,
        'u' | 'µ' => 1e-6,
        'm' => 1e-3,
        'k' => 1e3,
        'M' => 1e6,
        'G' => 1e9,
        _ => return text.parse::<f64>().ok(),
    };
    text[..text.len() - last.len_utf8()]
        .parse::<f64>()
        .ok()
        .map(|v| v * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_parse_value() {
        assert_relative_eq!(parse_value("50u").unwrap(), 5e-5);
        assert_relative_eq!(parse_value("2.5m").unwrap(), 2.5e-3);
        assert_relative_eq!(parse_value("-65").unwrap(), -65.0);
        assert_relative_eq!(parse_value("1e-3").unwrap(), 1e-3);
        assert_relative_eq!(parse_value("1k").unwrap(), 1000.0);
        assert!(parse_value("k").is_none());
        assert!(parse_value("").is_none());
    }

    #[test]
    fn test_lexer_node_line() {
        let mut lexer = Lexer::new("node dend soma g=0.5 v=-65\n");
        let kinds: Vec<TokenKind> = std::iter::from_fn(|| {
            let tok = lexer.next_token().unwrap();
            (tok.kind != TokenKind::Eof).then_some(tok.kind)
        })
        .collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Equals,
                TokenKind::Number,
                TokenKind::Identifier,
                TokenKind::Equals,
                TokenKind::Number,
                TokenKind::Newline,
            ]
        );
    }

    #[test]
    fn test_lexer_directive_and_comment() {
        let mut lexer = Lexer::new(".atol 1e-4 # global\n");
        let tok = lexer.next_token().unwrap();
        assert_eq!(tok.kind, TokenKind::Directive);
        assert_eq!(tok.text, ".atol");
        let tok = lexer.next_token().unwrap();
        assert_eq!(tok.kind, TokenKind::Number);
        assert_eq!(tok.text, "1e-4");
        assert_eq!(lexer.next_token().unwrap().kind, TokenKind::Newline);
        let eof = lexer.next_token().unwrap();
        assert_eq!(eof.kind, TokenKind::Eof);
        assert_eq!(eof.line, 2);
    }

    #[test]
    fn test_lexer_rejects_stray_characters() {
        let mut lexer = Lexer::new("node soma @");
        lexer.next_token().unwrap();
        lexer.next_token().unwrap();
        let err = lexer.next_token().unwrap_err();
        assert!(matches!(err, DendriteError::LexerError { line: 1, column: 11, .. }));
    }
}
