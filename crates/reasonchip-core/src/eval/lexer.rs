//! Tokenizer for the expression language.

use super::{EvalError, EvalErrorKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Int(i64),
    Float(f64),
    Str(String),
    Ident(String),
    // Punctuation and operators
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Newline,
    Semicolon,
}

pub fn tokenize(expr: &str, source: &str) -> Result<Vec<Token>, EvalError> {
    let mut tokens = Vec::new();
    let mut chars = expr.chars().peekable();

    let err = |kind: EvalErrorKind| EvalError {
        expr: source.to_string(),
        kind,
    };

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' | '\r' => {
                chars.next();
            }
            '\n' => {
                chars.next();
                tokens.push(Token::Newline);
            }
            '#' => {
                // Comment to end of line.
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            '[' => {
                chars.next();
                tokens.push(Token::LBracket);
            }
            ']' => {
                chars.next();
                tokens.push(Token::RBracket);
            }
            '{' => {
                chars.next();
                tokens.push(Token::LBrace);
            }
            '}' => {
                chars.next();
                tokens.push(Token::RBrace);
            }
            ',' => {
                chars.next();
                tokens.push(Token::Comma);
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            ';' => {
                chars.next();
                tokens.push(Token::Semicolon);
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '+' => {
                chars.next();
                tokens.push(Token::Plus);
            }
            '-' => {
                chars.next();
                tokens.push(Token::Minus);
            }
            '*' => {
                chars.next();
                tokens.push(Token::Star);
            }
            '/' => {
                chars.next();
                tokens.push(Token::Slash);
            }
            '%' => {
                chars.next();
                tokens.push(Token::Percent);
            }
            '=' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Eq);
                } else {
                    tokens.push(Token::Assign);
                }
            }
            '!' => {
                chars.next();
                if chars.next() == Some('=') {
                    tokens.push(Token::Ne);
                } else {
                    return Err(err(EvalErrorKind::Syntax("expected '!=' ".into())));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Le);
                } else {
                    tokens.push(Token::Lt);
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Ge);
                } else {
                    tokens.push(Token::Gt);
                }
            }
            '\'' | '"' => {
                let quote = c;
                chars.next();
                let mut out = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    if c == quote {
                        closed = true;
                        break;
                    }
                    if c == '\\' {
                        match chars.next() {
                            Some('n') => out.push('\n'),
                            Some('t') => out.push('\t'),
                            Some('r') => out.push('\r'),
                            Some(other) => out.push(other),
                            None => break,
                        }
                    } else {
                        out.push(c);
                    }
                }
                if !closed {
                    return Err(err(EvalErrorKind::Syntax("unterminated string".into())));
                }
                tokens.push(Token::Str(out));
            }
            c if c.is_ascii_digit() => {
                let mut raw = String::new();
                let mut is_float = false;
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_digit() {
                        raw.push(c);
                        chars.next();
                    } else if c == '.' {
                        // Lookahead: '.' followed by a digit is a float part,
                        // otherwise it is attribute/index syntax.
                        let mut ahead = chars.clone();
                        ahead.next();
                        match ahead.peek() {
                            Some(d) if d.is_ascii_digit() && !is_float => {
                                is_float = true;
                                raw.push('.');
                                chars.next();
                            }
                            _ => break,
                        }
                    } else if c == 'e' || c == 'E' {
                        let mut ahead = chars.clone();
                        ahead.next();
                        match ahead.peek() {
                            Some(&d) if d.is_ascii_digit() || d == '+' || d == '-' => {
                                is_float = true;
                                raw.push(c);
                                chars.next();
                                if let Some(&sign) = chars.peek() {
                                    if sign == '+' || sign == '-' {
                                        raw.push(sign);
                                        chars.next();
                                    }
                                }
                            }
                            _ => break,
                        }
                    } else {
                        break;
                    }
                }
                if is_float {
                    let value: f64 = raw
                        .parse()
                        .map_err(|_| err(EvalErrorKind::Syntax(format!("bad number '{raw}'"))))?;
                    tokens.push(Token::Float(value));
                } else {
                    let value: i64 = raw
                        .parse()
                        .map_err(|_| err(EvalErrorKind::Syntax(format!("bad number '{raw}'"))))?;
                    tokens.push(Token::Int(value));
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => {
                return Err(err(EvalErrorKind::Syntax(format!(
                    "unexpected character '{other}'"
                ))));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_expression() {
        let tokens = tokenize("a.b >= 10 and name == 'bob'", "src").unwrap();
        assert_eq!(tokens[0], Token::Ident("a".into()));
        assert_eq!(tokens[1], Token::Dot);
        assert_eq!(tokens[3], Token::Ge);
        assert_eq!(tokens[4], Token::Int(10));
        assert!(tokens.contains(&Token::Str("bob".into())));
    }

    #[test]
    fn test_tokenize_float_vs_attribute() {
        let tokens = tokenize("1.5 + a.b", "src").unwrap();
        assert_eq!(tokens[0], Token::Float(1.5));
        assert_eq!(tokens[2], Token::Ident("a".into()));
        assert_eq!(tokens[3], Token::Dot);
    }

    #[test]
    fn test_tokenize_rejects_garbage() {
        assert!(tokenize("a ? b", "src").is_err());
        assert!(tokenize("'unterminated", "src").is_err());
    }
}
