//! Tokenizer for artifact scripts.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),

    Fn,
    Let,
    If,
    Else,
    While,
    For,
    In,
    Return,
    Break,
    Continue,
    True,
    False,
    Null,

    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Colon,
    Semi,
    Dot,

    Assign,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    AndAnd,
    OrOr,
    Bang,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "{name}"),
            Token::Int(v) => write!(f, "{v}"),
            Token::Float(v) => write!(f, "{v}"),
            Token::Str(s) => write!(f, "{s:?}"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// A token plus the line it started on, for error messages.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = source.chars().collect();
    let mut i = 0;
    let mut line = 1;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\n' => {
                line += 1;
                i += 1;
            }
            ' ' | '\t' | '\r' => i += 1,
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '0'..='9' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let mut is_float = false;
                if i + 1 < chars.len() && chars[i] == '.' && chars[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < chars.len() && chars[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let token = if is_float {
                    Token::Float(
                        text.parse()
                            .map_err(|_| format!("line {line}: bad number '{text}'"))?,
                    )
                } else {
                    Token::Int(
                        text.parse()
                            .map_err(|_| format!("line {line}: bad number '{text}'"))?,
                    )
                };
                tokens.push(Spanned { token, line });
            }
            '"' => {
                let start_line = line;
                i += 1;
                let mut value = String::new();
                loop {
                    if i >= chars.len() {
                        return Err(format!("line {start_line}: unterminated string"));
                    }
                    match chars[i] {
                        '"' => {
                            i += 1;
                            break;
                        }
                        '\\' => {
                            i += 1;
                            if i >= chars.len() {
                                return Err(format!("line {start_line}: unterminated string"));
                            }
                            value.push(match chars[i] {
                                'n' => '\n',
                                't' => '\t',
                                'r' => '\r',
                                '\\' => '\\',
                                '"' => '"',
                                other => {
                                    return Err(format!(
                                        "line {line}: unknown escape '\\{other}'"
                                    ))
                                }
                            });
                            i += 1;
                        }
                        '\n' => {
                            value.push('\n');
                            line += 1;
                            i += 1;
                        }
                        other => {
                            value.push(other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Spanned {
                    token: Token::Str(value),
                    line: start_line,
                });
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                let token = match word.as_str() {
                    "fn" => Token::Fn,
                    "let" => Token::Let,
                    "if" => Token::If,
                    "else" => Token::Else,
                    "while" => Token::While,
                    "for" => Token::For,
                    "in" => Token::In,
                    "return" => Token::Return,
                    "break" => Token::Break,
                    "continue" => Token::Continue,
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => Token::Ident(word),
                };
                tokens.push(Spanned { token, line });
            }
            _ => {
                let two: Option<Token> = if i + 1 < chars.len() {
                    match (c, chars[i + 1]) {
                        ('=', '=') => Some(Token::Eq),
                        ('!', '=') => Some(Token::NotEq),
                        ('<', '=') => Some(Token::LtEq),
                        ('>', '=') => Some(Token::GtEq),
                        ('&', '&') => Some(Token::AndAnd),
                        ('|', '|') => Some(Token::OrOr),
                        _ => None,
                    }
                } else {
                    None
                };
                if let Some(token) = two {
                    tokens.push(Spanned { token, line });
                    i += 2;
                    continue;
                }
                let token = match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '{' => Token::LBrace,
                    '}' => Token::RBrace,
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    ',' => Token::Comma,
                    ':' => Token::Colon,
                    ';' => Token::Semi,
                    '.' => Token::Dot,
                    '=' => Token::Assign,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '%' => Token::Percent,
                    '<' => Token::Lt,
                    '>' => Token::Gt,
                    '!' => Token::Bang,
                    other => return Err(format!("line {line}: unexpected character '{other}'")),
                };
                tokens.push(Spanned { token, line });
                i += 1;
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_a_function_header() {
        let tokens = tokenize("fn run(x) { return x + 1; }").unwrap();
        assert_eq!(tokens[0].token, Token::Fn);
        assert_eq!(tokens[1].token, Token::Ident("run".to_string()));
        assert!(tokens.iter().any(|t| t.token == Token::Plus));
    }

    #[test]
    fn strings_support_escapes_and_comments_are_skipped() {
        let tokens = tokenize("# note\n\"a\\nb\"").unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].token, Token::Str("a\nb".to_string()));
        assert_eq!(tokens[0].line, 2);
    }

    #[test]
    fn rejects_unterminated_strings() {
        assert!(tokenize("\"oops").unwrap_err().contains("unterminated"));
    }
}
