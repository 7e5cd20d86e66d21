use std::iter::Peekable;
use std::str::Chars;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum LexerError {
    #[error("Unexpected character: {0}")]
    UnexpectedChar(char),
    #[error("Invalid number format: {0}")]
    InvalidNumber(String),
    #[error("Invalid duration: {0}")]
    InvalidDuration(String),
    #[error("Unterminated string literal")]
    UnterminatedString,
    #[error("Unterminated regex literal")]
    UnterminatedRegex,
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Keywords
    Select,
    Into,
    From,
    Where,
    GroupBy,
    OrderBy,
    Limit,
    Offset,
    And,
    Or,
    As,
    Desc,
    Asc,
    Fill,
    Create,
    Continuous,
    Query,
    On,
    Resample,
    Every,
    For,
    Begin,
    End,

    // Operators
    Eq,        // =
    Neq,       // != or <>
    EqRegex,   // =~
    NeqRegex,  // !~
    Gt,        // >
    Lt,        // <
    Gte,       // >=
    Lte,       // <=
    Plus,      // +
    Minus,     // -
    Star,      // *
    Slash,     // /

    // Punctuation
    Comma,     // ,
    Dot,       // .
    LParen,    // (
    RParen,    // )
    Semicolon, // ;

    // Literals
    Identifier(String),
    StringLiteral(String),
    NumberLiteral(f64),
    /// Duration in nanoseconds
    DurationLiteral(i64),
    RegexLiteral(String),
    /// The `:MEASUREMENT` backreference used in INTO clauses
    MeasurementPlaceholder,

    // Special
    EOF,
}

const NANOS_PER_MICRO: i64 = 1_000;
const NANOS_PER_MILLI: i64 = 1_000_000;
const NANOS_PER_SECOND: i64 = 1_000_000_000;
const NANOS_PER_MINUTE: i64 = 60 * NANOS_PER_SECOND;
const NANOS_PER_HOUR: i64 = 60 * NANOS_PER_MINUTE;
const NANOS_PER_DAY: i64 = 24 * NANOS_PER_HOUR;
const NANOS_PER_WEEK: i64 = 7 * NANOS_PER_DAY;

/// Parses a duration literal such as `10s`, `1m` or `1h30m` into nanoseconds.
pub fn parse_duration(input: &str) -> Result<i64, LexerError> {
    let invalid = || LexerError::InvalidDuration(input.to_string());
    let mut chars = input.chars().peekable();
    let mut total: i64 = 0;

    if chars.peek().is_none() {
        return Err(invalid());
    }

    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_ascii_digit() {
                digits.push(c);
                chars.next();
            } else {
                break;
            }
        }
        let mut unit = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphabetic() {
                unit.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() || unit.is_empty() {
            return Err(invalid());
        }

        let value: i64 = digits.parse().map_err(|_| invalid())?;
        let multiplier = unit_multiplier(&unit).ok_or_else(invalid)?;
        let part = value.checked_mul(multiplier).ok_or_else(invalid)?;
        total = total.checked_add(part).ok_or_else(invalid)?;
    }

    Ok(total)
}

fn unit_multiplier(unit: &str) -> Option<i64> {
    match unit {
        "ns" => Some(1),
        "u" | "us" | "µ" | "µs" => Some(NANOS_PER_MICRO),
        "ms" => Some(NANOS_PER_MILLI),
        "s" => Some(NANOS_PER_SECOND),
        "m" => Some(NANOS_PER_MINUTE),
        "h" => Some(NANOS_PER_HOUR),
        "d" => Some(NANOS_PER_DAY),
        "w" => Some(NANOS_PER_WEEK),
        _ => None,
    }
}

/// Formats nanoseconds back into the largest exact duration unit.
pub fn format_duration(nanos: i64) -> String {
    if nanos == 0 {
        return "0s".to_string();
    }
    let units = [
        (NANOS_PER_WEEK, "w"),
        (NANOS_PER_DAY, "d"),
        (NANOS_PER_HOUR, "h"),
        (NANOS_PER_MINUTE, "m"),
        (NANOS_PER_SECOND, "s"),
        (NANOS_PER_MILLI, "ms"),
        (NANOS_PER_MICRO, "u"),
    ];
    for (size, suffix) in units {
        if nanos % size == 0 {
            return format!("{}{}", nanos / size, suffix);
        }
    }
    format!("{}ns", nanos)
}

pub struct Lexer<'a> {
    input: Peekable<Chars<'a>>,
    current_pos: usize,
    /// Last emitted token, used to disambiguate `/` between division and regex
    previous: Option<Token>,
    /// True while lexing the source list of a FROM clause
    in_from: bool,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            input: input.chars().peekable(),
            current_pos: 0,
            previous: None,
            in_from: false,
        }
    }

    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexerError> {
        let mut tokens = Vec::new();

        while let Some(token) = self.next_token()? {
            match token {
                Token::From => self.in_from = true,
                Token::Where
                | Token::GroupBy
                | Token::OrderBy
                | Token::Limit
                | Token::Offset
                | Token::Fill
                | Token::End
                | Token::Semicolon => self.in_from = false,
                _ => {}
            }
            self.previous = Some(token.clone());
            tokens.push(token);
        }

        tokens.push(Token::EOF);
        Ok(tokens)
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.input.next();
        if c.is_some() {
            self.current_pos += 1;
        }
        c
    }

    fn regex_allowed(&self) -> bool {
        match &self.previous {
            Some(Token::From) | Some(Token::EqRegex) | Some(Token::NeqRegex) => true,
            Some(Token::Comma) => self.in_from,
            _ => false,
        }
    }

    fn next_token(&mut self) -> Result<Option<Token>, LexerError> {
        self.skip_whitespace();

        if let Some(&c) = self.input.peek() {
            let token = match c {
                '=' => {
                    self.advance();
                    if let Some('~') = self.input.peek() {
                        self.advance();
                        Token::EqRegex
                    } else {
                        Token::Eq
                    }
                }
                '!' => {
                    self.advance();
                    match self.input.peek() {
                        Some('=') => {
                            self.advance();
                            Token::Neq
                        }
                        Some('~') => {
                            self.advance();
                            Token::NeqRegex
                        }
                        _ => return Err(LexerError::UnexpectedChar('!')),
                    }
                }
                '>' => {
                    self.advance();
                    if let Some('=') = self.input.peek() {
                        self.advance();
                        Token::Gte
                    } else {
                        Token::Gt
                    }
                }
                '<' => {
                    self.advance();
                    match self.input.peek() {
                        Some('=') => {
                            self.advance();
                            Token::Lte
                        }
                        Some('>') => {
                            self.advance();
                            Token::Neq
                        }
                        _ => Token::Lt,
                    }
                }
                '+' => {
                    self.advance();
                    Token::Plus
                }
                '-' => {
                    self.advance();
                    Token::Minus
                }
                '*' => {
                    self.advance();
                    Token::Star
                }
                '/' if self.regex_allowed() => self.parse_regex()?,
                '/' => {
                    self.advance();
                    Token::Slash
                }
                ',' => {
                    self.advance();
                    Token::Comma
                }
                '.' => {
                    self.advance();
                    Token::Dot
                }
                '(' => {
                    self.advance();
                    Token::LParen
                }
                ')' => {
                    self.advance();
                    Token::RParen
                }
                ';' => {
                    self.advance();
                    Token::Semicolon
                }
                ':' => self.parse_placeholder()?,

                // Double quotes delimit identifiers, single quotes delimit strings
                '"' => Token::Identifier(self.parse_quoted('"')?),
                '\'' => Token::StringLiteral(self.parse_quoted('\'')?),

                c if c.is_ascii_digit() => self.parse_number()?,
                c if c.is_ascii_alphabetic() || c == '_' => self.parse_identifier()?,

                c => return Err(LexerError::UnexpectedChar(c)),
            };

            Ok(Some(token))
        } else {
            Ok(None)
        }
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.input.peek() {
            if c.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn parse_quoted(&mut self, quote: char) -> Result<String, LexerError> {
        self.advance();
        let mut string = String::new();

        while let Some(c) = self.advance() {
            match c {
                '\\' => match self.advance() {
                    Some(escaped) => string.push(escaped),
                    None => return Err(LexerError::UnterminatedString),
                },
                c if c == quote => return Ok(string),
                c => string.push(c),
            }
        }

        Err(LexerError::UnterminatedString)
    }

    fn parse_regex(&mut self) -> Result<Token, LexerError> {
        self.advance();
        let mut pattern = String::new();

        while let Some(c) = self.advance() {
            match c {
                '\\' => match self.advance() {
                    Some('/') => pattern.push('/'),
                    Some(other) => {
                        pattern.push('\\');
                        pattern.push(other);
                    }
                    None => return Err(LexerError::UnterminatedRegex),
                },
                '/' => return Ok(Token::RegexLiteral(pattern)),
                c => pattern.push(c),
            }
        }

        Err(LexerError::UnterminatedRegex)
    }

    fn parse_placeholder(&mut self) -> Result<Token, LexerError> {
        self.advance();
        let word = self.peek_word();
        if word.eq_ignore_ascii_case("measurement") {
            self.consume_chars(word.len());
            Ok(Token::MeasurementPlaceholder)
        } else {
            Err(LexerError::InvalidIdentifier(format!(":{}", word)))
        }
    }

    fn parse_number(&mut self) -> Result<Token, LexerError> {
        let mut number = String::new();
        let mut has_decimal = false;

        while let Some(&c) = self.input.peek() {
            match c {
                '0'..='9' => {
                    number.push(c);
                    self.advance();
                }
                '.' if !has_decimal => {
                    has_decimal = true;
                    number.push(c);
                    self.advance();
                }
                _ => break,
            }
        }

        // A unit suffix turns the number into a duration literal (10s, 1h30m)
        if matches!(self.input.peek(), Some(c) if c.is_alphabetic()) {
            if has_decimal {
                return Err(LexerError::InvalidDuration(number));
            }
            let mut literal = number;
            while let Some(&c) = self.input.peek() {
                if c.is_alphanumeric() {
                    literal.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            return parse_duration(&literal).map(Token::DurationLiteral);
        }

        number
            .parse::<f64>()
            .map(Token::NumberLiteral)
            .map_err(|_| LexerError::InvalidNumber(number))
    }

    fn peek_word(&mut self) -> String {
        let mut word = String::new();
        let chars = self.input.clone();

        for c in chars {
            if c.is_ascii_alphanumeric() || c == '_' {
                word.push(c);
            } else {
                break;
            }
        }

        word
    }

    fn consume_chars(&mut self, count: usize) {
        for _ in 0..count {
            self.advance();
        }
    }

    fn parse_identifier(&mut self) -> Result<Token, LexerError> {
        let mut identifier = String::new();

        while let Some(&c) = self.input.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                identifier.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // Check for compound keywords (GROUP BY, ORDER BY)
        let token = match identifier.to_lowercase().as_str() {
            "select" => Token::Select,
            "into" => Token::Into,
            "from" => Token::From,
            "where" => Token::Where,
            "group" => {
                self.skip_whitespace();
                if self.peek_word().eq_ignore_ascii_case("by") {
                    self.consume_chars(2);
                    Token::GroupBy
                } else {
                    Token::Identifier(identifier)
                }
            }
            "order" => {
                self.skip_whitespace();
                if self.peek_word().eq_ignore_ascii_case("by") {
                    self.consume_chars(2);
                    Token::OrderBy
                } else {
                    Token::Identifier(identifier)
                }
            }
            "limit" => Token::Limit,
            "offset" => Token::Offset,
            "and" => Token::And,
            "or" => Token::Or,
            "as" => Token::As,
            "desc" => Token::Desc,
            "asc" => Token::Asc,
            "fill" => Token::Fill,
            "create" => Token::Create,
            "continuous" => Token::Continuous,
            "query" => Token::Query,
            "on" => Token::On,
            "resample" => Token::Resample,
            "every" => Token::Every,
            "for" => Token::For,
            "begin" => Token::Begin,
            "end" => Token::End,
            _ => Token::Identifier(identifier),
        };

        Ok(token)
    }
}
