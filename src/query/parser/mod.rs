pub mod lexer;
pub mod ast;
pub mod validator;

pub use lexer::{Lexer, Token, LexerError, parse_duration, format_duration};
pub use ast::{
    AstError, BinaryOp, CreateContinuousQueryStatement, Dimension, Expr, Field, FillOption,
    FunctionCall, IntoClause, IntoMeasurement, Measurement, MeasurementName, SelectStatement,
    Statement,
};
pub use validator::{ContinuousQueryValidator, FunctionRegistry, ValidationError};

use std::iter::Peekable;
use std::slice::Iter;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error(transparent)]
    Ast(#[from] AstError),
}

/// Lexes and parses a single statement.
pub fn parse_statement(input: &str) -> Result<Statement, ParseError> {
    let tokens = Lexer::new(input).tokenize()?;
    let statement = Parser::new(&tokens).parse()?;
    Ok(statement)
}

pub struct Parser<'a> {
    tokens: Peekable<Iter<'a, Token>>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens: tokens.iter().peekable(),
        }
    }

    pub fn parse(&mut self) -> Result<Statement, AstError> {
        let statement = match self.peek_token() {
            Some(Token::Create) => Statement::CreateContinuousQuery(self.parse_create_continuous_query()?),
            Some(Token::Select) => Statement::Select(self.parse_select()?),
            Some(Token::EOF) | None => return Err(AstError::UnexpectedEnd),
            Some(other) => return Err(AstError::UnsupportedStatement(format!("{:?}", other))),
        };

        if self.peek_token() == Some(&Token::Semicolon) {
            self.next_token()?;
        }
        self.expect_token(Token::EOF)?;

        Ok(statement)
    }

    fn parse_create_continuous_query(&mut self) -> Result<CreateContinuousQueryStatement, AstError> {
        self.expect_token(Token::Create)?;
        self.expect_token(Token::Continuous)?;
        self.expect_token(Token::Query)?;
        let name = self.parse_identifier()?;
        self.expect_token(Token::On)?;
        let database = self.parse_identifier()?;

        let mut resample_every = None;
        let mut resample_for = None;
        if self.peek_token() == Some(&Token::Resample) {
            self.next_token()?;
            loop {
                match self.peek_token() {
                    Some(Token::Every) if resample_every.is_none() => {
                        self.next_token()?;
                        resample_every = Some(self.parse_duration()?);
                    }
                    Some(Token::For) if resample_for.is_none() => {
                        self.next_token()?;
                        resample_for = Some(self.parse_duration()?);
                    }
                    _ => break,
                }
            }
            if resample_every.is_none() && resample_for.is_none() {
                return Err(self.unexpected("EVERY or FOR after RESAMPLE"));
            }
        }

        self.expect_token(Token::Begin)?;
        let source = self.parse_select()?;
        self.expect_token(Token::End)?;

        Ok(CreateContinuousQueryStatement {
            name,
            database,
            resample_every,
            resample_for,
            source,
        })
    }

    fn parse_select(&mut self) -> Result<SelectStatement, AstError> {
        let mut stmt = SelectStatement::new();

        // Parse SELECT clause
        self.expect_token(Token::Select)?;
        stmt.fields = self.parse_fields()?;

        // Parse INTO clause (optional)
        if self.peek_token() == Some(&Token::Into) {
            self.next_token()?;
            stmt.into = Some(self.parse_into()?);
        }

        // Parse FROM clause
        self.expect_token(Token::From)?;
        stmt.sources = self.parse_sources()?;

        // Parse WHERE clause (optional)
        if self.peek_token() == Some(&Token::Where) {
            self.next_token()?;
            stmt.condition = Some(self.parse_expr()?);
        }

        // Parse GROUP BY clause (optional)
        if self.peek_token() == Some(&Token::GroupBy) {
            self.next_token()?;
            stmt.dimensions = self.parse_dimensions()?;
        }

        // Parse fill() (optional)
        if self.peek_token() == Some(&Token::Fill) {
            self.next_token()?;
            stmt.fill = Some(self.parse_fill()?);
        }

        // Parse ORDER BY clause (optional)
        if self.peek_token() == Some(&Token::OrderBy) {
            self.next_token()?;
            stmt.order_by = self.parse_order_by()?;
        }

        // Parse LIMIT clause (optional)
        if self.peek_token() == Some(&Token::Limit) {
            self.next_token()?;
            stmt.limit = Some(self.parse_unsigned("LIMIT")?);
        }

        // Parse OFFSET clause (optional)
        if self.peek_token() == Some(&Token::Offset) {
            self.next_token()?;
            stmt.offset = Some(self.parse_unsigned("OFFSET")?);
        }

        Ok(stmt)
    }

    fn parse_fields(&mut self) -> Result<Vec<Field>, AstError> {
        let mut fields = Vec::new();

        loop {
            let expr = self.parse_expr()?;
            let alias = if self.peek_token() == Some(&Token::As) {
                self.next_token()?;
                Some(self.parse_identifier()?)
            } else {
                None
            };
            fields.push(Field { expr, alias });

            if self.peek_token() == Some(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }

        Ok(fields)
    }

    fn parse_into(&mut self) -> Result<IntoClause, AstError> {
        let mut segments: Vec<Option<String>> = Vec::new();
        let mut measurement = None;

        loop {
            match self.next_token()? {
                Token::Identifier(name) => segments.push(Some(name.clone())),
                Token::MeasurementPlaceholder => {
                    measurement = Some(IntoMeasurement::Placeholder);
                    break;
                }
                Token::Dot => {
                    // `db..measurement` leaves the retention policy empty
                    segments.push(None);
                    continue;
                }
                other => {
                    return Err(AstError::InvalidInto(format!("unexpected token {:?}", other)));
                }
            }
            if self.peek_token() == Some(&Token::Dot) {
                self.next_token()?;
            } else {
                break;
            }
        }

        let measurement = match measurement {
            Some(m) => m,
            None => match segments.pop() {
                Some(Some(name)) => IntoMeasurement::Literal(name),
                _ => return Err(AstError::InvalidInto("missing measurement".to_string())),
            },
        };

        let (database, retention_policy) = match segments.as_slice() {
            [] => (None, None),
            [rp] => (None, rp.clone()),
            [db, rp] => (db.clone(), rp.clone()),
            _ => return Err(AstError::InvalidInto("too many name segments".to_string())),
        };

        Ok(IntoClause {
            database,
            retention_policy,
            measurement,
        })
    }

    fn parse_sources(&mut self) -> Result<Vec<Measurement>, AstError> {
        let mut sources = Vec::new();

        loop {
            sources.push(self.parse_measurement()?);
            if self.peek_token() == Some(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }

        Ok(sources)
    }

    fn parse_measurement(&mut self) -> Result<Measurement, AstError> {
        let mut segments: Vec<Option<String>> = Vec::new();

        let name = loop {
            match self.next_token()? {
                Token::RegexLiteral(pattern) => break MeasurementName::Regex(pattern.clone()),
                Token::Identifier(name) => {
                    if self.peek_token() == Some(&Token::Dot) {
                        self.next_token()?;
                        segments.push(Some(name.clone()));
                    } else {
                        break MeasurementName::Literal(name.clone());
                    }
                }
                Token::Dot => segments.push(None),
                other => {
                    return Err(AstError::UnexpectedToken {
                        expected: "measurement".to_string(),
                        found: format!("{:?}", other),
                    });
                }
            }
        };

        let (database, retention_policy) = match segments.as_slice() {
            [] => (None, None),
            [rp] => (None, rp.clone()),
            [db, rp] => (db.clone(), rp.clone()),
            _ => {
                return Err(AstError::UnexpectedToken {
                    expected: "at most three name segments".to_string(),
                    found: format!("{}", segments.len() + 1),
                });
            }
        };

        Ok(Measurement {
            database,
            retention_policy,
            name,
        })
    }

    fn parse_dimensions(&mut self) -> Result<Vec<Dimension>, AstError> {
        let mut dimensions = Vec::new();

        loop {
            let dimension = match self.next_token()?.clone() {
                Token::Star => Dimension::Wildcard,
                Token::Identifier(name) if name.eq_ignore_ascii_case("time") => {
                    self.expect_token(Token::LParen)?;
                    let interval = self.parse_duration()?;
                    if interval <= 0 {
                        return Err(AstError::InvalidGroupBy(
                            "time() interval must be positive".to_string(),
                        ));
                    }
                    let offset = if self.peek_token() == Some(&Token::Comma) {
                        self.next_token()?;
                        Some(self.parse_duration()?)
                    } else {
                        None
                    };
                    self.expect_token(Token::RParen)?;
                    Dimension::Time { interval, offset }
                }
                Token::Identifier(name) => Dimension::Tag(name),
                other => {
                    return Err(AstError::InvalidGroupBy(format!("unexpected token {:?}", other)));
                }
            };
            dimensions.push(dimension);

            if self.peek_token() == Some(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }

        Ok(dimensions)
    }

    fn parse_fill(&mut self) -> Result<FillOption, AstError> {
        self.expect_token(Token::LParen)?;
        let option = match self.next_token()?.clone() {
            Token::Identifier(name) => match name.to_lowercase().as_str() {
                "null" => FillOption::Null,
                "none" => FillOption::None,
                "previous" => FillOption::Previous,
                "linear" => FillOption::Linear,
                _ => {
                    return Err(AstError::InvalidFunctionCall(format!("unknown fill option {}", name)));
                }
            },
            Token::NumberLiteral(value) => FillOption::Value(value),
            Token::Minus => match self.next_token()? {
                Token::NumberLiteral(value) => FillOption::Value(-value),
                other => {
                    return Err(AstError::InvalidFunctionCall(format!("invalid fill value {:?}", other)));
                }
            },
            other => {
                return Err(AstError::InvalidFunctionCall(format!("invalid fill value {:?}", other)));
            }
        };
        self.expect_token(Token::RParen)?;
        Ok(option)
    }

    fn parse_order_by(&mut self) -> Result<Vec<(String, bool)>, AstError> {
        let mut order_by = Vec::new();

        loop {
            let name = self.parse_identifier()?;
            let descending = if self.peek_token() == Some(&Token::Desc) {
                self.next_token()?;
                true
            } else if self.peek_token() == Some(&Token::Asc) {
                self.next_token()?;
                false
            } else {
                false
            };
            order_by.push((name, descending));

            if self.peek_token() == Some(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }

        Ok(order_by)
    }

    fn parse_expr(&mut self) -> Result<Expr, AstError> {
        let mut expr = self.parse_and()?;
        while self.peek_token() == Some(&Token::Or) {
            self.next_token()?;
            let rhs = self.parse_and()?;
            expr = Expr::binary(BinaryOp::Or, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_and(&mut self) -> Result<Expr, AstError> {
        let mut expr = self.parse_comparison()?;
        while self.peek_token() == Some(&Token::And) {
            self.next_token()?;
            let rhs = self.parse_comparison()?;
            expr = Expr::binary(BinaryOp::And, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_comparison(&mut self) -> Result<Expr, AstError> {
        let lhs = self.parse_additive()?;
        let op = match self.peek_token() {
            Some(Token::Eq) => BinaryOp::Eq,
            Some(Token::Neq) => BinaryOp::Neq,
            Some(Token::EqRegex) => BinaryOp::EqRegex,
            Some(Token::NeqRegex) => BinaryOp::NeqRegex,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Lte) => BinaryOp::Lte,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Gte) => BinaryOp::Gte,
            _ => return Ok(lhs),
        };
        self.next_token()?;
        let rhs = self.parse_additive()?;
        Ok(Expr::binary(op, lhs, rhs))
    }

    fn parse_additive(&mut self) -> Result<Expr, AstError> {
        let mut expr = self.parse_multiplicative()?;
        loop {
            let op = match self.peek_token() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.next_token()?;
            let rhs = self.parse_multiplicative()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, AstError> {
        let mut expr = self.parse_primary()?;
        loop {
            let op = match self.peek_token() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.next_token()?;
            let rhs = self.parse_primary()?;
            expr = Expr::binary(op, expr, rhs);
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, AstError> {
        match self.next_token()?.clone() {
            Token::Star => Ok(Expr::Wildcard),
            Token::NumberLiteral(value) => Ok(Expr::Number(value)),
            Token::StringLiteral(value) => Ok(Expr::String(value)),
            Token::DurationLiteral(nanos) => Ok(Expr::Duration(nanos)),
            Token::RegexLiteral(pattern) => Ok(Expr::Regex(pattern)),
            Token::Minus => match self.next_token()?.clone() {
                Token::NumberLiteral(value) => Ok(Expr::Number(-value)),
                Token::DurationLiteral(nanos) => Ok(Expr::Duration(-nanos)),
                other => Err(AstError::UnexpectedToken {
                    expected: "number or duration after '-'".to_string(),
                    found: format!("{:?}", other),
                }),
            },
            Token::LParen => {
                let inner = self.parse_expr()?;
                self.expect_token(Token::RParen)?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Token::Identifier(name) => {
                if self.peek_token() == Some(&Token::LParen) {
                    self.next_token()?;
                    let args = self.parse_call_args()?;
                    self.expect_token(Token::RParen)?;
                    Ok(Expr::Call(FunctionCall { name, args }))
                } else {
                    Ok(Expr::Identifier(name))
                }
            }
            Token::EOF => Err(AstError::UnexpectedEnd),
            other => Err(AstError::UnexpectedToken {
                expected: "expression".to_string(),
                found: format!("{:?}", other),
            }),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Expr>, AstError> {
        let mut args = Vec::new();
        if self.peek_token() == Some(&Token::RParen) {
            return Ok(args);
        }

        loop {
            args.push(self.parse_expr()?);
            if self.peek_token() == Some(&Token::Comma) {
                self.next_token()?;
            } else {
                break;
            }
        }

        Ok(args)
    }

    fn parse_identifier(&mut self) -> Result<String, AstError> {
        match self.next_token()? {
            Token::Identifier(name) => Ok(name.clone()),
            Token::EOF => Err(AstError::UnexpectedEnd),
            other => Err(AstError::UnexpectedToken {
                expected: "identifier".to_string(),
                found: format!("{:?}", other),
            }),
        }
    }

    fn parse_duration(&mut self) -> Result<i64, AstError> {
        match self.next_token()? {
            Token::DurationLiteral(nanos) => Ok(*nanos),
            Token::EOF => Err(AstError::UnexpectedEnd),
            other => Err(AstError::UnexpectedToken {
                expected: "duration".to_string(),
                found: format!("{:?}", other),
            }),
        }
    }

    fn parse_unsigned(&mut self, clause: &str) -> Result<usize, AstError> {
        match self.next_token()? {
            Token::NumberLiteral(value) if *value >= 0.0 && value.fract() == 0.0 => Ok(*value as usize),
            other => Err(AstError::UnexpectedToken {
                expected: format!("non-negative integer after {}", clause),
                found: format!("{:?}", other),
            }),
        }
    }

    fn next_token(&mut self) -> Result<&'a Token, AstError> {
        self.tokens.next().ok_or(AstError::UnexpectedEnd)
    }

    fn peek_token(&mut self) -> Option<&'a Token> {
        self.tokens.peek().copied()
    }

    fn unexpected(&mut self, expected: &str) -> AstError {
        match self.peek_token() {
            Some(token) => AstError::UnexpectedToken {
                expected: expected.to_string(),
                found: format!("{:?}", token),
            },
            None => AstError::UnexpectedEnd,
        }
    }

    fn expect_token(&mut self, expected: Token) -> Result<(), AstError> {
        let token = self.next_token()?;
        if token == &expected {
            Ok(())
        } else {
            Err(AstError::UnexpectedToken {
                expected: format!("{:?}", expected),
                found: format!("{:?}", token),
            })
        }
    }
}
