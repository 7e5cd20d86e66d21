use std::fmt;

use chrono::{DateTime, SecondsFormat};
use thiserror::Error;

use super::lexer::format_duration;

#[derive(Debug, Error, PartialEq)]
pub enum AstError {
    #[error("Expected {expected}, got {found}")]
    UnexpectedToken { expected: String, found: String },
    #[error("Unexpected end of input")]
    UnexpectedEnd,
    #[error("Unsupported statement: {0}")]
    UnsupportedStatement(String),
    #[error("Invalid function call: {0}")]
    InvalidFunctionCall(String),
    #[error("Invalid INTO clause: {0}")]
    InvalidInto(String),
    #[error("Invalid GROUP BY clause: {0}")]
    InvalidGroupBy(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateContinuousQuery(CreateContinuousQueryStatement),
    Select(SelectStatement),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateContinuousQueryStatement {
    pub name: String,
    pub database: String,
    /// RESAMPLE EVERY in nanoseconds
    pub resample_every: Option<i64>,
    /// RESAMPLE FOR in nanoseconds
    pub resample_for: Option<i64>,
    pub source: SelectStatement,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Neq,
    EqRegex,
    NeqRegex,
    Lt,
    Lte,
    Gt,
    Gte,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::Neq
                | BinaryOp::EqRegex
                | BinaryOp::NeqRegex
                | BinaryOp::Lt
                | BinaryOp::Lte
                | BinaryOp::Gt
                | BinaryOp::Gte
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub args: Vec<Expr>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Identifier(String),
    Wildcard,
    Number(f64),
    String(String),
    /// Duration in nanoseconds
    Duration(i64),
    Regex(String),
    /// Absolute timestamp in nanoseconds, rendered as an RFC3339 literal
    Time(i64),
    Call(FunctionCall),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Paren(Box<Expr>),
}

impl Expr {
    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    /// Returns true if the expression references the `time` column anywhere.
    pub fn references_time(&self) -> bool {
        match self {
            Expr::Identifier(name) => name.eq_ignore_ascii_case("time"),
            Expr::Binary { lhs, rhs, .. } => lhs.references_time() || rhs.references_time(),
            Expr::Paren(inner) => inner.references_time(),
            Expr::Call(call) => call.args.iter().any(Expr::references_time),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeasurementName {
    Literal(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub database: Option<String>,
    pub retention_policy: Option<String>,
    pub name: MeasurementName,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IntoMeasurement {
    Literal(String),
    /// `:MEASUREMENT`, resolved per source measurement
    Placeholder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IntoClause {
    pub database: Option<String>,
    pub retention_policy: Option<String>,
    pub measurement: IntoMeasurement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    /// GROUP BY time(interval[, offset]), both in nanoseconds
    Time { interval: i64, offset: Option<i64> },
    Tag(String),
    Wildcard,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FillOption {
    Null,
    None,
    Previous,
    Linear,
    Value(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectStatement {
    pub fields: Vec<Field>,
    pub into: Option<IntoClause>,
    pub sources: Vec<Measurement>,
    pub condition: Option<Expr>,
    pub dimensions: Vec<Dimension>,
    pub fill: Option<FillOption>,
    pub order_by: Vec<(String, bool)>,  // (field, descending)
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl SelectStatement {
    pub fn new() -> Self {
        Self {
            fields: Vec::new(),
            into: None,
            sources: Vec::new(),
            condition: None,
            dimensions: Vec::new(),
            fill: None,
            order_by: Vec::new(),
            limit: None,
            offset: None,
        }
    }

    /// The GROUP BY time() interval in nanoseconds, if the statement has one.
    pub fn group_by_interval(&self) -> Option<i64> {
        self.dimensions.iter().find_map(|d| match d {
            Dimension::Time { interval, .. } => Some(*interval),
            _ => None,
        })
    }

    /// The GROUP BY time() offset in nanoseconds, zero when absent.
    pub fn group_by_offset(&self) -> i64 {
        self.dimensions
            .iter()
            .find_map(|d| match d {
                Dimension::Time { offset, .. } => *offset,
                _ => None,
            })
            .unwrap_or(0)
    }
}

impl Default for SelectStatement {
    fn default() -> Self {
        Self::new()
    }
}

const RESERVED: &[&str] = &[
    "select", "into", "from", "where", "group", "order", "by", "limit", "offset", "and", "or",
    "as", "desc", "asc", "fill", "create", "continuous", "query", "on", "resample", "every",
    "for", "begin", "end",
];

/// Quotes an identifier when it would not lex back as a bare identifier.
pub fn quote_ident(ident: &str) -> String {
    let bare = ident
        .chars()
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false)
        && ident.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !RESERVED.contains(&ident.to_lowercase().as_str());
    if bare {
        ident.to_string()
    } else {
        format!("\"{}\"", ident.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Eq => "=",
            BinaryOp::Neq => "!=",
            BinaryOp::EqRegex => "=~",
            BinaryOp::NeqRegex => "!~",
            BinaryOp::Lt => "<",
            BinaryOp::Lte => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Gte => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        };
        f.write_str(s)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Identifier(name) => write!(f, "{}", quote_ident(name)),
            Expr::Wildcard => f.write_str("*"),
            Expr::Number(value) => f.write_str(&format_number(*value)),
            Expr::String(value) => write!(f, "'{}'", value.replace('\'', "\\'")),
            Expr::Duration(nanos) => f.write_str(&format_duration(*nanos)),
            Expr::Regex(pattern) => write!(f, "/{}/", pattern.replace('/', "\\/")),
            Expr::Time(nanos) => {
                let ts = DateTime::from_timestamp_nanos(*nanos);
                write!(f, "'{}'", ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Expr::Call(call) => write!(f, "{}", call),
            Expr::Binary { op, lhs, rhs } => write!(f, "{} {} {}", lhs, op, rhs),
            Expr::Paren(inner) => write!(f, "({})", inner),
        }
    }
}

impl fmt::Display for FunctionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|a| a.to_string()).collect();
        write!(f, "{}({})", self.name, args.join(", "))
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if let Some(alias) = &self.alias {
            write!(f, " AS {}", quote_ident(alias))?;
        }
        Ok(())
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = &self.database {
            write!(f, "{}.", quote_ident(db))?;
            if self.retention_policy.is_none() {
                f.write_str(".")?;
            }
        }
        if let Some(rp) = &self.retention_policy {
            write!(f, "{}.", quote_ident(rp))?;
        }
        match &self.name {
            MeasurementName::Literal(name) => write!(f, "{}", quote_ident(name)),
            MeasurementName::Regex(pattern) => write!(f, "/{}/", pattern.replace('/', "\\/")),
        }
    }
}

impl fmt::Display for IntoClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(db) = &self.database {
            write!(f, "{}.", quote_ident(db))?;
            if self.retention_policy.is_none() {
                f.write_str(".")?;
            }
        }
        if let Some(rp) = &self.retention_policy {
            write!(f, "{}.", quote_ident(rp))?;
        }
        match &self.measurement {
            IntoMeasurement::Literal(name) => write!(f, "{}", quote_ident(name)),
            IntoMeasurement::Placeholder => f.write_str(":MEASUREMENT"),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Time { interval, offset: Some(offset) } => {
                write!(f, "time({}, {})", format_duration(*interval), format_duration(*offset))
            }
            Dimension::Time { interval, offset: None } => {
                write!(f, "time({})", format_duration(*interval))
            }
            Dimension::Tag(tag) => write!(f, "{}", quote_ident(tag)),
            Dimension::Wildcard => f.write_str("*"),
        }
    }
}

impl fmt::Display for FillOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillOption::Null => f.write_str("fill(null)"),
            FillOption::None => f.write_str("fill(none)"),
            FillOption::Previous => f.write_str("fill(previous)"),
            FillOption::Linear => f.write_str("fill(linear)"),
            FillOption::Value(v) => write!(f, "fill({})", format_number(*v)),
        }
    }
}

fn join<T: fmt::Display>(items: &[T]) -> String {
    items.iter().map(|i| i.to_string()).collect::<Vec<_>>().join(", ")
}

impl fmt::Display for SelectStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SELECT {}", join(&self.fields))?;
        if let Some(into) = &self.into {
            write!(f, " INTO {}", into)?;
        }
        write!(f, " FROM {}", join(&self.sources))?;
        if let Some(condition) = &self.condition {
            write!(f, " WHERE {}", condition)?;
        }
        if !self.dimensions.is_empty() {
            write!(f, " GROUP BY {}", join(&self.dimensions))?;
        }
        if let Some(fill) = &self.fill {
            write!(f, " {}", fill)?;
        }
        if !self.order_by.is_empty() {
            let order: Vec<String> = self
                .order_by
                .iter()
                .map(|(field, desc)| {
                    format!("{} {}", quote_ident(field), if *desc { "DESC" } else { "ASC" })
                })
                .collect();
            write!(f, " ORDER BY {}", order.join(", "))?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {}", limit)?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {}", offset)?;
        }
        Ok(())
    }
}

impl fmt::Display for CreateContinuousQueryStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CREATE CONTINUOUS QUERY {} ON {}",
            quote_ident(&self.name),
            quote_ident(&self.database)
        )?;
        if self.resample_every.is_some() || self.resample_for.is_some() {
            f.write_str(" RESAMPLE")?;
            if let Some(every) = self.resample_every {
                write!(f, " EVERY {}", format_duration(every))?;
            }
            if let Some(for_) = self.resample_for {
                write!(f, " FOR {}", format_duration(for_))?;
            }
        }
        write!(f, " BEGIN {} END", self.source)
    }
}
