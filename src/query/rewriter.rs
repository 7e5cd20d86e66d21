//! Rewrites a continuous query into a time-bounded SELECT for a single window.

use thiserror::Error;

use crate::continuous::definition::ContinuousQueryDefinition;
use crate::continuous::interval::Window;
use crate::query::parser::ast::{
    quote_ident, BinaryOp, Expr, IntoClause, IntoMeasurement, Measurement, MeasurementName,
    SelectStatement,
};

#[derive(Debug, Error, PartialEq)]
pub enum RewriteError {
    #[error("Continuous query {0} has no INTO clause")]
    MissingInto(String),
    #[error("Continuous query {0} has no source measurement")]
    MissingSource(String),
}

/// A query bound to one window, ready for the engine
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenQuery {
    pub statement: SelectStatement,
    pub window: Window,
    /// Fully qualified destination measurements. Regex sources keep the
    /// `:MEASUREMENT` template for the engine to resolve.
    pub targets: Vec<String>,
}

/// Binds `def` to `window`: replaces any time predicate in WHERE with the window bounds
/// and fills the INTO retention policy from the database default.
pub fn rewrite(
    def: &ContinuousQueryDefinition,
    window: Window,
    default_retention_policy: Option<&str>,
) -> Result<RewrittenQuery, RewriteError> {
    if def.statement.sources.is_empty() {
        return Err(RewriteError::MissingSource(def.name.clone()));
    }

    let mut statement = def.statement.clone();
    statement.condition = Some(bound_condition(statement.condition.take(), window));

    let into = statement
        .into
        .as_mut()
        .ok_or_else(|| RewriteError::MissingInto(def.name.clone()))?;
    if into.retention_policy.is_none() {
        into.retention_policy = default_retention_policy
            .filter(|rp| !rp.is_empty())
            .map(str::to_string);
    }

    let targets = resolve_targets(into, &statement.sources, &def.database);

    Ok(RewrittenQuery {
        statement,
        window,
        targets,
    })
}

fn bound_condition(condition: Option<Expr>, window: Window) -> Expr {
    let range = Expr::binary(
        BinaryOp::And,
        Expr::binary(
            BinaryOp::Gte,
            Expr::Identifier("time".to_string()),
            Expr::Time(window.start),
        ),
        Expr::binary(
            BinaryOp::Lt,
            Expr::Identifier("time".to_string()),
            Expr::Time(window.end),
        ),
    );

    match condition.and_then(strip_time) {
        None => range,
        Some(expr @ Expr::Binary { op: BinaryOp::Or, .. }) => {
            Expr::binary(BinaryOp::And, Expr::Paren(Box::new(expr)), range)
        }
        Some(expr) => Expr::binary(BinaryOp::And, expr, range),
    }
}

/// Drops comparisons on `time` reachable through AND and parentheses.
fn strip_time(expr: Expr) -> Option<Expr> {
    match expr {
        Expr::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        } => match (strip_time(*lhs), strip_time(*rhs)) {
            (Some(lhs), Some(rhs)) => Some(Expr::binary(BinaryOp::And, lhs, rhs)),
            (Some(expr), None) | (None, Some(expr)) => Some(expr),
            (None, None) => None,
        },
        Expr::Paren(inner) => strip_time(*inner).map(|expr| match expr {
            expr @ Expr::Binary { .. } => Expr::Paren(Box::new(expr)),
            expr => expr,
        }),
        Expr::Binary { op, lhs, rhs } => {
            if op.is_comparison() && (lhs.references_time() || rhs.references_time()) {
                None
            } else {
                Some(Expr::Binary { op, lhs, rhs })
            }
        }
        expr => Some(expr),
    }
}

fn resolve_targets(into: &IntoClause, sources: &[Measurement], database: &str) -> Vec<String> {
    let prefix = format!(
        "{}.{}",
        quote_ident(into.database.as_deref().unwrap_or(database)),
        into.retention_policy.as_deref().map(quote_ident).unwrap_or_default()
    );

    let mut targets: Vec<String> = match &into.measurement {
        IntoMeasurement::Literal(name) => vec![format!("{}.{}", prefix, quote_ident(name))],
        IntoMeasurement::Placeholder => sources
            .iter()
            .map(|source| match &source.name {
                MeasurementName::Literal(name) => format!("{}.{}", prefix, quote_ident(name)),
                MeasurementName::Regex(_) => format!("{}.:MEASUREMENT", prefix),
            })
            .collect(),
    };
    targets.dedup();
    targets
}
