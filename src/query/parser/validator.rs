use thiserror::Error;
use std::collections::HashSet;

use super::ast::{Expr, FunctionCall, SelectStatement};
use super::lexer::format_duration;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Invalid argument count for function {0}: expected {1}, got {2}")]
    InvalidArgumentCount(String, usize, usize),
    #[error("Invalid argument type for function {0}: {1}")]
    InvalidArgumentType(String, String),
    #[error("Continuous query must have an INTO clause")]
    MissingInto,
    #[error("Continuous query must be an aggregate query")]
    NotAggregate,
    #[error("Mixing aggregate and non-aggregate fields is not allowed: {0}")]
    MixedAggregate(String),
    #[error("Continuous query must have a GROUP BY time() clause")]
    MissingGroupByTime,
    #[error("Resample {0} duration must be non-negative")]
    NegativeResample(&'static str),
    #[error("FOR duration must be >= GROUP BY time duration: must be a minimum of {0}, got {1}")]
    ForShorterThanInterval(String, String),
    #[error("FOR duration must be >= EVERY duration: must be a minimum of {0}, got {1}")]
    ForShorterThanEvery(String, String),
}

/// Registry of the aggregate and selector functions a continuous query may use
pub struct FunctionRegistry {
    functions: HashSet<String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        let functions = [
            "count", "distinct", "integral", "mean", "median", "mode", "spread", "stddev", "sum",
            "first", "last", "max", "min", "percentile", "sample", "top", "bottom",
        ]
        .iter()
        .map(|f| f.to_string())
        .collect();

        Self { functions }
    }

    pub fn is_aggregate(&self, name: &str) -> bool {
        self.functions.contains(&name.to_lowercase())
    }

    pub fn validate_function(&self, name: &str) -> Result<(), ValidationError> {
        if !self.is_aggregate(name) {
            return Err(ValidationError::UnknownFunction(name.to_string()));
        }
        Ok(())
    }

    pub fn validate_arguments(&self, call: &FunctionCall) -> Result<(), ValidationError> {
        self.validate_function(&call.name)?;

        let name = call.name.to_lowercase();
        match name.as_str() {
            "percentile" | "sample" => {
                if call.args.len() != 2 {
                    return Err(ValidationError::InvalidArgumentCount(
                        call.name.clone(),
                        2,
                        call.args.len(),
                    ));
                }
                if let Expr::Number(_) = &call.args[1] {
                    Ok(())
                } else {
                    Err(ValidationError::InvalidArgumentType(
                        call.name.clone(),
                        "Second argument must be a number".to_string(),
                    ))
                }
            }
            "top" | "bottom" => {
                if call.args.len() < 2 {
                    return Err(ValidationError::InvalidArgumentCount(
                        call.name.clone(),
                        2,
                        call.args.len(),
                    ));
                }
                Ok(())
            }
            "integral" => {
                if call.args.is_empty() || call.args.len() > 2 {
                    return Err(ValidationError::InvalidArgumentCount(
                        call.name.clone(),
                        1,
                        call.args.len(),
                    ));
                }
                Ok(())
            }
            _ => {
                if call.args.len() != 1 {
                    return Err(ValidationError::InvalidArgumentCount(
                        call.name.clone(),
                        1,
                        call.args.len(),
                    ));
                }
                Ok(())
            }
        }
    }
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Checks the rules a SELECT statement must satisfy to run as a continuous query.
pub struct ContinuousQueryValidator {
    function_registry: FunctionRegistry,
}

impl ContinuousQueryValidator {
    pub fn new() -> Self {
        Self {
            function_registry: FunctionRegistry::new(),
        }
    }

    pub fn validate(&self, stmt: &SelectStatement) -> Result<(), ValidationError> {
        if stmt.into.is_none() {
            return Err(ValidationError::MissingInto);
        }

        let mut aggregated = 0;
        let mut raw = Vec::new();
        for field in &stmt.fields {
            if self.contains_aggregate(&field.expr)? {
                aggregated += 1;
            } else if !matches!(field.expr, Expr::Number(_) | Expr::String(_)) {
                raw.push(field.expr.to_string());
            }
        }

        if aggregated == 0 {
            return Err(ValidationError::NotAggregate);
        }
        if let Some(field) = raw.into_iter().next() {
            return Err(ValidationError::MixedAggregate(field));
        }

        if stmt.group_by_interval().is_none() {
            return Err(ValidationError::MissingGroupByTime);
        }

        Ok(())
    }

    /// Validates an explicit RESAMPLE clause against the GROUP BY interval.
    pub fn validate_resample(
        &self,
        interval: i64,
        every: Option<i64>,
        for_: Option<i64>,
    ) -> Result<(), ValidationError> {
        if every.map(|e| e < 0).unwrap_or(false) {
            return Err(ValidationError::NegativeResample("EVERY"));
        }
        if for_.map(|f| f < 0).unwrap_or(false) {
            return Err(ValidationError::NegativeResample("FOR"));
        }

        if let Some(for_) = for_.filter(|f| *f > 0) {
            if let Some(every) = every.filter(|e| *e > 0) {
                if for_ < every {
                    return Err(ValidationError::ForShorterThanEvery(
                        format_duration(every),
                        format_duration(for_),
                    ));
                }
            }
            if for_ < interval {
                return Err(ValidationError::ForShorterThanInterval(
                    format_duration(interval),
                    format_duration(for_),
                ));
            }
        }

        Ok(())
    }

    /// Returns true if the expression contains at least one aggregate call.
    /// Calls to unknown functions are rejected.
    fn contains_aggregate(&self, expr: &Expr) -> Result<bool, ValidationError> {
        match expr {
            Expr::Call(call) => {
                self.function_registry.validate_arguments(call)?;
                Ok(true)
            }
            Expr::Binary { lhs, rhs, .. } => {
                let left = self.contains_aggregate(lhs)?;
                let right = self.contains_aggregate(rhs)?;
                Ok(left || right)
            }
            Expr::Paren(inner) => self.contains_aggregate(inner),
            _ => Ok(false),
        }
    }
}

impl Default for ContinuousQueryValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::parser::{parse_statement, Statement};

    fn select(input: &str) -> SelectStatement {
        match parse_statement(input).unwrap() {
            Statement::Select(stmt) => stmt,
            other => panic!("Expected SELECT, got {:?}", other),
        }
    }

    #[test]
    fn test_valid_query() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT mean(value) INTO cpu_mean FROM cpu GROUP BY time(1m)");
        assert!(validator.validate(&stmt).is_ok());

        let stmt = select("SELECT count(cpu) INTO cpu_count FROM cpu WHERE time > now() - 1h GROUP BY time(1s)");
        assert!(validator.validate(&stmt).is_ok());

        let stmt = select("SELECT max(value) - min(value) AS spread INTO cpu_range FROM cpu GROUP BY time(1m), host");
        assert!(validator.validate(&stmt).is_ok());
    }

    #[test]
    fn test_missing_into() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT * FROM cpu");
        assert_eq!(validator.validate(&stmt), Err(ValidationError::MissingInto));
    }

    #[test]
    fn test_group_by_requires_aggregate() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT value INTO other_value FROM cpu WHERE time > now() - 1h GROUP BY time(1s)");
        assert_eq!(validator.validate(&stmt), Err(ValidationError::NotAggregate));
    }

    #[test]
    fn test_mixed_fields() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT mean(value), host INTO m FROM cpu GROUP BY time(1m)");
        assert!(matches!(
            validator.validate(&stmt),
            Err(ValidationError::MixedAggregate(_))
        ));
    }

    #[test]
    fn test_missing_group_by_time() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT mean(value) INTO m FROM cpu GROUP BY host");
        assert_eq!(validator.validate(&stmt), Err(ValidationError::MissingGroupByTime));
    }

    #[test]
    fn test_unknown_function() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT unknown_func(value) INTO m FROM cpu GROUP BY time(1m)");
        assert!(matches!(
            validator.validate(&stmt),
            Err(ValidationError::UnknownFunction(_))
        ));
    }

    #[test]
    fn test_invalid_argument_count() {
        let validator = ContinuousQueryValidator::new();
        let stmt = select("SELECT mean(value, count) INTO m FROM cpu GROUP BY time(1m)");
        assert!(matches!(
            validator.validate(&stmt),
            Err(ValidationError::InvalidArgumentCount(_, 1, 2))
        ));

        let stmt = select("SELECT percentile(value, 'p95') INTO m FROM cpu GROUP BY time(1m)");
        assert!(matches!(
            validator.validate(&stmt),
            Err(ValidationError::InvalidArgumentType(_, _))
        ));
    }

    #[test]
    fn test_resample_bounds() {
        let validator = ContinuousQueryValidator::new();
        let minute = 60_000_000_000;
        assert!(validator.validate_resample(minute, Some(10_000_000_000), Some(2 * minute)).is_ok());
        assert!(validator.validate_resample(minute, None, None).is_ok());
        assert!(matches!(
            validator.validate_resample(minute, None, Some(30_000_000_000)),
            Err(ValidationError::ForShorterThanInterval(_, _))
        ));
        assert!(matches!(
            validator.validate_resample(minute, Some(5 * minute), Some(2 * minute)),
            Err(ValidationError::ForShorterThanEvery(_, _))
        ));
        assert_eq!(
            validator.validate_resample(minute, Some(-1), None),
            Err(ValidationError::NegativeResample("EVERY"))
        );
    }
}
