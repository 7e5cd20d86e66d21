//! Parsed, validated continuous query definitions.

use thiserror::Error;

use crate::cluster::meta::ContinuousQueryInfo;
use crate::query::parser::{
    parse_statement, ContinuousQueryValidator, IntoClause, Measurement, ParseError,
    SelectStatement, Statement, ValidationError,
};

use super::CqId;

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("failed to parse continuous query: {0}")]
    Parse(#[from] ParseError),
    #[error("invalid continuous query: {0}")]
    Invalid(#[from] ValidationError),
    #[error("continuous query {name} is declared on database {declared}, stored under {stored}")]
    DatabaseMismatch {
        name: String,
        declared: String,
        stored: String,
    },
}

/// How often a continuous query is checked and how far back each check reaches.
/// Both durations are in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResamplePolicy {
    pub every: i64,
    pub for_: i64,
}

impl ResamplePolicy {
    /// Applies the defaults: EVERY falls back to the GROUP BY interval and FOR
    /// falls back to EVERY. Zero counts as unset.
    pub fn resolve(interval: i64, every: Option<i64>, for_: Option<i64>) -> Self {
        let every = every.filter(|e| *e > 0).unwrap_or(interval);
        let for_ = for_.filter(|f| *f > 0).unwrap_or(every);
        Self { every, for_ }
    }
}

#[derive(Debug, Clone)]
pub struct ContinuousQueryDefinition {
    pub database: String,
    pub name: String,
    /// Raw query text as stored in the metadata store
    pub query: String,
    /// The inner SELECT ... INTO statement
    pub statement: SelectStatement,
    /// GROUP BY time() interval in nanoseconds
    pub interval: i64,
    /// GROUP BY time() offset in nanoseconds, normalized into `[0, interval)`
    pub offset: i64,
    pub resample: ResamplePolicy,
}

impl ContinuousQueryDefinition {
    /// Parses and validates a stored continuous query. Accepts either a full
    /// `CREATE CONTINUOUS QUERY` statement or a bare `SELECT ... INTO`.
    pub fn parse(database: &str, info: &ContinuousQueryInfo) -> Result<Self, DefinitionError> {
        let (statement, every, for_) = match parse_statement(&info.query)? {
            Statement::CreateContinuousQuery(create) => {
                if create.database != database {
                    return Err(DefinitionError::DatabaseMismatch {
                        name: info.name.clone(),
                        declared: create.database,
                        stored: database.to_string(),
                    });
                }
                (create.source, create.resample_every, create.resample_for)
            }
            Statement::Select(select) => (select, None, None),
        };

        let validator = ContinuousQueryValidator::new();
        validator.validate(&statement)?;

        // validate() guarantees a GROUP BY time() interval
        let interval = statement
            .group_by_interval()
            .ok_or(ValidationError::MissingGroupByTime)?;
        validator.validate_resample(interval, every, for_)?;

        Ok(Self {
            database: database.to_string(),
            name: info.name.clone(),
            query: info.query.clone(),
            offset: statement.group_by_offset().rem_euclid(interval),
            interval,
            resample: ResamplePolicy::resolve(interval, every, for_),
            statement,
        })
    }

    pub fn id(&self) -> CqId {
        CqId::new(&self.database, &self.name)
    }

    pub fn sources(&self) -> &[Measurement] {
        &self.statement.sources
    }

    pub fn destination(&self) -> Option<&IntoClause> {
        self.statement.into.as_ref()
    }
}
