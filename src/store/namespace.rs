use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::sampling::SamplingError;

/// Fully-qualified collection identifier
///
/// The first `.` separates the database from the collection; any later dots
/// belong to the collection name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespace {
    pub database: String,
    pub collection: Option<String>,
}

impl Namespace {
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: Some(collection.into()),
        }
    }

    /// Parse `db` or `db.collection`
    pub fn parse(ns: &str) -> Result<Self, SamplingError> {
        let (database, collection) = match ns.split_once('.') {
            Some((db, coll)) => (db, Some(coll)),
            None => (ns, None),
        };
        if database.is_empty() {
            return Err(SamplingError::InvalidNamespace(ns.to_string()));
        }
        Ok(Self {
            database: database.to_string(),
            collection: collection.filter(|c| !c.is_empty()).map(str::to_string),
        })
    }

    /// True when the namespace names a collection, not just a database
    pub fn has_collection(&self) -> bool {
        self.collection.is_some()
    }
}

impl FromStr for Namespace {
    type Err = SamplingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.collection {
            Some(collection) => write!(f, "{}.{}", self.database, collection),
            None => f.write_str(&self.database),
        }
    }
}
