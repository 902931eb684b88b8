use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

use crate::error::FetchError;

/// Matches `[tag.]name[@datacenter][~near]`, anchored at both ends.
static CATALOG_SERVICE_QUERY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"\A",
        r"((?P<tag>[[:word:]=:.\-]+)\.)?",
        r"(?P<name>[[:word:]\-]+)",
        r"(@(?P<dc>[[:word:].\-]+))?",
        r"(~(?P<near>[[:word:].\-]+))?",
        r"\z",
    ))
    .expect("catalog service query regex is valid")
});

/// A structured consul catalog query
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ServiceSearch {
    pub name: String,
    pub tag: Option<String>,
    pub datacenter: Option<String>,
    pub near: Option<String>,
}

impl ServiceSearch {
    pub fn parse(query: &str) -> Result<ServiceSearch, FetchError> {
        let captures = CATALOG_SERVICE_QUERY
            .captures(query)
            .ok_or_else(|| FetchError::InvalidQuery(query.to_owned()))?;
        let group = |name: &str| captures.name(name).map(|m| m.as_str().to_owned());
        Ok(ServiceSearch {
            name: group("name").unwrap_or_default(),
            tag: group("tag"),
            datacenter: group("dc"),
            near: group("near"),
        })
    }

    /// Renders the search back into its query form, e.g. `tag.name@dc~near`
    pub fn query(&self) -> String {
        let mut query = String::new();
        if let Some(tag) = &self.tag {
            query.push_str(tag);
            query.push('.');
        }
        query.push_str(&self.name);
        if let Some(dc) = &self.datacenter {
            query.push('@');
            query.push_str(dc);
        }
        if let Some(near) = &self.near {
            query.push('~');
            query.push_str(near);
        }
        query
    }
}

impl fmt::Display for ServiceSearch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "catalog.service({})", self.query())
    }
}
