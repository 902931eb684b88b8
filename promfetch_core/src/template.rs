//! Parameter values for external exporters.
//!
//! A value is either literal text or text containing `{{ .Field }}` placeholders which
//! are evaluated against the route that an external exporter is synthesized from.
//! Supported fields are `ID`, `Node`, `Address`, `Datacenter`, `ServiceID`,
//! `ServiceName`, `ServiceAddress` and `ServicePort`, plus map lookups such as
//! `.ServiceMeta.version`, `.NodeMeta.rack` or `.TaggedAddresses.wan`.

use serde::Deserialize;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::str::FromStr;
use thiserror::Error;

use crate::route::Route;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unterminated placeholder in {0:?}")]
    Unterminated(String),
    #[error("empty placeholder in {0:?}")]
    Empty(String),
    #[error("unknown field {field:?} in {raw:?}")]
    UnknownField { raw: String, field: String },
    #[error("map has no entry for key {key:?} in .{map}")]
    MissingKey { map: &'static str, key: String },
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Field {
    Id,
    Node,
    Address,
    Datacenter,
    ServiceId,
    ServiceName,
    ServiceAddress,
    ServicePort,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Map {
    ServiceMeta,
    NodeMeta,
    TaggedAddresses,
}

impl Map {
    fn name(self) -> &'static str {
        match self {
            Map::ServiceMeta => "ServiceMeta",
            Map::NodeMeta => "NodeMeta",
            Map::TaggedAddresses => "TaggedAddresses",
        }
    }

    fn of(self, route: &Route) -> &HashMap<String, String> {
        match self {
            Map::ServiceMeta => &route.service_meta,
            Map::NodeMeta => &route.node_meta,
            Map::TaggedAddresses => &route.tagged_addresses,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Field(Field),
    Lookup(Map, String),
}

/// A compiled parameter value
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(try_from = "String")]
pub struct ValueTemplate {
    raw: String,
    segments: Vec<Segment>,
}

impl ValueTemplate {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    /// Evaluates the template against a route
    pub fn resolve(&self, route: &Route) -> Result<String, TemplateError> {
        let mut out = String::with_capacity(self.raw.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Field(field) => match field {
                    Field::Id => out.push_str(&route.id),
                    Field::Node => out.push_str(&route.node),
                    Field::Address => out.push_str(&route.address),
                    Field::Datacenter => out.push_str(&route.datacenter),
                    Field::ServiceId => out.push_str(&route.service_id),
                    Field::ServiceName => out.push_str(&route.service_name),
                    Field::ServiceAddress => out.push_str(&route.service_address),
                    Field::ServicePort => out.push_str(&route.service_port.to_string()),
                },
                Segment::Lookup(map, key) => {
                    let value = map.of(route).get(key).ok_or_else(|| TemplateError::MissingKey {
                        map: map.name(),
                        key: key.clone(),
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

impl FromStr for ValueTemplate {
    type Err = TemplateError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut segments = Vec::new();
        let mut tail = raw;
        while let Some(start) = tail.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(tail[..start].to_owned()));
            }
            let rest = &tail[start + 2..];
            let end = rest
                .find("}}")
                .ok_or_else(|| TemplateError::Unterminated(raw.to_owned()))?;
            segments.push(parse_placeholder(raw, rest[..end].trim())?);
            tail = &rest[end + 2..];
        }
        if !tail.is_empty() {
            segments.push(Segment::Literal(tail.to_owned()));
        }
        Ok(ValueTemplate {
            raw: raw.to_owned(),
            segments,
        })
    }
}

impl TryFrom<String> for ValueTemplate {
    type Error = TemplateError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

fn parse_placeholder(raw: &str, action: &str) -> Result<Segment, TemplateError> {
    if action.is_empty() {
        return Err(TemplateError::Empty(raw.to_owned()));
    }
    let unknown = || TemplateError::UnknownField {
        raw: raw.to_owned(),
        field: action.to_owned(),
    };
    let path = action.strip_prefix('.').ok_or_else(unknown)?;
    let mut parts = path.splitn(2, '.');
    let name = parts.next().unwrap_or("");
    let key = parts.next();
    let field = match name {
        "ID" => Field::Id,
        "Node" => Field::Node,
        "Address" => Field::Address,
        "Datacenter" => Field::Datacenter,
        "ServiceID" => Field::ServiceId,
        "ServiceName" => Field::ServiceName,
        "ServiceAddress" => Field::ServiceAddress,
        "ServicePort" => Field::ServicePort,
        "ServiceMeta" | "NodeMeta" | "TaggedAddresses" => {
            let map = match name {
                "ServiceMeta" => Map::ServiceMeta,
                "NodeMeta" => Map::NodeMeta,
                _ => Map::TaggedAddresses,
            };
            return match key {
                Some(key) if !key.is_empty() => Ok(Segment::Lookup(map, key.to_owned())),
                _ => Err(unknown()),
            };
        }
        _ => return Err(unknown()),
    };
    if key.is_some() {
        return Err(unknown());
    }
    Ok(Segment::Field(field))
}
