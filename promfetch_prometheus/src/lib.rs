//! Prometheus text exposition format: the metric family model, a parser and an encoder.

pub mod encode;
pub mod parser;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use encode::{encode, encode_family};
pub use parser::{parse, ParseError};

/// A set of metric families keyed by family name.
pub type MetricFamilies = BTreeMap<String, MetricFamily>;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum SampleValue {
    F64(f64),
    I64(i64),
}

impl SampleValue {
    pub fn to_f64(&self) -> f64 {
        match *self {
            SampleValue::F64(val) => val,
            SampleValue::I64(val) => val as f64,
        }
    }
}

impl fmt::Display for SampleValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SampleValue::I64(val) => write!(f, "{}", val),
            SampleValue::F64(val) if val.is_nan() => f.write_str("NaN"),
            SampleValue::F64(val) if val == f64::INFINITY => f.write_str("+Inf"),
            SampleValue::F64(val) if val == f64::NEG_INFINITY => f.write_str("-Inf"),
            SampleValue::F64(val) => write!(f, "{}", val),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricType {
    pub fn as_str(&self) -> &str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
            MetricType::Untyped => "untyped",
        }
    }
}

impl FromStr for MetricType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(MetricType::Counter),
            "gauge" => Ok(MetricType::Gauge),
            "histogram" => Ok(MetricType::Histogram),
            "summary" => Ok(MetricType::Summary),
            "untyped" => Ok(MetricType::Untyped),
            _ => Err(()),
        }
    }
}

/// A single measurement of a metric family.
///
/// `name` is the full sample name, which differs from the family name for the
/// `_bucket`, `_sum` and `_count` lines of histograms and summaries.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub name: String,
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
    pub timestamp: Option<i64>,
}

impl MetricSample {
    pub fn new(name: impl Into<String>, value: SampleValue) -> Self {
        MetricSample {
            name: name.into(),
            labels: Vec::new(),
            value,
            timestamp: None,
        }
    }

    /// Returns the value of the label with the given name
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(label, _)| label == name)
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub type_: MetricType,
    pub samples: Vec<MetricSample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, type_: MetricType) -> Self {
        MetricFamily {
            name: name.into(),
            help: None,
            type_,
            samples: Vec::new(),
        }
    }

    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }
}
