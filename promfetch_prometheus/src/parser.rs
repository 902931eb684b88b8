use thiserror::Error;

use crate::{MetricFamilies, MetricFamily, MetricSample, MetricType, SampleValue};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("text format parsing error in line {line}: {reason}")]
    InvalidLine { line: usize, reason: &'static str },
    #[error("text format parsing error in line {line}: unknown metric type {type_:?}")]
    UnknownType { line: usize, type_: String },
    #[error("text format parsing error: body is not valid utf-8")]
    NotUtf8,
}

/// A parser for Prometheus's text exposition format.
///
/// Samples are grouped into families: `_bucket`, `_sum` and `_count` lines join a
/// family declared as a histogram (`_sum` and `_count` also join a summary), and
/// samples without a declared type form an `untyped` family of their own name.
/// Any malformed line fails the whole input.
pub fn parse(input: &str) -> Result<MetricFamilies, ParseError> {
    let mut families = MetricFamilies::new();
    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let invalid = |reason: &'static str| ParseError::InvalidLine {
            line: line_no,
            reason,
        };

        // The line is empty
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        // The line is a comment, or defines a metric's help text or type
        if let Some(comment) = line.strip_prefix('#') {
            let mut parts = comment
                .trim_start()
                .splitn(3, |ch: char| ch == ' ' || ch == '\t');
            match parts.next() {
                Some("HELP") => {
                    let name = parts
                        .next()
                        .filter(|name| valid_metric_name(name))
                        .ok_or_else(|| invalid("invalid metric name in HELP line"))?;
                    let help = unescape_help(parts.next().unwrap_or(""));
                    family_entry(&mut families, name).help = Some(help);
                }
                Some("TYPE") => {
                    let name = parts
                        .next()
                        .filter(|name| valid_metric_name(name))
                        .ok_or_else(|| invalid("invalid metric name in TYPE line"))?;
                    let type_str = parts.next().unwrap_or("").trim();
                    let type_ = type_str.parse().map_err(|_| ParseError::UnknownType {
                        line: line_no,
                        type_: type_str.to_owned(),
                    })?;
                    let family = family_entry(&mut families, name);
                    if !family.samples.is_empty() {
                        return Err(invalid("TYPE line after samples of the same family"));
                    }
                    family.type_ = type_;
                }
                _ => (),
            }
            continue;
        }

        // The line contains data
        let sample = parse_sample(line).map_err(invalid)?;
        let name = family_name(&families, &sample.name).to_owned();
        family_entry(&mut families, &name).samples.push(sample);
    }

    // Families that only had HELP or TYPE lines carry no data
    families.retain(|_, family| !family.samples.is_empty());
    Ok(families)
}

/// Parses a raw response body, rejecting bodies which aren't utf-8.
pub fn parse_bytes(input: &[u8]) -> Result<MetricFamilies, ParseError> {
    let input = std::str::from_utf8(input).map_err(|_| ParseError::NotUtf8)?;
    parse(input)
}

fn family_entry<'f>(families: &'f mut MetricFamilies, name: &str) -> &'f mut MetricFamily {
    families
        .entry(name.to_owned())
        .or_insert_with(|| MetricFamily::new(name, MetricType::Untyped))
}

fn family_name<'a>(families: &MetricFamilies, sample_name: &'a str) -> &'a str {
    if families.contains_key(sample_name) {
        return sample_name;
    }
    for &(suffix, histogram_only) in &[("_bucket", true), ("_sum", false), ("_count", false)] {
        if let Some(base) = sample_name.strip_suffix(suffix) {
            match families.get(base).map(|family| family.type_) {
                Some(MetricType::Histogram) => return base,
                Some(MetricType::Summary) if !histogram_only => return base,
                _ => (),
            }
        }
    }
    sample_name
}

fn parse_sample(line: &str) -> Result<MetricSample, &'static str> {
    // Split `metric_name{labels} value timestamp` into parts
    let name_len = line
        .find(|ch: char| !is_metric_name_char(ch))
        .unwrap_or_else(|| line.len());
    let (name, mut tail) = line.split_at(name_len);
    if !valid_metric_name(name) {
        return Err("invalid metric name");
    }
    let mut labels = Vec::new();
    if let Some(labels_str) = tail.strip_prefix('{') {
        tail = parse_labels(labels_str, &mut labels)?;
    }

    if !tail.starts_with(|ch: char| ch.is_whitespace()) {
        return Err("expected whitespace before the sample value");
    }
    let mut parts = tail.split_whitespace();
    let value = parts.next().ok_or("missing sample value")?;
    let value = parse_value(value).ok_or("invalid sample value")?;
    let timestamp = match parts.next() {
        Some(unix_str) => Some(unix_str.parse().map_err(|_| "invalid timestamp")?),
        None => None,
    };
    if parts.next().is_some() {
        return Err("unexpected text after timestamp");
    }

    Ok(MetricSample {
        name: name.to_owned(),
        labels,
        value,
        timestamp,
    })
}

/// Parses `label1="value1",label2="value2"}` and returns what follows the closing brace.
fn parse_labels<'i>(
    mut tail: &'i str,
    labels: &mut Vec<(String, String)>,
) -> Result<&'i str, &'static str> {
    loop {
        tail = tail.trim_start();
        if let Some(rest) = tail.strip_prefix('}') {
            return Ok(rest);
        }

        // Split first label
        let name_len = tail
            .find(|ch: char| !(ch.is_ascii_alphanumeric() || ch == '_'))
            .unwrap_or_else(|| tail.len());
        let (name, rest) = tail.split_at(name_len);
        if name.is_empty() || name.starts_with(|ch: char| ch.is_ascii_digit()) {
            return Err("invalid label name");
        }
        let rest = rest
            .trim_start()
            .strip_prefix('=')
            .ok_or("expected '=' after label name")?;
        let rest = rest
            .trim_start()
            .strip_prefix('"')
            .ok_or("expected quoted label value")?;
        let (value, rest) = parse_label_value(rest)?;
        if labels.iter().any(|(existing, _)| existing == name) {
            return Err("duplicate label name");
        }
        labels.push((name.to_owned(), value));

        // Advance to next label
        tail = rest.trim_start();
        if let Some(rest) = tail.strip_prefix(',') {
            tail = rest;
        } else if !tail.starts_with('}') {
            return Err("expected ',' or '}' after label value");
        }
    }
}

fn parse_label_value(value: &str) -> Result<(String, &str), &'static str> {
    let mut esc = String::new();
    let mut chars = value.char_indices();
    while let Some((i, ch)) = chars.next() {
        match ch {
            '"' => return Ok((esc, &value[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => esc.push('\n'),
                Some((_, ch)) => esc.push(ch),
                None => break,
            },
            _ => esc.push(ch),
        }
    }
    Err("unterminated label value")
}

fn parse_value(value: &str) -> Option<SampleValue> {
    match value {
        "+Inf" | "Inf" => Some(SampleValue::F64(f64::INFINITY)),
        "-Inf" => Some(SampleValue::F64(f64::NEG_INFINITY)),
        "NaN" => Some(SampleValue::F64(f64::NAN)),
        _ => match value.parse::<i64>() {
            Ok(val) => Some(SampleValue::I64(val)),
            Err(_) => value.parse::<f64>().ok().map(SampleValue::F64),
        },
    }
}

fn unescape_help(help: &str) -> String {
    let mut out = String::with_capacity(help.len());
    let mut chars = help.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some(ch) => out.push(ch),
            None => out.push('\\'),
        }
    }
    out
}

fn is_metric_name_char(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_' || ch == ':'
}

fn valid_metric_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(|ch: char| ch.is_ascii_digit())
        && name.chars().all(is_metric_name_char)
}
