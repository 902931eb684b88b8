use std::fmt::Write;

use crate::{MetricFamilies, MetricFamily};

/// Renders metric families in the text exposition format, ordered by family name.
pub fn encode(families: &MetricFamilies) -> String {
    let mut out = String::new();
    for family in families.values() {
        encode_family(&mut out, family);
        out.push('\n');
    }
    out
}

pub fn encode_family(out: &mut String, family: &MetricFamily) {
    // Writing into a `String` cannot fail
    if let Some(help) = &family.help {
        let _ = writeln!(out, "# HELP {} {}", family.name, escape_help(help));
    }
    let _ = writeln!(out, "# TYPE {} {}", family.name, family.type_.as_str());
    for sample in &family.samples {
        out.push_str(&sample.name);
        if !sample.labels.is_empty() {
            out.push('{');
            for (i, (name, value)) in sample.labels.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                let _ = write!(out, "{}=\"{}\"", name, escape_label_value(value));
            }
            out.push('}');
        }
        let _ = write!(out, " {}", sample.value);
        if let Some(timestamp) = sample.timestamp {
            let _ = write!(out, " {}", timestamp);
        }
        out.push('\n');
    }
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('"', "\\\"")
}
