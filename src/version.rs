//! Version comparison in the package-definition language's own terms.
//!
//! The orchestrator always asks the [`Evaluator`](crate::traits::Evaluator)
//! for ordering decisions. This module mirrors those semantics locally for
//! collaborators that have no evaluator at hand (the vulnerability database
//! range matcher, in-memory fakes).

use std::cmp::Ordering;

/// Splits off the next version component, skipping `.` and `-` separators.
///
/// A component is either a run of digits or a run of non-separator,
/// non-digit characters.
fn next_component(s: &str) -> (&str, &str) {
    let s = s.trim_start_matches(['.', '-']);
    let Some(first) = s.chars().next() else {
        return ("", "");
    };

    let end = if first.is_ascii_digit() {
        s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len())
    } else {
        s.find(|c: char| c.is_ascii_digit() || c == '.' || c == '-')
            .unwrap_or(s.len())
    };

    (&s[..end], &s[end..])
}

fn component_lt(c1: &str, c2: &str) -> bool {
    let n1 = c1.parse::<u64>().ok();
    let n2 = c2.parse::<u64>().ok();

    match (n1, n2) {
        (Some(a), Some(b)) => a < b,
        _ if c1.is_empty() && n2.is_some() => true,
        _ if c1 == "pre" && c2 != "pre" => true,
        _ if c2 == "pre" => false,
        // `2.3a` sorts before `2.3.1`
        (_, Some(_)) => true,
        (Some(_), _) => false,
        _ => c1 < c2,
    }
}

/// Compares two version strings component by component.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let (mut rest1, mut rest2) = (a, b);

    while !rest1.is_empty() || !rest2.is_empty() {
        let (c1, r1) = next_component(rest1);
        let (c2, r2) = next_component(rest2);

        if component_lt(c1, c2) {
            return Ordering::Less;
        }
        if component_lt(c2, c1) {
            return Ordering::Greater;
        }

        rest1 = r1;
        rest2 = r2;
    }

    Ordering::Equal
}

/// Returns whether `version` falls inside `range`.
///
/// A range is a comma-separated list of constraints such as `>=1.2, <1.4`.
/// An empty range or `*` matches every version. Constraints without an
/// operator are exact matches.
pub fn satisfies(range: &str, version: &str) -> bool {
    let range = range.trim();
    if range.is_empty() || range == "*" {
        return true;
    }

    range.split(',').map(str::trim).all(|constraint| {
        let (op, bound) = split_operator(constraint);
        let ord = compare_versions(version, bound);
        match op {
            "<" => ord == Ordering::Less,
            "<=" => ord != Ordering::Greater,
            ">" => ord == Ordering::Greater,
            ">=" => ord != Ordering::Less,
            _ => ord == Ordering::Equal,
        }
    })
}

fn split_operator(constraint: &str) -> (&str, &str) {
    for op in ["<=", ">=", "<", ">", "="] {
        if let Some(bound) = constraint.strip_prefix(op) {
            return (op, bound.trim());
        }
    }
    ("=", constraint)
}
