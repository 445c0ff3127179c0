// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

use std::cmp::Ordering;

/// Compares dotted subgraph versions numerically, part by part.
///
/// Non-digit characters are ignored and missing parts count as zero, so
/// `2.3.2`, `2.3.2.0` and `2.3.2-label` are equal. An unknown version is older
/// than any known one.
pub fn compare_versions(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => {
            let a = parts(a);
            let b = parts(b);
            (0..a.len().max(b.len()))
                .map(|i| {
                    let x = a.get(i).copied().unwrap_or(0);
                    let y = b.get(i).copied().unwrap_or(0);
                    x.cmp(&y)
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(Ordering::Equal)
        }
    }
}

fn parts(version: &str) -> Vec<u64> {
    version
        .split('.')
        .map(|part| {
            let digits: String = part.chars().filter(char::is_ascii_digit).collect();
            digits.parse().unwrap_or(0)
        })
        .collect()
}
