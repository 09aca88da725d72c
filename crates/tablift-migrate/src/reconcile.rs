//! Column reconciliation
//!
//! The inferred DDL and the literal CSV header often drift apart: renamed or
//! re-cased columns, duplicate headers, dropped columns. The reconciler maps
//! every header position to a destination column deterministically:
//!
//! 1. equal counts map purely by position
//! 2. otherwise headers are matched by normalized name, each column used once
//! 3. unmatched headers fall back to their normalized name

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static DISAMBIGUATION_SUFFIX_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.\d+$").expect("valid regex"));

/// Destination of one CSV header position
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Column(String),
    /// Blank header; the cells are not loaded
    Unmapped,
}

/// Header position to destination column, in header order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    targets: Vec<ColumnTarget>,
    positional: bool,
}

impl ColumnMapping {
    pub fn targets(&self) -> &[ColumnTarget] {
        &self.targets
    }

    /// Whether the mapping was made by position rather than by name
    pub fn is_positional(&self) -> bool {
        self.positional
    }

    /// `(header index, column name)` for every mapped position
    pub fn mapped(&self) -> impl Iterator<Item = (usize, &str)> {
        self.targets
            .iter()
            .enumerate()
            .filter_map(|(i, target)| match target {
                ColumnTarget::Column(name) => Some((i, name.as_str())),
                ColumnTarget::Unmapped => None,
            })
    }
}

/// Strip a `.N` disambiguation suffix, trim and lower-case.
pub fn normalize_header(header: &str) -> String {
    DISAMBIGUATION_SUFFIX_REGEX
        .replace(header, "")
        .trim()
        .to_lowercase()
}

/// Rename duplicate headers the way pandas does: `x`, `x.1`, `x.2`, …
pub fn disambiguate_headers(raw: &[String]) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    let mut headers = Vec::with_capacity(raw.len());

    for header in raw {
        let mut name = header.clone();
        let mut count = counts.get(&name).copied().unwrap_or(0);
        while count > 0 {
            counts.insert(name.clone(), count + 1);
            name = format!("{}.{}", name, count);
            count = counts.get(&name).copied().unwrap_or(0);
        }
        counts.insert(name.clone(), count + 1);
        headers.push(name);
    }

    headers
}

/// Map CSV headers onto the destination table's columns (physical order).
pub fn reconcile_columns(headers: &[String], columns: &[String]) -> ColumnMapping {
    if headers.len() == columns.len() {
        return ColumnMapping {
            targets: columns.iter().cloned().map(ColumnTarget::Column).collect(),
            positional: true,
        };
    }

    let mut used = vec![false; columns.len()];
    let targets = headers
        .iter()
        .map(|header| {
            if header.trim().is_empty() {
                return ColumnTarget::Unmapped;
            }

            let normalized = normalize_header(header);
            let literal = header.trim().to_lowercase();
            let found = columns.iter().enumerate().position(|(i, column)| {
                let column = column.to_lowercase();
                !used[i] && (column == normalized || column == literal)
            });

            match found {
                Some(i) => {
                    used[i] = true;
                    ColumnTarget::Column(columns[i].clone())
                }
                None => ColumnTarget::Column(normalized),
            }
        })
        .collect();

    ColumnMapping {
        targets,
        positional: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn columns(mapping: &ColumnMapping) -> Vec<Option<&str>> {
        mapping
            .targets()
            .iter()
            .map(|t| match t {
                ColumnTarget::Column(c) => Some(c.as_str()),
                ColumnTarget::Unmapped => None,
            })
            .collect()
    }

    #[test]
    fn test_equal_counts_map_by_position() {
        let mapping = reconcile_columns(&strings(&["A", "B"]), &strings(&["x", "y"]));
        assert!(mapping.is_positional());
        assert_eq!(columns(&mapping), vec![Some("x"), Some("y")]);
    }

    #[test]
    fn test_disambiguated_headers_positional() {
        let mapping =
            reconcile_columns(&strings(&["Code", "Code.2"]), &strings(&["code", "code_2"]));
        assert_eq!(columns(&mapping), vec![Some("code"), Some("code_2")]);
    }

    #[test]
    fn test_name_matching_strips_suffix_case_insensitively() {
        let mapping = reconcile_columns(
            &strings(&["Code", "Code.1", "Name"]),
            &strings(&["name", "code", "CODE_extra", "code"]),
        );
        assert!(!mapping.is_positional());
        // second "code" column is matched by the disambiguated header
        assert_eq!(columns(&mapping), vec![Some("code"), Some("code"), Some("name")]);
    }

    #[test]
    fn test_each_column_used_once() {
        let mapping =
            reconcile_columns(&strings(&["Email", "EMAIL.1"]), &strings(&["email", "a", "b"]));
        // nothing left for the second header, so it falls back to its own name
        assert_eq!(columns(&mapping), vec![Some("email"), Some("email")]);
    }

    #[test]
    fn test_unmatched_header_falls_back_to_normalized_name() {
        let mapping = reconcile_columns(
            &strings(&["ID", " Total Amount ", "Extra.3"]),
            &strings(&["id", "total"]),
        );
        assert_eq!(
            columns(&mapping),
            vec![Some("id"), Some("total amount"), Some("extra")]
        );
    }

    #[test]
    fn test_literal_header_with_dot_digits() {
        let mapping = reconcile_columns(&strings(&["version.2", "x"]), &strings(&["version.2"]));
        assert_eq!(columns(&mapping), vec![Some("version.2"), Some("x")]);
    }

    #[test]
    fn test_blank_headers_are_unmapped() {
        let mapping = reconcile_columns(&strings(&["", "name"]), &strings(&["name", "age", "x"]));
        assert_eq!(columns(&mapping), vec![None, Some("name")]);
        assert_eq!(mapping.mapped().collect::<Vec<_>>(), vec![(1, "name")]);
    }

    #[test]
    fn test_disambiguate_headers() {
        assert_eq!(
            disambiguate_headers(&strings(&["x", "y", "x", "x", "y"])),
            strings(&["x", "y", "x.1", "x.2", "y.1"])
        );
    }

    #[test]
    fn test_disambiguate_avoids_existing_names() {
        assert_eq!(
            disambiguate_headers(&strings(&["a", "a.1", "a"])),
            strings(&["a", "a.1", "a.1.1"])
        );
    }
}
