//! Table names derived from file names

use std::sync::LazyLock;

use regex::Regex;

use crate::ddl::Identifier;

static EXTENSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\.[A-Za-z0-9]{1,5}$").expect("valid regex"));

static NON_IDENTIFIER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9_]").expect("valid regex"));

/// Normalize a file's display name into a table name.
///
/// `"Sales Q1-2024.csv"` becomes `sales_q1_2024`; a name starting with a
/// digit gets a `t_` prefix.
pub fn table_name_for_file(display_name: &str) -> String {
    let stem = EXTENSION_REGEX.replace(display_name, "");
    let name = NON_IDENTIFIER_REGEX.replace_all(&stem, "_").to_lowercase();

    if name.starts_with(|c: char| c.is_ascii_digit()) {
        format!("t_{}", name)
    } else {
        name
    }
}

/// The table a file loads into: the declared table with the same name,
/// otherwise the normalized file name itself.
pub fn resolve_table(display_name: &str, declared: &[Identifier]) -> String {
    let normalized = table_name_for_file(display_name);
    declared
        .iter()
        .map(Identifier::sql_name)
        .find(|name| name.eq_ignore_ascii_case(&normalized))
        .unwrap_or(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_table_name_for_file() {
        let cases = [
            ("customers.csv", "customers"),
            ("Sales Q1-2024.csv", "sales_q1_2024"),
            ("order-items.tsv", "order_items"),
            ("notes.txt", "notes"),
            ("archive.tar.gz", "archive_tar"),
            ("no_extension", "no_extension"),
            ("weird.extension", "weird_extension"),
            ("2024 results.csv", "t_2024_results"),
            ("café.csv", "caf_"),
        ];
        for (file, expected) in cases {
            assert_eq!(table_name_for_file(file), expected, "{}", file);
        }
    }

    #[test]
    fn test_resolve_table_prefers_declared_name() {
        let declared = vec![
            Identifier::quoted("Customers"),
            Identifier::unquoted("orders"),
        ];
        assert_eq!(resolve_table("customers.csv", &declared), "Customers");
        assert_eq!(resolve_table("ORDERS.csv", &declared), "orders");
        assert_eq!(resolve_table("products.csv", &declared), "products");
    }
}
