//! Foreign key extraction
//!
//! Foreign keys are cut out of CREATE TABLE bodies so every table can be
//! created regardless of declaration order, then applied after the data is
//! loaded. Both table-level `FOREIGN KEY (…) REFERENCES …` elements and
//! column-level `REFERENCES …` clauses are recognised.

use std::fmt;

use serde::Serialize;
use tablift_core::ForeignKeyDefinition;

use super::lexer::{Token, TokenCursor, TokenKind, significant_tokens};
use super::statement::{
    Identifier, Statement, StatementKind, parse_alter_table_header, parse_create_table_header,
    parse_identifier, parse_qualified_name,
};

/// A foreign key found in the schema text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForeignKeyConstraint {
    /// Constraint name, as the database stores it
    pub name: Option<String>,
    /// Owning (referencing) table
    pub table: Identifier,
    pub columns: Vec<Identifier>,
    pub referenced_table: Identifier,
    /// Empty when the clause names only the table, meaning its primary key
    pub referenced_columns: Vec<Identifier>,
}

impl ForeignKeyConstraint {
    /// The constraint in terms of stored database names
    pub fn to_definition(&self) -> ForeignKeyDefinition {
        ForeignKeyDefinition {
            name: self.name.clone(),
            table: self.table.sql_name(),
            columns: self.columns.iter().map(Identifier::sql_name).collect(),
            referenced_table: self.referenced_table.sql_name(),
            referenced_columns: self
                .referenced_columns
                .iter()
                .map(Identifier::sql_name)
                .collect(),
        }
    }

    /// `table(col, …)`
    pub fn source(&self) -> String {
        format!("{}({})", self.table, join_names(&self.columns))
    }
}

impl fmt::Display for ForeignKeyConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}({})",
            self.source(),
            self.referenced_table,
            join_names(&self.referenced_columns)
        )
    }
}

fn join_names(names: &[Identifier]) -> String {
    names
        .iter()
        .map(|n| n.value.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result of stripping foreign keys from one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyExtraction {
    /// The statement to execute; byte-identical when nothing was stripped
    pub statement: Statement,
    pub constraints: Vec<ForeignKeyConstraint>,
    /// False when a foreign key element was found but could not be parsed
    pub complete: bool,
}

impl ForeignKeyExtraction {
    fn unchanged(statement: &Statement, complete: bool) -> Self {
        Self {
            statement: statement.clone(),
            constraints: Vec::new(),
            complete,
        }
    }
}

/// Extract the foreign keys of a statement.
///
/// CREATE TABLE statements come back rewritten without their foreign key
/// elements. An `ALTER TABLE … ADD FOREIGN KEY` statement is turned into a
/// single constraint. Anything else is returned unchanged.
pub fn extract_foreign_keys(statement: &Statement) -> ForeignKeyExtraction {
    match statement.kind {
        StatementKind::CreateTable => strip_create_table(statement),
        StatementKind::AddForeignKey => parse_alter_add(statement),
        StatementKind::Other => ForeignKeyExtraction::unchanged(statement, true),
    }
}

enum Element {
    Keep(String),
    Stripped(ForeignKeyConstraint),
    Rewritten(String, ForeignKeyConstraint),
    Unparsed(String),
}

fn strip_create_table(statement: &Statement) -> ForeignKeyExtraction {
    let src = statement.text.as_str();
    let tokens = significant_tokens(src);
    let mut cursor = TokenCursor::new(src, &tokens);

    let Some(table) = parse_create_table_header(&mut cursor) else {
        return ForeignKeyExtraction::unchanged(statement, true);
    };
    let open = cursor.position();
    if tokens.get(open).map(|t| t.kind) != Some(TokenKind::LParen) {
        // CREATE TABLE … AS SELECT and friends have no body to strip
        return ForeignKeyExtraction::unchanged(statement, true);
    }
    let Some(close) = matching_paren(&tokens, open) else {
        return ForeignKeyExtraction::unchanged(statement, false);
    };

    let elements: Vec<Element> = split_elements(&tokens[open + 1..close])
        .into_iter()
        .map(|element| classify_element(src, element, &table))
        .collect();

    let changed = elements
        .iter()
        .any(|e| matches!(e, Element::Stripped(_) | Element::Rewritten(..)));
    let complete = !elements.iter().any(|e| matches!(e, Element::Unparsed(_)));
    if !changed {
        return ForeignKeyExtraction::unchanged(statement, complete);
    }

    let mut kept = Vec::new();
    let mut constraints = Vec::new();
    for element in elements {
        match element {
            Element::Keep(text) | Element::Unparsed(text) => kept.push(text),
            Element::Stripped(fk) => constraints.push(fk),
            Element::Rewritten(text, fk) => {
                kept.push(text);
                constraints.push(fk);
            }
        }
    }

    let text = format!(
        "{}\n    {}\n{}",
        &src[..tokens[open].end],
        kept.join(",\n    "),
        &src[tokens[close].start..]
    );

    ForeignKeyExtraction {
        statement: Statement::new(text),
        constraints,
        complete,
    }
}

fn classify_element(src: &str, element: &[Token], table: &Identifier) -> Element {
    let text = span_text(src, element).to_string();
    let mut cursor = TokenCursor::new(src, element);

    let name = if cursor.eat_keyword("CONSTRAINT") {
        match parse_identifier(&mut cursor) {
            Some(name) => Some(name.sql_name()),
            None => return Element::Keep(text),
        }
    } else {
        None
    };

    if cursor.peek_keyword("FOREIGN") {
        return match parse_foreign_key_body(&mut cursor, table, name) {
            Some(fk) if cursor.is_at_end() => Element::Stripped(fk),
            _ => Element::Unparsed(text),
        };
    }

    let is_table_constraint = name.is_some()
        || ["PRIMARY", "UNIQUE", "CHECK", "EXCLUDE", "LIKE"]
            .iter()
            .any(|kw| cursor.peek_keyword(kw));
    if is_table_constraint {
        return Element::Keep(text);
    }

    match strip_column_reference(src, element, table) {
        Some(Ok((rewritten, fk))) => Element::Rewritten(rewritten, fk),
        Some(Err(())) => Element::Unparsed(text),
        None => Element::Keep(text),
    }
}

/// Cut a column-level `[CONSTRAINT n] REFERENCES t [(c)] …` clause out of a
/// column definition. `None` when the column has no reference.
fn strip_column_reference(
    src: &str,
    element: &[Token],
    table: &Identifier,
) -> Option<Result<(String, ForeignKeyConstraint), ()>> {
    let mut cursor = TokenCursor::new(src, element);
    let column = parse_identifier(&mut cursor)?;

    let mut depth = 0usize;
    let references = (cursor.position()..element.len()).find(|&i| {
        match element[i].kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            _ => {}
        }
        depth == 0 && element[i].is_keyword(src, "REFERENCES")
    })?;

    let (cut_start, name) = match references.checked_sub(2) {
        Some(i) if element[i].is_keyword(src, "CONSTRAINT") => (
            i,
            Identifier::from_token(&element[i + 1], src).map(|n| n.sql_name()),
        ),
        _ => (references, None),
    };

    let mut clause = TokenCursor::new(src, &element[references..]);
    let Some((referenced_table, referenced_columns)) = parse_references(&mut clause) else {
        return Some(Err(()));
    };
    if referenced_columns.len() > 1 || !consume_trailing_actions(&mut clause) {
        return Some(Err(()));
    }
    let cut_end = references + clause.position();

    // ends on a token so a trailing line comment cannot swallow what follows
    let before = &src[element[0].start..element[cut_start - 1].end];
    let rewritten = match element.get(cut_end) {
        Some(rest) => format!(
            "{} {}",
            before,
            &src[rest.start..element[element.len() - 1].end]
        ),
        None => before.to_string(),
    };

    Some(Ok((
        rewritten,
        ForeignKeyConstraint {
            name,
            table: table.clone(),
            columns: vec![column],
            referenced_table,
            referenced_columns,
        },
    )))
}

fn parse_alter_add(statement: &Statement) -> ForeignKeyExtraction {
    let src = statement.text.as_str();
    let tokens = significant_tokens(src);
    let mut cursor = TokenCursor::new(src, &tokens);

    match parse_alter_constraint(&mut cursor) {
        Some(fk) => ForeignKeyExtraction {
            statement: statement.clone(),
            constraints: vec![fk],
            complete: true,
        },
        None => ForeignKeyExtraction::unchanged(statement, false),
    }
}

/// `ALTER TABLE t ADD [CONSTRAINT n] FOREIGN KEY … [NOT VALID]`
fn parse_alter_constraint(cursor: &mut TokenCursor<'_>) -> Option<ForeignKeyConstraint> {
    let table = parse_alter_table_header(cursor)?;
    if !cursor.eat_keyword("ADD") {
        return None;
    }
    let name = if cursor.eat_keyword("CONSTRAINT") {
        Some(parse_identifier(cursor)?.sql_name())
    } else {
        None
    };
    let fk = parse_foreign_key_body(cursor, &table, name)?;
    cursor.eat_keywords(&["NOT", "VALID"]);
    cursor.is_at_end().then_some(fk)
}

/// `FOREIGN KEY (c, …) REFERENCES t [(r, …)] [actions]`
fn parse_foreign_key_body(
    cursor: &mut TokenCursor<'_>,
    table: &Identifier,
    name: Option<String>,
) -> Option<ForeignKeyConstraint> {
    if !cursor.eat_keywords(&["FOREIGN", "KEY"]) {
        return None;
    }
    let columns = parse_name_list(cursor)?;
    let (referenced_table, referenced_columns) = parse_references(cursor)?;
    if !consume_trailing_actions(cursor) {
        return None;
    }
    if !referenced_columns.is_empty() && referenced_columns.len() != columns.len() {
        return None;
    }

    Some(ForeignKeyConstraint {
        name,
        table: table.clone(),
        columns,
        referenced_table,
        referenced_columns,
    })
}

/// `REFERENCES t [(c, …)]`
fn parse_references(cursor: &mut TokenCursor<'_>) -> Option<(Identifier, Vec<Identifier>)> {
    if !cursor.eat_keyword("REFERENCES") {
        return None;
    }
    let table = parse_qualified_name(cursor)?;
    let columns = if cursor.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
        parse_name_list(cursor)?
    } else {
        Vec::new()
    };
    Some((table, columns))
}

/// `(a, b, …)` with at least one name
fn parse_name_list(cursor: &mut TokenCursor<'_>) -> Option<Vec<Identifier>> {
    if !cursor.eat_kind(TokenKind::LParen) {
        return None;
    }
    let mut names = vec![parse_identifier(cursor)?];
    while cursor.eat_kind(TokenKind::Comma) {
        names.push(parse_identifier(cursor)?);
    }
    cursor.eat_kind(TokenKind::RParen).then_some(names)
}

/// Consume referential actions and deferral options. Returns false on a
/// malformed clause.
fn consume_trailing_actions(cursor: &mut TokenCursor<'_>) -> bool {
    loop {
        let well_formed = if cursor.peek_keyword("ON")
            && (cursor.peek_nth_keyword(1, "DELETE") || cursor.peek_nth_keyword(1, "UPDATE"))
        {
            cursor.advance();
            cursor.advance();
            consume_action(cursor)
        } else if cursor.eat_keyword("MATCH") {
            cursor.eat_keyword("FULL") || cursor.eat_keyword("PARTIAL") || cursor.eat_keyword("SIMPLE")
        } else if cursor.eat_keywords(&["NOT", "DEFERRABLE"]) || cursor.eat_keyword("DEFERRABLE") {
            true
        } else if cursor.eat_keyword("INITIALLY") {
            cursor.eat_keyword("DEFERRED") || cursor.eat_keyword("IMMEDIATE")
        } else {
            return true;
        };

        if !well_formed {
            return false;
        }
    }
}

fn consume_action(cursor: &mut TokenCursor<'_>) -> bool {
    if cursor.eat_keyword("CASCADE")
        || cursor.eat_keyword("RESTRICT")
        || cursor.eat_keywords(&["NO", "ACTION"])
    {
        return true;
    }
    if cursor.eat_keywords(&["SET", "NULL"]) || cursor.eat_keywords(&["SET", "DEFAULT"]) {
        // PostgreSQL 15 allows a column list after SET NULL / SET DEFAULT
        if cursor.peek().is_some_and(|t| t.kind == TokenKind::LParen) {
            return parse_name_list(cursor).is_some();
        }
        return true;
    }
    false
}

fn matching_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a table body at top-level commas, skipping empty elements.
fn split_elements(body: &[Token]) -> Vec<&[Token]> {
    let mut elements = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, token) in body.iter().enumerate() {
        match token.kind {
            TokenKind::LParen => depth += 1,
            TokenKind::RParen => depth = depth.saturating_sub(1),
            TokenKind::Comma if depth == 0 => {
                if i > start {
                    elements.push(&body[start..i]);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if body.len() > start {
        elements.push(&body[start..]);
    }

    elements
}

fn span_text<'a>(src: &'a str, tokens: &[Token]) -> &'a str {
    match (tokens.first(), tokens.last()) {
        (Some(first), Some(last)) => &src[first.start..last.end],
        _ => "",
    }
}
