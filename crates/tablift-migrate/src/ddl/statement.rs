//! Statement splitting and table identifier extraction

use std::fmt;

use serde::Serialize;

use super::lexer::{Token, TokenCursor, TokenKind, significant_tokens, tokenize};

/// A table or column name as written in the DDL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Identifier {
    /// Name without quotes, case as written
    pub value: String,
    /// Whether the name was quoted
    pub quoted: bool,
}

impl Identifier {
    pub fn unquoted(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            quoted: false,
        }
    }

    pub fn quoted(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            quoted: true,
        }
    }

    /// Build an identifier from a `Word` or `QuotedIdent` token.
    pub fn from_token(token: &Token, src: &str) -> Option<Self> {
        let text = token.text(src);
        match token.kind {
            TokenKind::Word => Some(Self::unquoted(text)),
            TokenKind::QuotedIdent => {
                let (close, escape) = match text.chars().next()? {
                    '"' => ('"', Some("\"\"")),
                    '`' => ('`', Some("``")),
                    _ => (']', None),
                };
                let inner = &text[1..];
                let inner = inner.strip_suffix(close).unwrap_or(inner);
                let value = match escape {
                    Some(doubled) => inner.replace(doubled, &close.to_string()),
                    None => inner.to_string(),
                };
                Some(Self::quoted(value))
            }
            _ => None,
        }
    }

    /// The name the database stores: quoted names verbatim, unquoted names
    /// folded to lower case.
    pub fn sql_name(&self) -> String {
        if self.quoted {
            self.value.clone()
        } else {
            self.value.to_lowercase()
        }
    }

    /// Table names compare case-insensitively.
    pub fn same_name(&self, other: &Identifier) -> bool {
        self.sql_name().to_lowercase() == other.sql_name().to_lowercase()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.value)
    }
}

/// Statement classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementKind {
    CreateTable,
    /// `ALTER TABLE … ADD [CONSTRAINT n] FOREIGN KEY …`
    AddForeignKey,
    Other,
}

/// One `;`-delimited unit of schema text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Statement {
    /// Statement text, trimmed, without the terminating `;`
    pub text: String,
    /// Declared table, for CREATE TABLE statements
    pub table: Option<Identifier>,
    pub kind: StatementKind,
}

impl Statement {
    /// Classify `text` as a statement.
    pub fn new(text: impl Into<String>) -> Self {
        let text = text.into().trim().to_string();
        let tokens = significant_tokens(&text);

        let mut cursor = TokenCursor::new(&text, &tokens);
        if let Some(table) = parse_create_table_header(&mut cursor) {
            return Self {
                text,
                table: Some(table),
                kind: StatementKind::CreateTable,
            };
        }

        let mut cursor = TokenCursor::new(&text, &tokens);
        let kind = if parse_alter_table_header(&mut cursor).is_some() && at_add_foreign_key(&cursor)
        {
            StatementKind::AddForeignKey
        } else {
            StatementKind::Other
        };

        Self {
            text,
            table: None,
            kind,
        }
    }

    pub fn is_create_table(&self) -> bool {
        self.kind == StatementKind::CreateTable
    }
}

/// Remove markdown fence lines (```` ```sql ````, ```` ``` ````) and trim.
pub fn clean_schema_text(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Split schema text on top-level semicolons.
///
/// Fragments holding nothing but whitespace and comments are dropped. A final
/// statement without a terminating semicolon is still returned.
pub fn split_statements(text: &str) -> Vec<Statement> {
    let mut statements = Vec::new();
    let mut segment_start = 0;
    let mut has_content = false;

    for token in tokenize(text) {
        match token.kind {
            TokenKind::Semicolon => {
                if has_content {
                    statements.push(Statement::new(&text[segment_start..token.start]));
                }
                segment_start = token.end;
                has_content = false;
            }
            _ if token.is_trivia() => {}
            _ => has_content = true,
        }
    }

    if has_content {
        statements.push(Statement::new(&text[segment_start..]));
    }

    statements
}

/// Tables declared by CREATE TABLE statements, in declaration order.
///
/// A table declared twice is listed once, at its first position.
pub fn declared_tables(statements: &[Statement]) -> Vec<Identifier> {
    let mut tables: Vec<Identifier> = Vec::new();
    for table in statements
        .iter()
        .filter(|s| s.is_create_table())
        .filter_map(|s| s.table.as_ref())
    {
        if !tables.iter().any(|t| t.same_name(table)) {
            tables.push(table.clone());
        }
    }
    tables
}

/// `CREATE [TEMP|TEMPORARY|UNLOGGED] TABLE [IF NOT EXISTS] [schema.]name`
pub(crate) fn parse_create_table_header(cursor: &mut TokenCursor<'_>) -> Option<Identifier> {
    if !cursor.eat_keyword("CREATE") {
        return None;
    }
    for modifier in ["TEMP", "TEMPORARY", "UNLOGGED"] {
        if cursor.eat_keyword(modifier) {
            break;
        }
    }
    if !cursor.eat_keyword("TABLE") {
        return None;
    }
    cursor.eat_keywords(&["IF", "NOT", "EXISTS"]);
    parse_qualified_name(cursor)
}

/// `ALTER TABLE [IF EXISTS] [ONLY] [schema.]name`
pub(crate) fn parse_alter_table_header(cursor: &mut TokenCursor<'_>) -> Option<Identifier> {
    if !cursor.eat_keywords(&["ALTER", "TABLE"]) {
        return None;
    }
    cursor.eat_keywords(&["IF", "EXISTS"]);
    cursor.eat_keyword("ONLY");
    parse_qualified_name(cursor)
}

/// Whether the cursor sits on `ADD [CONSTRAINT name] FOREIGN KEY`
fn at_add_foreign_key(cursor: &TokenCursor<'_>) -> bool {
    if !cursor.peek_keyword("ADD") {
        return false;
    }
    let offset = if cursor.peek_nth_keyword(1, "CONSTRAINT") { 3 } else { 1 };
    cursor.peek_nth_keyword(offset, "FOREIGN") && cursor.peek_nth_keyword(offset + 1, "KEY")
}

/// A possibly schema-qualified name; the last part is returned.
pub(crate) fn parse_qualified_name(cursor: &mut TokenCursor<'_>) -> Option<Identifier> {
    let mut name = parse_identifier(cursor)?;
    while cursor.eat_kind(TokenKind::Dot) {
        name = parse_identifier(cursor)?;
    }
    Some(name)
}

pub(crate) fn parse_identifier(cursor: &mut TokenCursor<'_>) -> Option<Identifier> {
    let src = cursor.src();
    let token = cursor.peek()?;
    let identifier = Identifier::from_token(token, src)?;
    cursor.advance();
    Some(identifier)
}
