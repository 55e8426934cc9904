//! Schema introspection: table DDL from the catalog, parsed into columns.

use crate::error::{Error, Result};
use crate::session::Session;
use crate::value::{Params, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlparser::dialect::SQLiteDialect;
use sqlparser::tokenizer::{Token, Tokenizer};
use std::sync::LazyLock;
use tracing::debug;

const CATALOG_SQL: &str =
    "SELECT name, sql FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%';";
const TABLE_INFO_SQL: &str = "SELECT name, type FROM pragma_table_info(?)";

/// Leading keywords of a table constraint.
const TABLE_CONSTRAINTS: &[&str] = &["CONSTRAINT", "PRIMARY", "UNIQUE", "CHECK", "FOREIGN"];
/// Keywords that end a column's type name.
const COLUMN_CONSTRAINTS: &[&str] = &[
    "CONSTRAINT",
    "PRIMARY",
    "NOT",
    "NULL",
    "UNIQUE",
    "CHECK",
    "DEFAULT",
    "COLLATE",
    "REFERENCES",
    "GENERATED",
    "AS",
];

static VIRTUAL_TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)^\s*CREATE\s+VIRTUAL\s+TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?(?P<name>.+?)\s+USING\s+\w+\s*(?:\((?P<args>.*)\))?\s*;?\s*$",
    )
    .expect("virtual table regex")
});
static MODULE_OPTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[A-Za-z_]\w*\s*=").expect("module option regex"));
static UNINDEXED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\s+UNINDEXED\s*$").expect("unindexed regex"));

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    /// Declared type words with their arguments normalized to `name(a, b)`,
    /// e.g. `decimal(5, 2)` for `decimal(5,2)`. `N/A` when no type was declared.
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table: String,
    pub columns: Vec<ColumnSchema>,
}

/// Splits on commas outside parentheses and quotes.
fn split_args(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, ch) in args.char_indices() {
        match (quote, ch) {
            (Some(open), _) if ch == open => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"' | '`') => quote = Some(ch),
            (None, '[') => quote = Some(']'),
            (None, '(') => depth += 1,
            (None, ')') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(&args[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&args[start..]);
    parts
}

/// Rewrites DDL the parser cannot read.
///
/// Virtual tables become plain tables whose columns are the module
/// arguments, minus `key=value` options (tokenizers included) and
/// `UNINDEXED` flags. Returns `None` for a virtual table with no columns.
pub fn sanitize_ddl(sql: &str) -> Option<String> {
    let Some(caps) = VIRTUAL_TABLE.captures(sql) else {
        return Some(sql.to_string());
    };
    let name = caps.name("name").map_or("", |m| m.as_str());
    let args = caps.name("args").map_or("", |m| m.as_str());
    let columns: Vec<String> = split_args(args)
        .into_iter()
        .filter(|arg| !arg.trim().is_empty() && !MODULE_OPTION.is_match(arg))
        .map(|arg| UNINDEXED.replace(arg.trim(), "").into_owned())
        .collect();
    if columns.is_empty() {
        return None;
    }
    Some(format!("CREATE TABLE {name}({})", columns.join(", ")))
}

fn keyword(token: &Token) -> Option<String> {
    match token {
        Token::Word(word) if word.quote_style.is_none() => Some(word.value.to_ascii_uppercase()),
        _ => None,
    }
}

fn is_one_of(token: &Token, keywords: &[&str]) -> bool {
    keyword(token).is_some_and(|kw| keywords.contains(&kw.as_str()))
}

/// Tokens inside the first top-level parentheses, split on top-level commas.
fn column_definitions(tokens: Vec<Token>) -> Option<Vec<Vec<Token>>> {
    let mut tokens = tokens
        .into_iter()
        .filter(|token| !matches!(token, Token::Whitespace(_)));
    tokens.by_ref().find(|token| *token == Token::LParen)?;
    let mut defs = vec![Vec::new()];
    let mut depth = 0usize;
    for token in tokens {
        match token {
            Token::RParen if depth == 0 => return Some(defs),
            Token::RParen => depth -= 1,
            Token::LParen => depth += 1,
            Token::Comma if depth == 0 => {
                defs.push(Vec::new());
                continue;
            }
            _ => {}
        }
        if let Some(def) = defs.last_mut() {
            def.push(token);
        }
    }
    None
}

/// Type words up to the first column constraint, arguments appended as `(a, b)`.
fn declared_type(tokens: &[Token]) -> String {
    let mut kind = String::new();
    let mut iter = tokens.iter();
    while let Some(token) = iter.next() {
        match token {
            Token::LParen => {
                let mut args = vec![String::new()];
                let mut depth = 0usize;
                for token in iter.by_ref() {
                    match token {
                        Token::RParen if depth == 0 => break,
                        Token::RParen => depth -= 1,
                        Token::LParen => depth += 1,
                        Token::Comma if depth == 0 => {
                            args.push(String::new());
                            continue;
                        }
                        _ => {}
                    }
                    if let Some(arg) = args.last_mut() {
                        arg.push_str(&token.to_string());
                    }
                }
                kind.push('(');
                kind.push_str(&args.join(", "));
                kind.push(')');
            }
            _ if is_one_of(token, COLUMN_CONSTRAINTS) => break,
            Token::Word(word) => {
                if !kind.is_empty() {
                    kind.push(' ');
                }
                kind.push_str(&word.value);
            }
            _ => break,
        }
    }
    if kind.is_empty() {
        "N/A".to_string()
    } else {
        kind
    }
}

fn column_from(def: &[Token]) -> Option<ColumnSchema> {
    let (first, rest) = def.split_first()?;
    if is_one_of(first, TABLE_CONSTRAINTS) {
        return None;
    }
    let name = match first {
        Token::Word(word) => word.value.clone(),
        Token::SingleQuotedString(name) | Token::DoubleQuotedString(name) => name.clone(),
        other => other.to_string(),
    };
    Some(ColumnSchema {
        name,
        kind: declared_type(rest),
    })
}

/// Column names and declared types of one `CREATE TABLE` statement.
pub fn parse_columns(sql: &str) -> std::result::Result<Vec<ColumnSchema>, String> {
    let Some(ddl) = sanitize_ddl(sql) else {
        return Ok(Vec::new());
    };
    let tokens = Tokenizer::new(&SQLiteDialect {}, &ddl)
        .tokenize()
        .map_err(|err| err.to_string())?;
    let defs = column_definitions(tokens).ok_or_else(|| "not a table definition".to_string())?;
    Ok(defs.iter().filter_map(|def| column_from(def)).collect())
}

/// Columns as SQLite itself reports them.
fn table_info(session: &mut Session, table: &str) -> Result<Vec<ColumnSchema>> {
    let params = Params::Positional(vec![Value::Text(table.to_string())]);
    let results = session.exec(TABLE_INFO_SQL, Some(&params))?;
    let Some(info) = results.first() else {
        return Ok(Vec::new());
    };
    let (Some(names), Some(kinds)) = (info.column("name"), info.column("type")) else {
        return Ok(Vec::new());
    };
    Ok(names
        .iter()
        .zip(kinds)
        .map(|(name, kind)| ColumnSchema {
            name: name.as_str().unwrap_or_default().to_string(),
            kind: match kind.as_str() {
                Some(kind) if !kind.trim().is_empty() => kind.to_string(),
                _ => "N/A".to_string(),
            },
        })
        .collect())
}

/// Columns of one table: parsed from its DDL, or from `pragma_table_info`
/// when the DDL cannot be read.
fn table_columns(session: &mut Session, table: &str, ddl: &str) -> Result<Vec<ColumnSchema>> {
    match parse_columns(ddl) {
        Ok(columns) => Ok(columns),
        Err(message) => {
            debug!(table, %message, "unreadable table DDL, asking SQLite for columns");
            table_info(session, table).map_err(|err| Error::Schema {
                table: table.to_string(),
                message: err.to_string(),
            })
        }
    }
}

/// Every user table with its columns, in catalog order.
pub fn introspect(session: &mut Session) -> Result<Vec<TableSchema>> {
    let results = session.exec(CATALOG_SQL, None)?;
    let Some(catalog) = results.first() else {
        return Ok(Vec::new());
    };
    let (Some(names), Some(ddls)) = (catalog.column("name"), catalog.column("sql")) else {
        return Ok(Vec::new());
    };
    let mut tables = Vec::with_capacity(names.len());
    for (table, ddl) in names
        .iter()
        .zip(ddls)
        .filter_map(|(name, ddl)| Some((name.as_str()?, ddl.as_str()?)))
    {
        tables.push(TableSchema {
            table: table.to_string(),
            columns: table_columns(session, table, ddl)?,
        });
    }
    Ok(tables)
}
