//! Statement guard.
//!
//! Lexical checks applied before any statement reaches a backend:
//!
//! - [`validate_query_for`] rejects destructive statements (DROP DATABASE/SCHEMA,
//!   TRUNCATE, DELETE/UPDATE without WHERE, GRANT/REVOKE, user and role
//!   management, SHUTDOWN).
//! - [`enforce_read_only_for`] admits only statements that cannot write.
//! - [`detect_transaction_control`] keeps BEGIN/COMMIT/ROLLBACK out of managed
//!   transactions.
//! - [`sanitize_identifier`] gates names interpolated into introspection SQL.
//!
//! Input is tokenized with the `sqlparser` tokenizer of the target dialect, so
//! comments, string literals and quoted identifiers never hide or split a
//! statement. Text that does not tokenize is rejected. The checks then run on
//! the token stream, not on a parse tree: the WHERE detection only asks
//! whether a `WHERE` keyword follows the DELETE/UPDATE, so
//! `UPDATE t SET c = 1 WHERE id = 1` is never rejected.
//!
//! The dialect-free [`validate_query`] and [`enforce_read_only`] tokenize with
//! every native dialect and reject if any of them objects.

use crate::db::Dialect;
use crate::error::{GatewayError, GatewayResult};
use regex::Regex;
use sqlparser::dialect::{
    GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect,
};
use sqlparser::tokenizer::{Token, Tokenizer, Whitespace};
use std::sync::LazyLock;

/// Maximum accepted identifier length.
pub const MAX_IDENTIFIER_LEN: usize = 128;

static NATIVE_DIALECTS: [Dialect; 4] = [
    Dialect::Postgres,
    Dialect::MySql,
    Dialect::MsSql,
    Dialect::Sqlite,
];

/// Keywords that write when they appear anywhere in a read-only statement.
const EMBEDDED_WRITES: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "INTO", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "GRANT", "REVOKE", "DENY", "EXEC", "EXECUTE", "SHUTDOWN", "KILL", "DBCC", "BACKUP",
    "RESTORE",
];

/// Words after which DELETE/UPDATE names a trigger event or lock mode.
const NON_STATEMENT_PREFIX: &[&str] = &[
    "ON", "FOR", "OF", "OR", "AFTER", "BEFORE", "THEN", "DO", "KEY",
];

/// Type of dangerous SQL operation detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DangerousOperation {
    DropDatabase,
    Truncate,
    DeleteWithoutWhere,
    UpdateWithoutWhere,
    PrivilegeChange,
    UserManagement,
    Shutdown,
}

impl DangerousOperation {
    /// Get the operation name for messages.
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::DropDatabase => "DROP DATABASE/SCHEMA",
            Self::Truncate => "TRUNCATE",
            Self::DeleteWithoutWhere => "DELETE without WHERE",
            Self::UpdateWithoutWhere => "UPDATE without WHERE",
            Self::PrivilegeChange => "GRANT/REVOKE",
            Self::UserManagement => "user or role management",
            Self::Shutdown => "SHUTDOWN/RESTART",
        }
    }

    /// Get the reason why this operation is dangerous.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::DropDatabase => {
                "This will permanently delete the entire database or schema and all its data"
            }
            Self::Truncate => "This will remove all rows from the table",
            Self::DeleteWithoutWhere => "This will delete all rows from the table",
            Self::UpdateWithoutWhere => "This will update all rows in the table",
            Self::PrivilegeChange => "This changes access privileges on the server",
            Self::UserManagement => "This creates, alters or removes server principals",
            Self::Shutdown => "This stops or restarts the database server",
        }
    }

    /// Full human-readable rejection reason.
    pub fn describe(&self) -> String {
        format!("{} blocked: {}", self.operation_name(), self.reason())
    }
}

fn pattern(re: &str) -> Regex {
    Regex::new(re).expect("guard patterns are valid regex literals")
}

static DROP_DATABASE: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)^DROP\s+(DATABASE|SCHEMA)\b"));
static TRUNCATE: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)^TRUNCATE\b"));
static PRIVILEGES: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)^(GRANT|REVOKE)\b"));
static USER_MANAGEMENT: LazyLock<Regex> =
    LazyLock::new(|| pattern(r"(?i)^(CREATE|ALTER|DROP)\s+(USER|ROLE|LOGIN)\b"));
static SHUTDOWN: LazyLock<Regex> = LazyLock::new(|| pattern(r"(?i)^(SHUTDOWN|RESTART)\b"));

static READ_ONLY_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    pattern(r"(?i)^(SELECT|WITH|EXPLAIN|SHOW|DESCRIBE|DESC|PRAGMA)\b|^SET\s+search_path\b")
});

static IDENTIFIER: LazyLock<Regex> = LazyLock::new(|| pattern(r"^[A-Za-z_][A-Za-z0-9_]*$"));

/// Skip leading whitespace, comments and opening parentheses.
fn statement_head(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("").trim_start();
        } else if let Some(after) = rest.strip_prefix('(') {
            rest = after.trim_start();
        } else {
            return rest;
        }
    }
}

/// First keyword of the statement, uppercased. Empty for blank input.
pub fn leading_keyword(sql: &str) -> String {
    statement_head(sql)
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase()
}

/// One statement of a batch after tokenizing.
#[derive(Debug, Default)]
struct Lexed {
    /// Comments collapsed to a space, literals to `''`, quoted names to `_`
    text: String,
    /// Unquoted words, uppercased
    words: Vec<String>,
}

impl Lexed {
    fn finish_into(&mut self, out: &mut Vec<Lexed>) {
        let done = std::mem::take(self);
        let text = done.text.trim();
        if !text.is_empty() {
            out.push(Lexed {
                text: text.to_string(),
                words: done.words,
            });
        }
    }

    fn head(&self) -> &str {
        statement_head(&self.text)
    }
}

fn tokenize(dialect: &Dialect, sql: &str) -> Result<Vec<Token>, String> {
    let tokens = match dialect {
        Dialect::Postgres => Tokenizer::new(&PostgreSqlDialect {}, sql).tokenize(),
        Dialect::MySql => Tokenizer::new(&MySqlDialect {}, sql).tokenize(),
        Dialect::MsSql => Tokenizer::new(&MsSqlDialect {}, sql).tokenize(),
        Dialect::Sqlite => Tokenizer::new(&SQLiteDialect {}, sql).tokenize(),
        Dialect::Unknown(_) => Tokenizer::new(&GenericDialect {}, sql).tokenize(),
    }
    .map_err(|e| e.to_string())?;

    let mut expanded = Vec::with_capacity(tokens.len());
    for token in tokens {
        match token {
            Token::Whitespace(Whitespace::MultiLineComment(body)) => {
                if body.contains("/*") {
                    return Err("nested block comments are not supported".to_string());
                }
                // MySQL executes the body of `/*! ... */`
                match (dialect, body.strip_prefix('!')) {
                    (Dialect::MySql, Some(code)) => {
                        let code = code.trim_start_matches(|c: char| c.is_ascii_digit());
                        expanded.push(Token::Whitespace(Whitespace::Space));
                        expanded.extend(tokenize(dialect, code)?);
                        expanded.push(Token::Whitespace(Whitespace::Space));
                    }
                    _ => expanded.push(Token::Whitespace(Whitespace::Space)),
                }
            }
            other => expanded.push(other),
        }
    }
    Ok(expanded)
}

fn lex_statements(dialect: &Dialect, sql: &str) -> Result<Vec<Lexed>, String> {
    let mut statements = Vec::new();
    let mut current = Lexed::default();
    for token in tokenize(dialect, sql)? {
        match token {
            Token::SemiColon => current.finish_into(&mut statements),
            Token::Whitespace(_) => current.text.push(' '),
            Token::Word(word) if word.quote_style.is_none() => {
                current.text.push_str(&word.value);
                current.words.push(word.value.to_ascii_uppercase());
            }
            Token::Word(_) => current.text.push('_'),
            other => {
                let text = other.to_string();
                if text.chars().any(char::is_alphanumeric) {
                    current.text.push_str("''");
                } else {
                    current.text.push_str(&text);
                }
            }
        }
    }
    current.finish_into(&mut statements);
    Ok(statements)
}

/// Split a batch into its statements the way `dialect` tokenizes it.
///
/// Comments are dropped and literal contents are blanked, so the result is
/// only good for classification, never for execution.
pub fn split_statements(dialect: &Dialect, sql: &str) -> Result<Vec<String>, String> {
    Ok(lex_statements(dialect, sql)?
        .into_iter()
        .map(|statement| statement.text)
        .collect())
}

/// Run `rule` over the statements of `sql` under each applicable tokenizer.
fn check(
    dialect: &Dialect,
    sql: &str,
    rule: impl Fn(&Dialect, &[Lexed]) -> Option<String>,
) -> Option<String> {
    let tokenizers = match dialect {
        Dialect::Unknown(_) => &NATIVE_DIALECTS[..],
        known => std::slice::from_ref(known),
    };
    for tokenizer in tokenizers {
        let statements = match lex_statements(tokenizer, sql) {
            Ok(statements) => statements,
            Err(e) => {
                return Some(format!(
                    "Statement could not be tokenized as {}: {e}",
                    tokenizer.display_name()
                ));
            }
        };
        if statements.is_empty() {
            return Some("Empty SQL statement".to_string());
        }
        if let Some(reason) = rule(tokenizer, &statements) {
            return Some(reason);
        }
    }
    None
}

fn detect_in_statement(dialect: &Dialect, statement: &Lexed) -> Option<DangerousOperation> {
    let head = statement.head();
    if DROP_DATABASE.is_match(head) {
        return Some(DangerousOperation::DropDatabase);
    }
    if TRUNCATE.is_match(head) {
        return Some(DangerousOperation::Truncate);
    }
    if PRIVILEGES.is_match(head) {
        return Some(DangerousOperation::PrivilegeChange);
    }
    if USER_MANAGEMENT.is_match(head) {
        return Some(DangerousOperation::UserManagement);
    }
    if SHUTDOWN.is_match(head) {
        return Some(DangerousOperation::Shutdown);
    }
    scan_words(&statement.words, *dialect == Dialect::MsSql)
}

/// Walk the keywords of one statement.
///
/// A DELETE or UPDATE stays pending until a WHERE follows it, which also
/// catches writes inside CTEs. With `batch` set, every keyword counts wherever
/// it appears, since T-SQL runs several statements without separators.
fn scan_words(words: &[String], batch: bool) -> Option<DangerousOperation> {
    let mut pending = None;
    for (i, word) in words.iter().enumerate() {
        let prev = i.checked_sub(1).map(|p| words[p].as_str());
        let next = words.get(i + 1).map(String::as_str);
        match word.as_str() {
            "WHERE" => pending = None,
            "DELETE" | "UPDATE" if !prev.is_some_and(|p| NON_STATEMENT_PREFIX.contains(&p)) => {
                if pending.is_some() {
                    return pending;
                }
                pending = Some(if word == "DELETE" {
                    DangerousOperation::DeleteWithoutWhere
                } else {
                    DangerousOperation::UpdateWithoutWhere
                });
            }
            _ if !batch => {}
            "TRUNCATE" => return Some(DangerousOperation::Truncate),
            "DROP" if matches!(next, Some("DATABASE" | "SCHEMA")) => {
                return Some(DangerousOperation::DropDatabase);
            }
            "CREATE" | "ALTER" | "DROP" if matches!(next, Some("USER" | "ROLE" | "LOGIN")) => {
                return Some(DangerousOperation::UserManagement);
            }
            "GRANT" | "REVOKE" | "DENY" => return Some(DangerousOperation::PrivilegeChange),
            "SHUTDOWN" => return Some(DangerousOperation::Shutdown),
            _ => {}
        }
    }
    pending
}

/// Classify a batch, returning the first dangerous operation any statement
/// matches under any native dialect that can tokenize it.
pub fn detect_dangerous(sql: &str) -> Option<DangerousOperation> {
    NATIVE_DIALECTS.iter().find_map(|dialect| {
        lex_statements(dialect, sql)
            .ok()?
            .iter()
            .find_map(|statement| detect_in_statement(dialect, statement))
    })
}

/// Returns a rejection reason for destructive, empty or untokenizable
/// statements, checked the way `dialect` reads them.
///
/// # Examples
///
/// ```
/// use db_gateway::db::Dialect;
/// use db_gateway::tools::guard::validate_query_for;
///
/// assert!(validate_query_for(&Dialect::Postgres, "/* ; */ DELETE FROM users").is_some());
/// assert!(validate_query_for(&Dialect::Postgres, "SELECT ';DROP DATABASE x'").is_none());
/// assert!(validate_query_for(&Dialect::MsSql, "SELECT 1 DROP DATABASE prod").is_some());
/// ```
pub fn validate_query_for(dialect: &Dialect, sql: &str) -> Option<String> {
    if statement_head(sql).is_empty() {
        return Some("Empty SQL statement".to_string());
    }
    check(dialect, sql, |tokenizer, statements| {
        statements
            .iter()
            .find_map(|statement| detect_in_statement(tokenizer, statement))
            .map(|op| op.describe())
    })
}

/// Dialect-free [`validate_query_for`].
///
/// # Examples
///
/// ```
/// use db_gateway::tools::guard::validate_query;
///
/// assert!(validate_query("DELETE FROM users").is_some());
/// assert!(validate_query("DELETE FROM users WHERE id = 1").is_none());
/// assert!(validate_query("UPDATE t SET c = 1 WHERE id = 1").is_none());
/// ```
pub fn validate_query(sql: &str) -> Option<String> {
    validate_query_for(&Dialect::Unknown(String::new()), sql)
}

fn read_only_violation(statement: &Lexed) -> Option<String> {
    let head = statement.head();
    if !READ_ONLY_PREFIX.is_match(head) {
        let verb = leading_keyword(head);
        return Some(format!(
            "Read-only mode: {verb} statements are not allowed. Only SELECT, WITH, EXPLAIN, SHOW, DESCRIBE, PRAGMA and SET search_path are permitted"
        ));
    }
    let words = &statement.words;
    words
        .iter()
        .enumerate()
        .find(|(i, word)| {
            EMBEDDED_WRITES.contains(&word.as_str())
                && !(*word == "CREATE" && *i > 0 && words[i - 1] == "SHOW")
        })
        .map(|(_, word)| {
            format!("Read-only mode: {word} is not allowed inside a read-only statement")
        })
}

/// Returns a rejection reason for any statement that could write, checked
/// the way `dialect` reads it.
pub fn enforce_read_only_for(dialect: &Dialect, sql: &str) -> Option<String> {
    if statement_head(sql).is_empty() {
        return Some("Empty SQL statement".to_string());
    }
    check(dialect, sql, |_, statements| {
        statements.iter().find_map(read_only_violation)
    })
}

/// Dialect-free [`enforce_read_only_for`].
///
/// # Examples
///
/// ```
/// use db_gateway::tools::guard::enforce_read_only;
///
/// assert!(enforce_read_only("SELECT 1").is_none());
/// assert!(enforce_read_only("SET search_path TO app").is_none());
/// assert!(enforce_read_only("INSERT INTO t VALUES (1)").is_some());
/// ```
pub fn enforce_read_only(sql: &str) -> Option<String> {
    enforce_read_only_for(&Dialect::Unknown(String::new()), sql)
}

fn transaction_control_in(dialect: &Dialect, statement: &Lexed) -> Option<String> {
    let words = &statement.words;
    let first = words.first().map(String::as_str);
    let second = words.get(1).map(String::as_str);
    let leading = match first {
        Some("START" | "COMMIT" | "ROLLBACK" | "SAVEPOINT" | "RELEASE" | "ABORT") => true,
        Some("BEGIN") => matches!(
            second,
            None | Some(
                "TRAN" | "TRANSACTION" | "WORK" | "ISOLATION" | "DEFERRED" | "IMMEDIATE"
                    | "EXCLUSIVE" | "DISTRIBUTED"
            )
        ),
        Some("END") => matches!(second, None | Some("TRANSACTION" | "WORK")),
        Some("SET") => matches!(second, Some("AUTOCOMMIT" | "IMPLICIT_TRANSACTIONS")),
        _ => false,
    };
    let embedded = *dialect == Dialect::MsSql
        && words.iter().enumerate().any(|(i, word)| match word.as_str() {
            "COMMIT" | "ROLLBACK" => true,
            "BEGIN" | "SAVE" => matches!(
                words.get(i + 1).map(String::as_str),
                Some("TRAN" | "TRANSACTION" | "DISTRIBUTED")
            ),
            _ => false,
        });
    (leading || embedded).then(|| {
        format!(
            "Transaction control not allowed in query: {}. Use commit_transaction or rollback_transaction",
            first.unwrap_or_default()
        )
    })
}

/// Returns a rejection reason when a statement would start, end or
/// checkpoint a transaction on its own.
///
/// # Examples
///
/// ```
/// use db_gateway::db::Dialect;
/// use db_gateway::tools::guard::detect_transaction_control;
///
/// assert!(detect_transaction_control(&Dialect::Sqlite, "COMMIT").is_some());
/// assert!(detect_transaction_control(&Dialect::Postgres, "/* x */ rollback").is_some());
/// assert!(detect_transaction_control(&Dialect::Sqlite, "INSERT INTO t VALUES (1)").is_none());
/// ```
pub fn detect_transaction_control(dialect: &Dialect, sql: &str) -> Option<String> {
    check(dialect, sql, |tokenizer, statements| {
        statements
            .iter()
            .find_map(|statement| transaction_control_in(tokenizer, statement))
    })
}

/// Accept a bare identifier or fail with a validation error.
pub fn sanitize_identifier(name: &str) -> GatewayResult<&str> {
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(GatewayError::validation(format!(
            "Identifier exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(GatewayError::validation(format!(
            "Invalid identifier '{}': only letters, digits and underscores are allowed, and it must not start with a digit",
            name.escape_debug()
        )));
    }
    Ok(name)
}
