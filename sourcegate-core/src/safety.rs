//! Read-only query gate.
//!
//! Splits SQL text into statements and accepts the batch only when every
//! statement starts with an allow-listed keyword. Statement boundaries
//! depend on the dialect: comment markers, identifier quotes and
//! dollar-quoted bodies differ between backends, so the scanner follows the
//! lexical rules of the backend the SQL is sent to. SQL checked without a
//! backend must be read-only under every dialect. Anything the scanner
//! cannot read with certainty is rejected.

use crate::adapters::Backend;
use crate::{Result, error::SourceGateError};

/// Leading keywords accepted as read-only.
pub const READ_ONLY_KEYWORDS: &[&str] = &["SELECT", "WITH", "SHOW", "DESCRIBE", "EXPLAIN"];

/// Keywords that make a SELECT/WITH/EXPLAIN statement writable when they
/// appear anywhere outside literals (data-modifying CTEs, `SELECT INTO`,
/// `EXPLAIN ANALYZE DELETE`, row locks).
const WRITE_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "MERGE", "UPSERT", "DROP", "CREATE", "ALTER", "TRUNCATE",
    "GRANT", "REVOKE", "INTO", "COPY", "CALL", "EXEC", "EXECUTE",
];

/// Leading keywords whose body is inspected for write keywords.
const INSPECTED_KEYWORDS: &[&str] = &["SELECT", "WITH", "EXPLAIN"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DollarQuotes {
    Unsupported,
    /// `$$ ... $$` only
    Untagged,
    /// `$$ ... $$` and `$tag$ ... $tag$`
    Tagged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Brackets {
    Unsupported,
    /// `[...]` ends at the first `]`
    Plain,
    /// `]]` inside `[...]` is an escaped bracket
    Doubled,
}

/// Lexical rules of one dialect that decide where statements end.
#[derive(Debug, Clone, Copy)]
struct Lexicon {
    /// `#` starts a line comment
    hash_comments: bool,
    /// `//` starts a line comment
    slash_comments: bool,
    /// `--` starts a comment only when followed by whitespace
    dash_comment_needs_space: bool,
    /// `` `...` `` quotes an identifier
    backticks: bool,
    brackets: Brackets,
    dollar_quotes: DollarQuotes,
    /// `$name`, `@name`, `:name` and `#name` parameters, with an optional
    /// `(...)` suffix that runs to the next `)` or whitespace
    sigil_parameters: bool,
}

impl Lexicon {
    const PLAIN: Self = Self {
        hash_comments: false,
        slash_comments: false,
        dash_comment_needs_space: false,
        backticks: false,
        brackets: Brackets::Unsupported,
        dollar_quotes: DollarQuotes::Unsupported,
        sigil_parameters: false,
    };

    const fn of(backend: Backend) -> Self {
        match backend {
            Backend::Postgres | Backend::DuckDb => Self {
                dollar_quotes: DollarQuotes::Tagged,
                ..Self::PLAIN
            },
            Backend::MySql => Self {
                hash_comments: true,
                dash_comment_needs_space: true,
                backticks: true,
                ..Self::PLAIN
            },
            Backend::Sqlite => Self {
                backticks: true,
                brackets: Brackets::Plain,
                sigil_parameters: true,
                ..Self::PLAIN
            },
            Backend::SqlServer => Self {
                brackets: Brackets::Doubled,
                ..Self::PLAIN
            },
            Backend::BigQuery => Self {
                hash_comments: true,
                backticks: true,
                ..Self::PLAIN
            },
            Backend::Snowflake => Self {
                slash_comments: true,
                dollar_quotes: DollarQuotes::Untagged,
                ..Self::PLAIN
            },
            Backend::Databricks => Self {
                backticks: true,
                ..Self::PLAIN
            },
        }
    }
}

/// SQL text with its read-only verdict computed once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    sql: String,
    backend: Option<Backend>,
    verdict: std::result::Result<(), String>,
}

impl Query {
    /// Classifies `sql` under every dialect.
    pub fn new(sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let verdict = check_all(&sql);
        Self {
            sql,
            backend: None,
            verdict,
        }
    }

    /// Classifies `sql` under the lexical rules of `backend`.
    pub fn for_backend(backend: Backend, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let verdict = check(&sql, Lexicon::of(backend));
        Self {
            sql,
            backend: Some(backend),
            verdict,
        }
    }

    /// The SQL text.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Backend whose dialect was used, `None` when checked under all.
    pub const fn backend(&self) -> Option<Backend> {
        self.backend
    }

    /// Whether every statement in the text is read-only.
    pub const fn is_read_only(&self) -> bool {
        self.verdict.is_ok()
    }

    /// Returns `QuerySafety` unless the query is read-only.
    ///
    /// # Errors
    /// Returns `QuerySafety` naming the reason for rejection
    pub fn ensure_read_only(&self) -> Result<()> {
        self.verdict
            .clone()
            .map_err(SourceGateError::query_safety)
    }
}

/// Returns true when every statement in `sql` is read-only under every
/// dialect.
///
/// Empty input, input made only of comments, and input the scanner cannot
/// split with certainty are all rejected.
///
/// ```rust
/// use sourcegate_core::safety::is_read_only;
///
/// assert!(is_read_only("SELECT * FROM t"));
/// assert!(!is_read_only("DROP TABLE t"));
/// assert!(!is_read_only("SELECT 1; DELETE FROM t"));
/// ```
pub fn is_read_only(sql: &str) -> bool {
    check_all(sql).is_ok()
}

/// Returns true when every statement in `sql` is read-only as `backend`
/// reads it.
///
/// ```rust
/// use sourcegate_core::adapters::Backend;
/// use sourcegate_core::safety::is_read_only_for;
///
/// assert!(is_read_only_for(Backend::Postgres, "SELECT $q$ ; DROP $q$"));
/// assert!(!is_read_only_for(Backend::Sqlite, "SELECT $q$ ; DROP $q$"));
/// ```
pub fn is_read_only_for(backend: Backend, sql: &str) -> bool {
    check(sql, Lexicon::of(backend)).is_ok()
}

fn check_all(sql: &str) -> std::result::Result<(), String> {
    let verdicts: Vec<_> = Backend::ALL
        .iter()
        .map(|backend| (*backend, check(sql, Lexicon::of(*backend))))
        .collect();

    let accepted_somewhere = verdicts.iter().any(|(_, verdict)| verdict.is_ok());
    match verdicts.into_iter().find(|(_, verdict)| verdict.is_err()) {
        None => Ok(()),
        Some((backend, Err(reason))) if accepted_somewhere => {
            Err(format!("{reason} (as {backend} reads it)"))
        }
        Some((_, verdict)) => verdict,
    }
}

fn check(sql: &str, lexicon: Lexicon) -> std::result::Result<(), String> {
    let statements = split_statements(sql, lexicon)?;
    if statements.is_empty() {
        return Err("no SQL statement found".to_string());
    }

    for (index, words) in statements.iter().enumerate() {
        classify_statement(words).map_err(|reason| {
            if statements.len() > 1 {
                format!("statement {} of {}: {reason}", index + 1, statements.len())
            } else {
                reason
            }
        })?;
    }
    Ok(())
}

fn classify_statement(words: &[String]) -> std::result::Result<(), String> {
    let Some(leading) = words.first() else {
        return Err("statement has no keyword".to_string());
    };

    if !READ_ONLY_KEYWORDS.contains(&leading.as_str()) {
        return Err(format!("only read-only statements are allowed, found {leading}"));
    }

    if INSPECTED_KEYWORDS.contains(&leading.as_str())
        && let Some(write) = words
            .iter()
            .skip(1)
            .find(|word| WRITE_KEYWORDS.contains(&word.as_str()))
    {
        return Err(format!("{leading} statement contains {write}"));
    }

    Ok(())
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Splits SQL into statements, returning the upper-cased bare words of each.
///
/// Words inside string literals, quoted identifiers, comments and
/// dollar-quoted bodies are dropped. Statements with no words are skipped.
fn split_statements(sql: &str, lexicon: Lexicon) -> std::result::Result<Vec<Vec<String>>, String> {
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();
    let mut words: Vec<String> = Vec::new();
    let mut word = String::new();
    let mut i = 0;

    let flush = |word: &mut String, words: &mut Vec<String>| {
        if !word.is_empty() {
            words.push(word.to_ascii_uppercase());
            word.clear();
        }
    };

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match c {
            '\'' | '"' => {
                flush(&mut word, &mut words);
                i = skip_quoted(&chars, i + 1, c, true)?;
            }
            '`' if lexicon.backticks => {
                flush(&mut word, &mut words);
                i = skip_quoted(&chars, i + 1, '`', true)?;
            }
            '[' if lexicon.brackets != Brackets::Unsupported => {
                flush(&mut word, &mut words);
                i = skip_quoted(&chars, i + 1, ']', lexicon.brackets == Brackets::Doubled)?;
            }
            '-' if next == Some('-') => {
                flush(&mut word, &mut words);
                let spaced = chars.get(i + 2).is_none_or(|c| c.is_whitespace());
                if lexicon.dash_comment_needs_space && !spaced {
                    i += 1;
                } else {
                    i = skip_line(&chars, i);
                }
            }
            '#' if lexicon.hash_comments => {
                flush(&mut word, &mut words);
                i = skip_line(&chars, i);
            }
            '/' if lexicon.slash_comments && next == Some('/') => {
                flush(&mut word, &mut words);
                i = skip_line(&chars, i);
            }
            '/' if next == Some('*') => {
                flush(&mut word, &mut words);
                if matches!(chars.get(i + 2), Some('!')) {
                    return Err("executable comments are not allowed".to_string());
                }
                i = skip_block_comment(&chars, i + 2)?;
            }
            '$' | '@' | ':' | '#'
                if lexicon.sigil_parameters
                    && word.is_empty()
                    && next.is_some_and(is_word_char) =>
            {
                i = skip_sigil_parameter(&chars, i);
            }
            '$' if word.is_empty() && lexicon.dollar_quotes != DollarQuotes::Unsupported => {
                match skip_dollar_quoted(&chars, i, lexicon.dollar_quotes)? {
                    Some(end) => i = end,
                    None => {
                        word.push(c);
                        i += 1;
                    }
                }
            }
            ';' => {
                flush(&mut word, &mut words);
                if !words.is_empty() {
                    statements.push(std::mem::take(&mut words));
                }
                i += 1;
            }
            c if is_word_char(c) || c == '$' => {
                word.push(c);
                i += 1;
            }
            _ => {
                flush(&mut word, &mut words);
                i += 1;
            }
        }
    }

    flush(&mut word, &mut words);
    if !words.is_empty() {
        statements.push(words);
    }

    Ok(statements)
}

/// Index of the newline ending the comment that starts at `i`.
fn skip_line(chars: &[char], mut i: usize) -> usize {
    while i < chars.len() && chars[i] != '\n' {
        i += 1;
    }
    i
}

/// Skips a quoted region starting after the opening quote.
///
/// With `doubled`, a doubled closing quote is an escaped quote. Backslashes
/// are rejected because dialects disagree on whether they escape the
/// closing quote.
fn skip_quoted(
    chars: &[char],
    mut i: usize,
    close: char,
    doubled: bool,
) -> std::result::Result<usize, String> {
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && close != ']' {
            return Err("backslash inside a quoted literal is ambiguous".to_string());
        }
        if c == close {
            if doubled && chars.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return Ok(i + 1);
        }
        i += 1;
    }
    Err(format!("unterminated {close} quote"))
}

/// Skips a block comment body starting after `/*`.
///
/// Some dialects nest block comments and others do not, so an opening
/// `/*` inside a comment is rejected.
fn skip_block_comment(chars: &[char], mut i: usize) -> std::result::Result<usize, String> {
    while i + 1 < chars.len() {
        match (chars[i], chars[i + 1]) {
            ('*', '/') => return Ok(i + 2),
            ('/', '*') => return Err("nested block comments are ambiguous".to_string()),
            _ => i += 1,
        }
    }
    Err("unterminated block comment".to_string())
}

/// Skips a `$name`-style parameter starting at its sigil.
///
/// The name may carry `::` separators and a `(...)` suffix that ends at
/// the first `)` or whitespace.
fn skip_sigil_parameter(chars: &[char], start: usize) -> usize {
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        if is_word_char(c) || c == '$' {
            i += 1;
        } else if c == ':' && chars.get(i + 1) == Some(&':') {
            i += 2;
        } else if c == '(' {
            i += 1;
            while i < chars.len() && !chars[i].is_whitespace() && chars[i] != ')' {
                i += 1;
            }
            if chars.get(i) == Some(&')') {
                i += 1;
            }
            break;
        } else {
            break;
        }
    }
    i
}

/// Skips a `$tag$ ... $tag$` body starting at the first `$`.
///
/// Returns `None` when the `$` does not open a dollar quote.
fn skip_dollar_quoted(
    chars: &[char],
    start: usize,
    style: DollarQuotes,
) -> std::result::Result<Option<usize>, String> {
    if chars.get(start + 1).is_some_and(char::is_ascii_digit) {
        return Ok(None);
    }
    let mut j = start + 1;
    while j < chars.len() && is_word_char(chars[j]) {
        j += 1;
    }
    if chars.get(j) != Some(&'$') {
        return Ok(None);
    }
    if j > start + 1 && style != DollarQuotes::Tagged {
        return Err("tagged dollar quotes are not supported by this dialect".to_string());
    }

    let tag: Vec<char> = chars[start..=j].to_vec();
    let mut i = j + 1;
    while i + tag.len() <= chars.len() {
        if chars[i..i + tag.len()] == tag[..] {
            return Ok(Some(i + tag.len()));
        }
        i += 1;
    }
    Err("unterminated dollar-quoted string".to_string())
}
