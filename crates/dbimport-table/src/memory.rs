//! In-process table used by verification runs and tests.
//!
//! Presence checks are answered by evaluating the `WHERE` clause of the
//! rendered query against the stored rows. Only conjunctions of
//! `column = value`, `column IS NULL` and `column IS NOT NULL` are
//! understood; the `FROM` clause is ignored.

use std::collections::BTreeSet;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::{RenderedQuery, Row, Scalar, TableError, TableRef, TableStore};

#[derive(Debug)]
pub struct MemoryTable {
    table: TableRef,
    columns: Option<BTreeSet<String>>,
    unique_key: Vec<String>,
    rows: Mutex<Vec<Row>>,
}

impl MemoryTable {
    pub fn new(table: TableRef) -> Self {
        Self {
            table,
            columns: None,
            unique_key: Vec::new(),
            rows: Mutex::new(Vec::new()),
        }
    }

    /// Declares the table schema; inserts carrying other columns are rejected.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Rows whose key columns equal an existing row's are silently dropped,
    /// mirroring `ON CONFLICT DO NOTHING` against a unique index.
    pub fn with_unique_key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_key = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rows(self, rows: Vec<Row>) -> Self {
        *self.lock() = rows;
        self
    }

    /// An empty table with the same schema and constraints, named `table`.
    pub fn scratch_copy(&self, table: &str) -> Self {
        Self {
            table: self.table.sibling(table),
            columns: self.columns.clone(),
            unique_key: self.unique_key.clone(),
            rows: Mutex::new(Vec::new()),
        }
    }

    pub fn rows(&self) -> Vec<Row> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Row>> {
        // Rows are pushed whole, so a poisoned lock still guards consistent data.
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn conflicts(&self, existing: &[Row], candidate: &Row) -> bool {
        if self.unique_key.is_empty() {
            return false;
        }
        existing.iter().any(|row| {
            self.unique_key.iter().all(|column| match (row.get(column), candidate.get(column)) {
                (Some(a), Some(b)) => a.sql_eq(b),
                _ => false,
            })
        })
    }
}

#[async_trait]
impl TableStore for MemoryTable {
    fn table_ref(&self) -> &TableRef {
        &self.table
    }

    async fn presence_check(&self, query: &RenderedQuery) -> Result<bool, TableError> {
        let conditions = parse_conditions(&query.sql, &query.params)?;
        let rows = self.lock();
        Ok(rows
            .iter()
            .any(|row| conditions.iter().all(|condition| condition.matches(row))))
    }

    async fn insert_rows(&self, rows: &[Row]) -> Result<u64, TableError> {
        if let Some(columns) = &self.columns {
            let unknown: BTreeSet<String> = rows
                .iter()
                .flat_map(|row| row.columns())
                .filter(|column| !columns.contains(*column))
                .map(str::to_string)
                .collect();
            if !unknown.is_empty() {
                return Err(TableError::SchemaMismatch {
                    table: self.table.to_string(),
                    columns: unknown.into_iter().collect(),
                });
            }
        }

        let mut stored = self.lock();
        let mut inserted = 0;
        for row in rows {
            if self.conflicts(&stored, row) {
                continue;
            }
            stored.push(row.clone());
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn fetch_rows(&self) -> Result<Vec<Row>, TableError> {
        Ok(self.rows())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, Scalar),
    IsNull(String),
    IsNotNull(String),
}

impl Condition {
    fn matches(&self, row: &Row) -> bool {
        match self {
            Condition::Eq(column, value) => row.get(column).is_some_and(|v| v.sql_eq(value)),
            Condition::IsNull(column) => row.get(column).map_or(true, Scalar::is_null),
            Condition::IsNotNull(column) => row.get(column).is_some_and(|v| !v.is_null()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    QuotedIdent(String),
    Str(String),
    Number(String),
    Param(usize),
    Symbol(char),
    Cast,
}

impl Token {
    fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Token::Word(word) if word.eq_ignore_ascii_case(keyword))
    }
}

fn unsupported(sql: &str, reason: &str) -> TableError {
    TableError::UnsupportedQuery(format!("{reason}: {sql}"))
}

fn tokenize(sql: &str) -> Result<Vec<Token>, TableError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        text.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                    None => return Err(unsupported(sql, "unterminated string literal")),
                }
            }
            tokens.push(Token::Str(text));
        } else if c == '"' || c == '`' {
            let close = c;
            let start = i + 1;
            let end = chars[start..]
                .iter()
                .position(|ch| *ch == close)
                .map(|offset| start + offset)
                .ok_or_else(|| unsupported(sql, "unterminated quoted identifier"))?;
            tokens.push(Token::QuotedIdent(chars[start..end].iter().collect()));
            i = end + 1;
        } else if c == '$' {
            let start = i + 1;
            let mut end = start;
            while end < chars.len() && chars[end].is_ascii_digit() {
                end += 1;
            }
            let index: usize = chars[start..end]
                .iter()
                .collect::<String>()
                .parse()
                .map_err(|_| unsupported(sql, "malformed bind parameter"))?;
            tokens.push(Token::Param(index));
            i = end;
        } else if c == ':' && chars.get(i + 1) == Some(&':') {
            tokens.push(Token::Cast);
            i += 2;
        } else if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number(chars[start..i].iter().collect()));
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Word(chars[start..i].iter().collect()));
        } else {
            tokens.push(Token::Symbol(c));
            i += 1;
        }
    }

    Ok(tokens)
}

fn parse_conditions(sql: &str, params: &[Scalar]) -> Result<Vec<Condition>, TableError> {
    let tokens = tokenize(sql)?;
    let Some(where_at) = tokens.iter().position(|token| token.is_keyword("where")) else {
        return Ok(Vec::new());
    };

    let clause: Vec<&Token> = tokens[where_at + 1..]
        .iter()
        .take_while(|token| {
            !(token.is_keyword("limit")
                || token.is_keyword("order")
                || token.is_keyword("group")
                || **token == Token::Symbol(';'))
        })
        .collect();

    let mut conditions = Vec::new();
    for term in clause.split(|token| token.is_keyword("and")) {
        if term.iter().any(|token| token.is_keyword("or")) {
            return Err(unsupported(sql, "OR is not supported"));
        }
        conditions.push(parse_term(sql, term, params)?);
    }
    Ok(conditions)
}

fn parse_term(sql: &str, term: &[&Token], params: &[Scalar]) -> Result<Condition, TableError> {
    let mut pos = 0;
    let mut column = None;
    // Qualified names such as t.id or "dataset"."table"."id" keep the last part.
    while let Some(token) = term.get(pos) {
        match token {
            Token::Word(name) | Token::QuotedIdent(name) => column = Some(name.clone()),
            _ => return Err(unsupported(sql, "expected a column name")),
        }
        pos += 1;
        if term.get(pos) == Some(&&Token::Symbol('.')) {
            pos += 1;
        } else {
            break;
        }
    }
    let column = column.ok_or_else(|| unsupported(sql, "empty condition"))?;

    let rest = &term[pos..];
    match rest {
        [op, value @ ..] if **op == Token::Symbol('=') => {
            let value = parse_value(sql, value, params)?;
            Ok(Condition::Eq(column, value))
        }
        [is, null] if is.is_keyword("is") && null.is_keyword("null") => Ok(Condition::IsNull(column)),
        [is, not, null] if is.is_keyword("is") && not.is_keyword("not") && null.is_keyword("null") => {
            Ok(Condition::IsNotNull(column))
        }
        _ => Err(unsupported(sql, "only '=' and IS [NOT] NULL comparisons are supported")),
    }
}

fn parse_value(sql: &str, tokens: &[&Token], params: &[Scalar]) -> Result<Scalar, TableError> {
    let (first, rest) = tokens
        .split_first()
        .ok_or_else(|| unsupported(sql, "missing comparison value"))?;

    match rest {
        [] => {}
        [Token::Cast, Token::Word(_)] => {}
        _ => return Err(unsupported(sql, "unexpected tokens after comparison value")),
    }

    match first {
        Token::Param(index) => params
            .get(index.wrapping_sub(1))
            .cloned()
            .ok_or(TableError::MissingBindParameter(*index, params.len())),
        Token::Str(text) => Ok(Scalar::Text(text.clone())),
        Token::Number(text) => Ok(Scalar::infer(text)),
        token if token.is_keyword("true") => Ok(Scalar::Bool(true)),
        token if token.is_keyword("false") => Ok(Scalar::Bool(false)),
        token if token.is_keyword("null") => Ok(Scalar::Null),
        _ => Err(unsupported(sql, "unsupported comparison value")),
    }
}
