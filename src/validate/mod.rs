//! Static validation of synthesized SQL. The text-generation output is
//! untrusted input; nothing reaches the execution engine until every check
//! here has passed. All functions are pure and deterministic given the same
//! statement and schema snapshot.

use crate::schema::SchemaSnapshot;
use std::collections::{HashMap, HashSet};

/// Keywords that can never appear as a token outside quoted contexts.
pub const WRITE_KEYWORDS: [&str; 9] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "ALTER", "CREATE", "TRUNCATE", "GRANT", "EXEC",
];

/// SQL keywords, clauses, functions and type names that are not schema
/// identifiers. Anything outside this set (and outside string literals) must
/// resolve against the schema snapshot.
const KEYWORDS: &[&str] = &[
    "SELECT", "FROM", "WHERE", "GROUP", "ORDER", "BY", "LIMIT", "OFFSET", "AS", "AND", "OR",
    "NOT", "IN", "IS", "NULL", "BETWEEN", "LIKE", "ILIKE", "JOIN", "INNER", "LEFT", "RIGHT",
    "FULL", "OUTER", "CROSS", "ON", "USING", "HAVING", "DISTINCT", "UNION", "ALL", "ANY",
    "EXISTS", "CASE", "WHEN", "THEN", "ELSE", "END", "CAST", "ASC", "DESC", "COUNT", "SUM",
    "AVG", "MIN", "MAX", "COALESCE", "NULLIF", "ROUND", "FLOOR", "CEIL", "ABS", "UPPER",
    "LOWER", "LENGTH", "SUBSTR", "SUBSTRING", "TRIM", "CONCAT", "REPLACE", "DATE", "YEAR",
    "MONTH", "DAY", "NOW", "CURRENT_DATE", "CURRENT_TIMESTAMP", "EXTRACT", "INTERVAL",
    "DATE_TRUNC", "STRFTIME", "TRUE", "FALSE", "FLOAT", "REAL", "INTEGER", "INT", "BIGINT",
    "SMALLINT", "DOUBLE", "PRECISION", "VARCHAR", "TEXT", "NUMERIC", "DECIMAL", "BOOLEAN",
    "TIMESTAMP", "NATURAL", "BETWEEN", "OVER", "PARTITION", "ROW_NUMBER", "RANK", "DENSE_RANK",
];

#[derive(Debug, Clone, PartialEq)]
enum Token {
    /// Bare word: keyword or identifier, stored lowercase.
    Word(String),
    /// Double-quoted identifier, stored with its original case.
    QuotedIdent(String),
    /// Content of a single-quoted string literal.
    StringLit(String),
    Number,
    Symbol(char),
}

fn is_keyword(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    KEYWORDS.contains(&upper.as_str())
}

fn is_write_keyword(word: &str) -> bool {
    let upper = word.to_ascii_uppercase();
    WRITE_KEYWORDS.contains(&upper.as_str())
}

/// Removes `--` line comments and `/* */` block comments, respecting string
/// literals. Returns the stripped text plus whether any comment body hid a
/// statement terminator; an unterminated block comment or string is malformed.
fn strip_comments(sql: &str) -> Result<(String, bool), ()> {
    let bytes: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut hidden_terminator = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i];
        match c {
            '\'' => {
                // Copy the literal verbatim, honoring '' escapes.
                out.push(c);
                i += 1;
                loop {
                    if i >= bytes.len() {
                        return Err(());
                    }
                    out.push(bytes[i]);
                    if bytes[i] == '\'' {
                        if i + 1 < bytes.len() && bytes[i + 1] == '\'' {
                            out.push('\'');
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            '-' if i + 1 < bytes.len() && bytes[i + 1] == '-' => {
                i += 2;
                while i < bytes.len() && bytes[i] != '\n' {
                    if bytes[i] == ';' {
                        hidden_terminator = true;
                    }
                    i += 1;
                }
                out.push(' ');
            }
            '/' if i + 1 < bytes.len() && bytes[i + 1] == '*' => {
                i += 2;
                let mut closed = false;
                while i < bytes.len() {
                    if bytes[i] == ';' {
                        hidden_terminator = true;
                    }
                    if bytes[i] == '*' && i + 1 < bytes.len() && bytes[i + 1] == '/' {
                        i += 2;
                        closed = true;
                        break;
                    }
                    i += 1;
                }
                if !closed {
                    return Err(());
                }
                out.push(' ');
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok((out, hidden_terminator))
}

fn lex(sql: &str) -> Result<Vec<Token>, ()> {
    let chars: Vec<char> = sql.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '\'' {
            let mut lit = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(());
                }
                if chars[i] == '\'' {
                    if i + 1 < chars.len() && chars[i + 1] == '\'' {
                        lit.push('\'');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                lit.push(chars[i]);
                i += 1;
            }
            tokens.push(Token::StringLit(lit));
        } else if c == '"' {
            let mut ident = String::new();
            i += 1;
            loop {
                if i >= chars.len() {
                    return Err(());
                }
                if chars[i] == '"' {
                    if i + 1 < chars.len() && chars[i + 1] == '"' {
                        ident.push('"');
                        i += 2;
                        continue;
                    }
                    i += 1;
                    break;
                }
                ident.push(chars[i]);
                i += 1;
            }
            tokens.push(Token::QuotedIdent(ident));
        } else if c.is_ascii_digit() {
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                i += 1;
            }
            tokens.push(Token::Number);
        } else if c.is_alphabetic() || c == '_' {
            let mut word = String::new();
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                word.push(chars[i]);
                i += 1;
            }
            tokens.push(Token::Word(word.to_ascii_lowercase()));
        } else {
            tokens.push(Token::Symbol(c));
            i += 1;
        }
    }

    Ok(tokens)
}

fn ident_text(token: &Token) -> Option<String> {
    match token {
        Token::Word(w) if !is_keyword(w) && !is_write_keyword(w) => Some(w.clone()),
        Token::QuotedIdent(q) => Some(q.clone()),
        _ => None,
    }
}

/// Collects table aliases (`FROM campaigns c`, `JOIN channels AS ch`) and
/// column aliases (`SUM(spend) AS total`). Aliases resolve like the thing
/// they name for the remainder of the statement.
fn collect_aliases(
    tokens: &[Token],
    schema: &SchemaSnapshot,
) -> (HashMap<String, String>, HashSet<String>) {
    let mut table_aliases: HashMap<String, String> = HashMap::new();
    let mut column_aliases: HashSet<String> = HashSet::new();

    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Word(w) if w == "from" || w == "join" => {
                // table reference follows; an alias may follow that
                if let Some(table) = tokens.get(i + 1).and_then(ident_text) {
                    if schema.has_table(&table) {
                        let mut j = i + 2;
                        if matches!(tokens.get(j), Some(Token::Word(w)) if w == "as") {
                            j += 1;
                        }
                        if let Some(alias) = tokens.get(j).and_then(ident_text) {
                            // Not an alias if it is itself a clause boundary
                            // already excluded by ident_text's keyword filter.
                            table_aliases.insert(alias.to_ascii_lowercase(), table.clone());
                        }
                    }
                }
                i += 1;
            }
            Token::Word(w) if w == "as" => {
                if let Some(alias) = tokens.get(i + 1).and_then(ident_text) {
                    column_aliases.insert(alias.to_ascii_lowercase());
                }
                i += 1;
            }
            _ => i += 1,
        }
    }

    (table_aliases, column_aliases)
}

/// Check 1: every identifier must resolve to a schema table, a column, or an
/// alias defined in the statement.
fn check_identifiers(tokens: &[Token], schema: &SchemaSnapshot) -> Vec<String> {
    let (table_aliases, column_aliases) = collect_aliases(tokens, schema);
    let mut errors = Vec::new();
    let mut reported: HashSet<String> = HashSet::new();
    let mut i = 0;

    while i < tokens.len() {
        let Some(name) = ident_text(&tokens[i]) else {
            i += 1;
            continue;
        };
        let lower = name.to_ascii_lowercase();

        // Qualified reference: a.b or a.*
        if matches!(tokens.get(i + 1), Some(Token::Symbol('.'))) {
            let qualifier_table = if schema.has_table(&name) {
                Some(name.clone())
            } else {
                table_aliases.get(&lower).cloned()
            };

            match qualifier_table {
                None => {
                    if reported.insert(lower.clone()) {
                        errors.push(format!("unknown_identifier:{}", lower));
                    }
                    i += 2;
                }
                Some(table) => {
                    match tokens.get(i + 2) {
                        Some(Token::Symbol('*')) => {}
                        Some(t) => {
                            if let Some(column) = ident_text(t) {
                                if !schema.has_table_column(&table, &column) {
                                    let key = column.to_ascii_lowercase();
                                    if reported.insert(key.clone()) {
                                        errors.push(format!("unknown_identifier:{}", key));
                                    }
                                }
                            }
                        }
                        None => {}
                    }
                    i += 3;
                }
            }
            continue;
        }

        let known = schema.has_table(&name)
            || schema.has_column(&name)
            || table_aliases.contains_key(&lower)
            || column_aliases.contains(&lower);

        if !known && reported.insert(lower.clone()) {
            errors.push(format!("unknown_identifier:{}", lower));
        }
        i += 1;
    }

    errors
}

/// Check 2: one statement, starting with SELECT. A terminator hidden in a
/// comment counts as a second statement.
fn check_shape(tokens: &[Token], hidden_terminator: bool) -> Vec<String> {
    if hidden_terminator {
        return vec!["multi_statement_or_non_sql".to_string()];
    }

    // One trailing semicolon is tolerated; any other is a second statement.
    let mut body = tokens;
    if let Some(Token::Symbol(';')) = body.last() {
        body = &body[..body.len() - 1];
    }
    if body.iter().any(|t| matches!(t, Token::Symbol(';'))) {
        return vec!["multi_statement_or_non_sql".to_string()];
    }

    match body.first() {
        Some(Token::Word(w)) if w == "select" => Vec::new(),
        Some(_) | None => vec!["not_a_select".to_string()],
    }
}

/// Check 3: write-keyword denylist outside quoted contexts.
fn check_write_keywords(tokens: &[Token]) -> Vec<String> {
    for token in tokens {
        if let Token::Word(w) = token {
            if is_write_keyword(w) {
                return vec![format!("write_keyword:{}", w.to_ascii_lowercase())];
            }
        }
    }
    Vec::new()
}

/// Check 4: string literals must not smuggle terminators or write keywords.
fn check_literals(tokens: &[Token]) -> Vec<String> {
    for token in tokens {
        if let Token::StringLit(lit) = token {
            if lit.contains(';') {
                return vec!["suspicious_literal".to_string()];
            }
            let has_keyword = lit
                .split(|c: char| !c.is_alphanumeric() && c != '_')
                .any(is_write_keyword);
            if has_keyword {
                return vec!["suspicious_literal".to_string()];
            }
        }
    }
    Vec::new()
}

/// Runs the four checks in order against the comment-stripped statement.
/// The first failing check rejects; nothing downstream runs. Malformed input
/// (unterminated string or comment) rejects as non-SQL.
pub fn validate(sql: &str, schema: &SchemaSnapshot) -> Result<(), Vec<String>> {
    let Ok((stripped, hidden_terminator)) = strip_comments(sql) else {
        return Err(vec!["multi_statement_or_non_sql".to_string()]);
    };
    let Ok(tokens) = lex(&stripped) else {
        return Err(vec!["multi_statement_or_non_sql".to_string()]);
    };

    let errors = check_identifiers(&tokens, schema);
    if !errors.is_empty() {
        return Err(errors);
    }

    let errors = check_shape(&tokens, hidden_terminator);
    if !errors.is_empty() {
        return Err(errors);
    }

    let errors = check_write_keywords(&tokens);
    if !errors.is_empty() {
        return Err(errors);
    }

    let errors = check_literals(&tokens);
    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(())
}
