// ABOUTME: SQL identifier validation and literal quoting helpers
// ABOUTME: Shared by the MySQL and PostgreSQL stores and the remote query builder

use anyhow::{bail, Result};

/// Validate an object, field, or column name before it is spliced into SQL.
///
/// Names are expected to be lowercase already. Allowed: ASCII letters, digits
/// and underscores, starting with a letter or underscore, at most 63 chars.
///
/// # Examples
///
/// ```
/// # use force_replicator::utils::validate_identifier;
/// assert!(validate_identifier("account").is_ok());
/// assert!(validate_identifier("invoice__c").is_ok());
/// assert!(validate_identifier("1account").is_err());
/// assert!(validate_identifier("acc; DROP TABLE x").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.trim().is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if identifier.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(identifier),
            identifier.len()
        );
    }

    let mut chars = identifier.chars();
    if let Some(first) = chars.next() {
        if !first.is_ascii_alphabetic() && first != '_' {
            bail!(
                "Identifier '{}' must start with a letter or underscore, not '{}'",
                sanitize_identifier(identifier),
                first
            );
        }
    }

    for (i, c) in identifier.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(identifier),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Sanitize an identifier for display in logs and error messages.
///
/// Removes control characters and limits length to 100 chars.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier.
///
/// Escapes embedded double quotes and wraps the identifier in double quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a SQL string literal the standard way (doubling single quotes).
///
/// # Examples
///
/// ```
/// use force_replicator::utils::quote_literal;
/// assert_eq!(quote_literal("hello"), "'hello'");
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// assert_eq!(quote_literal(""), "''");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push('\'');
        }
        quoted.push(ch);
    }
    quoted.push('\'');
    quoted
}

/// Quote a MySQL identifier with backticks, doubling embedded backticks.
///
/// # Examples
///
/// ```
/// use force_replicator::utils::quote_mysql_ident;
/// assert_eq!(quote_mysql_ident("account"), "`account`");
/// assert_eq!(quote_mysql_ident("user`name"), "`user``name`");
/// ```
pub fn quote_mysql_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('`');
    for ch in identifier.chars() {
        if ch == '`' {
            quoted.push('`');
        }
        quoted.push(ch);
    }
    quoted.push('`');
    quoted
}

/// Quote a MySQL string literal.
///
/// MySQL treats backslash as an escape character in the default SQL mode, so
/// besides quotes the characters that `mysql_real_escape_string` handles are
/// escaped as well.
///
/// # Examples
///
/// ```
/// use force_replicator::utils::quote_mysql_literal;
/// assert_eq!(quote_mysql_literal("O'Brien"), r"'O\'Brien'");
/// assert_eq!(quote_mysql_literal(r"C:\temp"), r"'C:\\temp'");
/// ```
pub fn quote_mysql_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\0' => quoted.push_str("\\0"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\\' => quoted.push_str("\\\\"),
            '\'' => quoted.push_str("\\'"),
            '"' => quoted.push_str("\\\""),
            '\x1a' => quoted.push_str("\\Z"),
            other => quoted.push(other),
        }
    }
    quoted.push('\'');
    quoted
}
