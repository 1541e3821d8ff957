//! String-level SQL surgery used by the repair passes.
//!
//! These helpers track paren depth and quoted regions so the passes can
//! reason about clause boundaries without a full parse. They treat
//! single quotes, double quotes and backticks as opaque.

/// Per-character scan state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quote {
    None,
    Single,
    Double,
    Backtick,
}

fn quote_for(c: char) -> Option<Quote> {
    match c {
        '\'' => Some(Quote::Single),
        '"' => Some(Quote::Double),
        '`' => Some(Quote::Backtick),
        _ => None,
    }
}

/// `(byte index, char, paren depth, inside a quoted region)` for every
/// character. Depth is the depth *before* consuming the character, so
/// an opening paren reports the depth outside it.
fn scan(sql: &str) -> Vec<(usize, char, i32, bool)> {
    let mut out = Vec::with_capacity(sql.len());
    let mut depth = 0i32;
    let mut quote = Quote::None;

    for (i, c) in sql.char_indices() {
        let quoted = quote != Quote::None;
        out.push((i, c, depth, quoted));

        if quoted {
            if quote_for(c) == Some(quote) {
                quote = Quote::None;
            }
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {
                if let Some(q) = quote_for(c) {
                    quote = q;
                }
            }
        }
    }
    out
}

/// Index of the `)` matching the `(` at `open_idx`, quote-aware.
pub fn find_matching_paren(sql: &str, open_idx: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote = Quote::None;

    for (i, c) in sql.char_indices().skip_while(|(i, _)| *i < open_idx) {
        if quote != Quote::None {
            if quote_for(c) == Some(quote) {
                quote = Quote::None;
            }
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {
                if let Some(q) = quote_for(c) {
                    quote = q;
                }
            }
        }
    }
    None
}

/// Split on `sep` at paren depth 0, quote-aware.
pub fn split_top_level(s: &str, sep: char) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    for (i, c, depth, quoted) in scan(s) {
        if c == sep && depth == 0 && !quoted {
            parts.push(s[start..i].to_string());
            start = i + c.len_utf8();
        }
    }
    parts.push(s[start..].to_string());
    parts
}

/// Case-insensitive whole-word replacement.
pub fn word_replace(sql: &str, from: &str, to: &str) -> String {
    let re = regex::Regex::new(&format!(r"(?i)\b{}\b", regex::escape(from))).unwrap();
    re.replace_all(sql, |_: &regex::Captures| to.to_string())
        .into_owned()
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whole-word occurrences of `word` outside quoted regions, with the
/// paren depth at each occurrence.
fn word_occurrences(sql: &str, word: &str) -> Vec<(usize, i32)> {
    let chars = scan(sql);
    // ASCII-only fold: byte offsets in the haystack must line up with
    // the original, and Unicode case mapping can change byte lengths.
    let upper: String = sql.to_ascii_uppercase();
    let needle = word.to_ascii_uppercase();
    let mut found = Vec::new();

    let mut search = 0usize;
    while let Some(pos) = upper[search..].find(&needle) {
        let start = search + pos;
        let end = start + needle.len();
        search = start + 1;

        let before_ok = start == 0
            || !is_word_char(sql[..start].chars().next_back().unwrap_or(' '));
        let after_ok = end >= sql.len() || !is_word_char(sql[end..].chars().next().unwrap_or(' '));
        if !before_ok || !after_ok {
            continue;
        }
        // scan() is indexed by char position, not byte; look up by byte.
        if let Some(&(_, _, depth, quoted)) = chars.iter().find(|(i, _, _, _)| *i == start) {
            if !quoted {
                found.push((start, depth));
            }
        }
    }
    found
}

/// End of the clause starting at `from`: the next clause keyword or
/// closing paren at `depth`, else end of string.
fn clause_end(sql: &str, from: usize, depth: i32) -> usize {
    const TERMINATORS: &[&str] = &["GROUP", "ORDER", "HAVING", "LIMIT", "UNION", "WINDOW", "QUALIFY"];
    let mut end = sql.len();

    for kw in TERMINATORS {
        for (pos, d) in word_occurrences(sql, kw) {
            if pos > from && d == depth && pos < end {
                end = pos;
            }
        }
    }
    // A closing paren below the clause's depth also terminates it.
    for (i, c, d, quoted) in scan(sql) {
        if i > from && !quoted && c == ')' && d - 1 < depth && i < end {
            end = i;
            break;
        }
    }
    end
}

/// Rebuild every `WHERE` clause keeping only the top-level conjuncts
/// for which `keep` returns true. A clause left empty is removed
/// entirely.
pub fn split_where_clauses(sql: &str, keep: impl Fn(&str) -> bool) -> String {
    let occurrences = word_occurrences(sql, "WHERE");
    if occurrences.is_empty() {
        return sql.to_string();
    }

    let mut out = String::new();
    let mut cursor = 0usize;
    for (pos, depth) in occurrences {
        if pos < cursor {
            continue;
        }
        let body_start = pos + "WHERE".len();
        let end = clause_end(sql, body_start, depth);
        let body = &sql[body_start..end];

        let kept: Vec<String> = split_and_conjuncts(body)
            .into_iter()
            .filter(|c| keep(c))
            .collect();

        out.push_str(&sql[cursor..pos]);
        if kept.is_empty() {
            // Drop WHERE and any trailing space before the next clause.
        } else {
            out.push_str("WHERE ");
            out.push_str(&kept.join(" AND "));
            out.push(' ');
        }
        cursor = end;
        // Collapse doubled whitespace at the seam.
        while out.ends_with("  ") {
            out.pop();
        }
    }
    out.push_str(&sql[cursor..]);
    out.trim_end().to_string()
}

/// Split a WHERE body on `AND` at its own top paren depth.
fn split_and_conjuncts(body: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut start = 0usize;
    for (pos, depth) in word_occurrences(body, "AND") {
        if depth == 0 {
            parts.push(body[start..pos].trim().to_string());
            start = pos + 3;
        }
    }
    parts.push(body[start..].trim().to_string());
    parts.retain(|p| !p.is_empty());
    parts
}

/// Rename column-position references to `name`, leaving table-position
/// references (after `FROM`/`JOIN`, before `.`, or the `name AS (`
/// definition itself) untouched.
pub fn rename_column_references(sql: &str, name: &str, renamed: &str) -> String {
    let mut out = String::new();
    let mut cursor = 0usize;

    for (pos, _) in word_occurrences(sql, name) {
        if pos < cursor {
            continue;
        }
        let end = pos + name.len();
        let rest = sql[end..].trim_start();

        // Definition: `name AS (`.
        let is_definition = {
            let upper = rest.to_uppercase();
            upper.starts_with("AS") && upper["AS".len()..].trim_start().starts_with('(')
        };
        // Table usage: `FROM name`, `JOIN name`, or `name.column`.
        let qualifies_column = rest.starts_with('.');
        let qualified_by = sql[..pos].trim_end().ends_with('.');
        let prev_word = previous_word(sql, pos);
        let table_position = matches!(prev_word.as_deref(), Some("FROM") | Some("JOIN"));

        let keep = is_definition || qualifies_column || (table_position && !qualified_by);

        out.push_str(&sql[cursor..pos]);
        out.push_str(if keep { name } else { renamed });
        cursor = end;
    }
    out.push_str(&sql[cursor..]);
    out
}

fn previous_word(sql: &str, before: usize) -> Option<String> {
    let head = sql[..before].trim_end();
    let start = head
        .rfind(|c: char| !is_word_char(c))
        .map(|i| i + 1)
        .unwrap_or(0);
    let word = &head[start..];
    if word.is_empty() {
        None
    } else {
        Some(word.to_uppercase())
    }
}

/// Apply `f` to every `SELECT` list (the text between a `SELECT` and
/// its matching `FROM`), innermost regions first.
pub fn rewrite_select_lists(sql: &str, f: impl Fn(&str) -> String) -> String {
    let selects = word_occurrences(sql, "SELECT");
    let mut out = sql.to_string();

    for (pos, depth) in selects.into_iter().rev() {
        let list_start = pos + "SELECT".len();
        let from = word_occurrences(&out, "FROM")
            .into_iter()
            .find(|(p, d)| *p > list_start && *d == depth);
        let Some((from_pos, _)) = from else { continue };

        let rewritten = f(&out[list_start..from_pos]);
        out.replace_range(list_start..from_pos, &rewritten);
    }
    out
}

/// Wrap bare allow-listed table names after `FROM`/`JOIN` in their
/// fully qualified form.
pub fn qualify_bare_tables(
    sql: &str,
    allow_list: &[String],
    qualify: &dyn Fn(&str) -> String,
) -> String {
    let re = regex::Regex::new(r"(?i)\b(FROM|JOIN)\s+([A-Za-z_]\w*)\b").unwrap();
    re.replace_all(sql, |caps: &regex::Captures| {
        let table = &caps[2];
        if allow_list.iter().any(|t| t == table) {
            format!("{} {}", &caps[1], qualify(table))
        } else {
            caps[0].to_string()
        }
    })
    .into_owned()
}

/// Add a `col IS NOT NULL` conjunct to the statement's top-level WHERE,
/// creating the clause if absent and preserving clause order.
pub fn inject_null_filter(sql: &str, column: &str) -> String {
    let predicate = format!("{} IS NOT NULL", column);

    if let Some((pos, depth)) = word_occurrences(sql, "WHERE")
        .iter()
        .find(|(_, d)| *d == 0)
        .copied()
    {
        let body_start = pos + "WHERE".len();
        let end = clause_end(sql, body_start, depth);
        let mut out = sql.to_string();
        let insert = format!("{} AND {} ", sql[body_start..end].trim(), predicate);
        out.replace_range(body_start..end, &format!(" {}", insert));
        return out;
    }

    // No WHERE: insert one before the first trailing clause.
    let insert_at = ["GROUP", "ORDER", "HAVING", "LIMIT", "QUALIFY"]
        .iter()
        .flat_map(|kw| word_occurrences(sql, kw))
        .filter(|(_, d)| *d == 0)
        .map(|(p, _)| p)
        .min()
        .unwrap_or(sql.len());

    let mut out = String::new();
    out.push_str(sql[..insert_at].trim_end());
    out.push_str(&format!(" WHERE {} ", predicate));
    out.push_str(&sql[insert_at..]);
    out.trim_end().to_string()
}

/// Close unbalanced parens, inserting before a top-level `LIMIT` when
/// present so the clause stays last.
pub fn close_unbalanced_parens(sql: &str) -> String {
    let mut depth = 0i32;
    for (_, c, _, quoted) in scan(sql) {
        if quoted {
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    if depth <= 0 {
        return sql.to_string();
    }

    let closers = ")".repeat(depth as usize);
    if let Some((pos, _)) = word_occurrences(sql, "LIMIT").first().copied() {
        let mut out = String::new();
        out.push_str(sql[..pos].trim_end());
        out.push_str(&closers);
        out.push(' ');
        out.push_str(&sql[pos..]);
        out
    } else {
        format!("{}{}", sql.trim_end(), closers)
    }
}
