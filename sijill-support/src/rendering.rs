//! Text rendering for container diagnostics.
//!
//! Error messages and plan listings go through these helpers so that
//! cycles, candidate lists and type names look the same everywhere.

use std::fmt::Write as _;

/// Joins a dependency cycle into a single arrow-separated line.
///
/// # Examples
/// ```
/// use sijill_support::rendering::render_cycle;
///
/// let cycle = ["orders", "billing", "orders"];
/// assert_eq!(render_cycle(&cycle), "orders → billing → orders");
/// ```
pub fn render_cycle(chain: &[impl AsRef<str>]) -> String {
    let parts: Vec<&str> = chain.iter().map(AsRef::as_ref).collect();
    parts.join(" → ")
}

/// Renders a comma separated, quoted list of ids.
///
/// ```
/// use sijill_support::rendering::render_id_list;
///
/// assert_eq!(render_id_list(&["a", "b"]), "'a', 'b'");
/// ```
pub fn render_id_list(ids: &[impl AsRef<str>]) -> String {
    let quoted: Vec<String> = ids.iter().map(|id| format!("'{}'", id.as_ref())).collect();
    quoted.join(", ")
}

/// One line of an instantiation plan listing.
#[derive(Debug, Clone)]
pub struct PlanLine {
    /// Definition id
    pub id: String,
    /// Scope name (e.g. "singleton", "request")
    pub scope: String,
    /// Short name of the produced type
    pub type_name: String,
    /// Ids this step is bound to, in declaration order
    pub binds: Vec<String>,
}

/// Renders an instantiation plan, one numbered step per line.
///
/// ```text
/// 1. [singleton] config : Config
/// 2. [singleton] db     : Database  <- config
/// 3. [prototype] repo   : UserRepo  <- db
/// ```
pub fn render_plan(lines: &[PlanLine]) -> String {
    let scope_width = lines.iter().map(|l| l.scope.len()).max().unwrap_or(0);
    let id_width = lines.iter().map(|l| l.id.len()).max().unwrap_or(0);

    let mut out = String::new();
    for (i, line) in lines.iter().enumerate() {
        let _ = write!(
            out,
            "{:>2}. [{:<sw$}] {:<iw$} : {}",
            i + 1,
            line.scope,
            line.id,
            line.type_name,
            sw = scope_width,
            iw = id_width,
        );
        if !line.binds.is_empty() {
            let _ = write!(out, "  <- {}", line.binds.join(", "));
        }
        out.push('\n');
    }
    out
}

/// Drops module paths from a fully qualified type name.
///
/// ```
/// use sijill_support::rendering::short_type_name;
///
/// assert_eq!(short_type_name("shop::billing::Invoice"), "Invoice");
/// assert_eq!(
///     short_type_name("alloc::sync::Arc<dyn shop::Clock + core::marker::Send>"),
///     "Arc<dyn Clock + Send>"
/// );
/// ```
pub fn short_type_name(full: &str) -> String {
    let mut out = String::with_capacity(full.len());
    let mut segment = String::new();
    let mut chars = full.chars().peekable();

    while let Some(ch) = chars.next() {
        match ch {
            ':' if chars.peek() == Some(&':') => {
                chars.next();
                segment.clear();
            }
            '<' | '>' | ',' | ' ' | '(' | ')' | '&' | '[' | ']' | ';' => {
                out.push_str(&segment);
                out.push(ch);
                segment.clear();
            }
            _ => segment.push(ch),
        }
    }
    out.push_str(&segment);
    out
}

/// Picks registered ids that look like a misspelling of `requested`.
///
/// Substring hits rank first, then shared prefixes of three or more
/// characters. At most `limit` ids are returned, best first.
pub fn suggest_similar(requested: &str, available: &[&str], limit: usize) -> Vec<String> {
    let wanted = requested.to_lowercase();

    let mut scored: Vec<(usize, &str)> = available
        .iter()
        .filter_map(|&candidate| {
            let lower = candidate.to_lowercase();
            if lower == wanted {
                return None;
            }
            if lower.contains(&wanted) || wanted.contains(&lower) {
                return Some((1000, candidate));
            }
            let prefix = lower
                .chars()
                .zip(wanted.chars())
                .take_while(|(a, b)| a == b)
                .count();
            (prefix >= 3).then_some((prefix, candidate))
        })
        .collect();

    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(b.1)));
    scored
        .into_iter()
        .take(limit)
        .map(|(_, id)| id.to_string())
        .collect()
}
