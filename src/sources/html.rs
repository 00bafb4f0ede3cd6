//! Minimal HTML table extraction.
//!
//! Enough to pull cell text out of a server-rendered `<table>`: locate the
//! table by class, walk `<tr>` blocks, collect `<td>` text with tags
//! stripped and common entities decoded. ASCII lower-casing keeps byte
//! offsets aligned between the source text and its lowered copy.

/// Inner HTML of the first `<table>` whose `class` attribute contains `class`.
pub fn table_by_class<'a>(html: &'a str, class: &str) -> Option<&'a str> {
    let lc = html.to_ascii_lowercase();
    let class = class.to_ascii_lowercase();
    let mut from = 0;

    while let Some(rel) = lc[from..].find("<table") {
        let start = from + rel;
        let open_end = start + lc[start..].find('>')?;
        let open_tag = &lc[start..open_end];
        if has_class(open_tag, &class) {
            let close = open_end + lc[open_end..].find("</table")?;
            return Some(&html[open_end + 1..close]);
        }
        from = open_end;
    }
    None
}

fn has_class(open_tag: &str, class: &str) -> bool {
    let Some(pos) = open_tag.find("class=") else {
        return false;
    };
    let rest = &open_tag[pos + "class=".len()..];
    let value = match rest.chars().next() {
        Some(q @ ('"' | '\'')) => rest[1..].split(q).next().unwrap_or(""),
        _ => rest.split(|c: char| c.is_whitespace()).next().unwrap_or(""),
    };
    value.split_whitespace().any(|c| c == class)
}

/// Text of every `<td>` cell, row by row. Rows without `<td>` (header rows
/// built from `<th>`) are left out.
pub fn data_rows(table: &str) -> Vec<Vec<String>> {
    let lc = table.to_ascii_lowercase();
    let mut rows = Vec::new();
    let mut from = 0;

    while let Some(rel) = lc[from..].find("<tr") {
        let start = from + rel;
        let end = lc[start + 3..]
            .find("<tr")
            .map(|e| start + 3 + e)
            .unwrap_or(lc.len());
        let cells = cells(&table[start..end], &lc[start..end]);
        if !cells.is_empty() {
            rows.push(cells);
        }
        from = end;
    }
    rows
}

fn cells(row: &str, lc: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut from = 0;

    while let Some(rel) = lc[from..].find("<td") {
        let start = from + rel;
        let Some(open_end) = lc[start..].find('>').map(|e| start + e + 1) else {
            break;
        };
        let close = lc[open_end..]
            .find("</td")
            .or_else(|| lc[open_end..].find("<td"))
            .map(|e| open_end + e)
            .unwrap_or(lc.len());
        out.push(cell_text(&row[open_end..close]));
        from = close;
    }
    out
}

/// Strip tags, decode entities, collapse whitespace.
pub fn cell_text(fragment: &str) -> String {
    let mut text = String::with_capacity(fragment.len());
    let mut in_tag = false;
    for ch in fragment.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => text.push(ch),
            _ => {}
        }
    }
    decode_entities(&text)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn decode_entities(s: &str) -> String {
    if !s.contains('&') {
        return s.to_string();
    }
    s.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
