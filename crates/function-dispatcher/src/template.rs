//! `${path}`-style template rendering over a JSON context (spec §4.7
//! "Response rendering").

/// Render `template`, replacing each `${a.b.c}` with the dotted-path
/// lookup into `context` (stringified; missing paths render as an empty
/// string). Rendering never fails — a malformed reference is just
/// missing data, and the caller maps empty required fields to a
/// permanent-failure error code per spec.
pub fn render(template: &str, context: &serde_json::Value) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                out.push_str(&lookup(context, &after[..end]));
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

fn lookup(context: &serde_json::Value, path: &str) -> String {
    let mut current = context;
    for segment in path.split('.') {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    match current {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}
