/// Replace `${VAR}` and `${VAR:-fallback}` placeholders in raw config text.
///
/// A variable with no value and no fallback is left as-is so the parse error
/// (if any) points at the placeholder.
pub fn substitute_env(input: &str) -> String {
    substitute_with(input, |name| std::env::var(name).ok())
}

fn substitute_with(input: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            // Unterminated: emit the remainder literally.
            result.push_str(&rest[start..]);
            return result;
        };
        let expr = &after[..end];
        let (name, fallback) = match expr.split_once(":-") {
            Some((name, fallback)) => (name, Some(fallback)),
            None => (expr, None),
        };
        match (lookup(name).filter(|v| !v.is_empty()), fallback) {
            _ if name.is_empty() => result.push_str(&rest[start..start + 3 + end]),
            (Some(value), _) => result.push_str(&value),
            (None, Some(fallback)) => result.push_str(fallback),
            (None, None) => result.push_str(&rest[start..start + 3 + end]),
        }
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    result
}
