use std::collections::BTreeMap;

/// Substitute every `${NAME}` occurrence in a template with its value from
/// `vars`. Undefined names render as the empty string, which keeps rendering
/// total: a template never fails to render.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> String {
    let mut result = template.to_string();
    let mut start = 0;

    loop {
        let open = match result[start..].find("${") {
            Some(pos) => start + pos,
            None => break,
        };

        let close = match result[open..].find('}') {
            Some(pos) => open + pos,
            None => break,
        };

        let name = result[open + 2..close].to_string();
        let value = vars.get(&name).cloned().unwrap_or_default();

        result.replace_range(open..=close, &value);
        start = open + value.len();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn substitutes_named_values() {
        let v = vars(&[("A", "1"), ("B", "2")]);
        assert_eq!(render("X=${A},Y=${B}", &v), "X=1,Y=2");
    }

    #[test]
    fn missing_name_renders_empty() {
        let v = vars(&[("A", "1")]);
        assert_eq!(render("X=${A},Y=${B}", &v), "X=1,Y=");
    }

    #[test]
    fn plain_text_untouched() {
        assert_eq!(render("echo hello", &BTreeMap::new()), "echo hello");
    }

    #[test]
    fn value_containing_placeholder_is_not_rescanned() {
        let v = vars(&[("A", "${B}"), ("B", "nope")]);
        assert_eq!(render("${A}", &v), "${B}");
    }
}
