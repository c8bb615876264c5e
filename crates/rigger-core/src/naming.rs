/// Keeps alphanumerics, spaces, `_` and `-`, trims, then turns spaces into `_`.
pub fn sanitize_name(name: &str) -> String {
    let kept: String = name
        .chars()
        .filter(|ch| ch.is_alphanumeric() || matches!(ch, ' ' | '_' | '-'))
        .collect();
    let sanitized = kept.trim().replace(' ', "_");
    if sanitized.is_empty() {
        "unnamed".to_string()
    } else {
        sanitized
    }
}
