pub const EVENT_NAME_FIELD: &str = "event_name";

// Mixpanel's own name for the event type property
const EVENT_NAME_PROPERTY: &str = "$event_name";

/// Turns an arbitrary Mixpanel property name into something usable as a schema field name:
/// only `[A-Za-z0-9_]`, no leading/trailing underscores, never starting with a digit.
///
/// Names made up entirely of symbols come back empty. Callers building a schema are expected
/// to reject those rather than produce an unnamed field.
pub fn escape_field_name(field_name: &str) -> String {
    if field_name == EVENT_NAME_PROPERTY {
        return EVENT_NAME_FIELD.to_string();
    }

    let replaced: String = field_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let stripped = replaced.trim_matches('_');

    match stripped.chars().next() {
        Some(first) if first.is_ascii_digit() => format!("_{stripped}"),
        _ => stripped.to_string(),
    }
}
