use serde_json::{json, Value};

/// Build an Atlassian Document Format body with one paragraph per line of `text`.
///
/// Blank lines are dropped since ADF rejects empty text nodes.
pub fn text_to_adf(text: &str) -> Value {
    let paragraphs: Vec<Value> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            json!({
                "type": "paragraph",
                "content": [{ "type": "text", "text": line }]
            })
        })
        .collect();

    json!({
        "type": "doc",
        "version": 1,
        "content": paragraphs
    })
}
