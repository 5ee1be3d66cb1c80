//! Projection of primary store rows into search documents.

use crate::domain::ports::{ContentItem, IndexDocument};

/// Parse the stored tags column.
///
/// The column holds a JSON array of strings. A value that is not valid JSON
/// is kept as a single tag rather than lost.
pub fn parse_tags(raw: Option<&str>) -> Vec<String> {
    let raw = match raw.map(str::trim) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Vec::new(),
    };

    match serde_json::from_str::<Vec<String>>(raw) {
        Ok(tags) => tags.into_iter().filter(|t| !t.is_empty()).collect(),
        Err(_) => vec![raw.to_string()],
    }
}

impl From<&ContentItem> for IndexDocument {
    fn from(item: &ContentItem) -> Self {
        Self {
            id: item.id.as_u64(),
            title: item.title.clone().unwrap_or_default(),
            content: item.content.clone().unwrap_or_default(),
            tags: parse_tags(item.tags.as_deref()),
            answer: item.answer.clone().unwrap_or_default(),
            user_id: item.user_id.as_u64(),
            edit_time: item.edit_time,
            create_time: item.create_time,
            update_time: item.update_time,
            is_delete: u8::from(item.is_delete),
        }
    }
}
