use log::debug;

use crate::model::{TagKind, TagRecord};

const UNCATEGORIZED: &str = "Uncategorized";

/// One row of the side tag list.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayEntry {
    Header(String),
    Item(TagRecord),
}

/// Projects a flat tag list into side-list rows.
///
/// Categories are hidden unless `has_categories` is set, except the "All"
/// tag (`all_uid`). Grouped manual tags get a header on every change of
/// group. Tags with no members are left out entirely.
pub fn project(
    tags: &[TagRecord],
    has_categories: bool,
    all_uid: Option<i64>,
) -> Vec<DisplayEntry> {
    let mut entries = Vec::with_capacity(tags.len());
    let mut last_group: Option<&str> = None;
    for tag in tags {
        // Empty tags do not count as a group change, so an all-empty group has no header.
        if tag.count <= 0 {
            continue;
        }
        if tag.kind == TagKind::Category && !has_categories && Some(tag.uid) != all_uid {
            continue;
        }
        if tag.kind == TagKind::Manual {
            let group = tag.group.as_deref();
            if group != last_group {
                last_group = group;
                match group {
                    Some(name) => entries.push(DisplayEntry::Header(name.to_string())),
                    None => debug!("switched to ungrouped tags at {}", tag.name),
                }
            }
        }
        entries.push(DisplayEntry::Item(tag.clone()));
    }
    entries
}

/// Latest tag-list snapshot from the remote peer.
#[derive(Debug, Default, Clone)]
pub struct TagIndex {
    tags: Vec<TagRecord>,
    all_uid: Option<i64>,
    has_categories: bool,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn replace(&mut self, tags: Vec<TagRecord>) {
        let mut categories = tags.iter().filter(|tag| tag.kind == TagKind::Category);
        self.all_uid = categories.next().map(|tag| tag.uid);
        self.has_categories = categories.any(|tag| tag.name != UNCATEGORIZED);
        self.tags = tags;
    }

    pub fn tags(&self) -> &[TagRecord] {
        &self.tags
    }

    pub fn get(&self, uid: i64) -> Option<&TagRecord> {
        self.tags.iter().find(|tag| tag.uid == uid)
    }

    pub fn all_uid(&self) -> Option<i64> {
        self.all_uid
    }

    pub fn has_categories(&self) -> bool {
        self.has_categories
    }

    pub fn project(&self) -> Vec<DisplayEntry> {
        project(&self.tags, self.has_categories, self.all_uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(uid: i64, kind: TagKind, group: Option<&str>, count: i64) -> TagRecord {
        TagRecord {
            uid,
            name: format!("tag {uid}"),
            kind,
            group: group.map(str::to_string),
            count,
        }
    }

    fn shape(entries: &[DisplayEntry]) -> Vec<String> {
        entries
            .iter()
            .map(|entry| match entry {
                DisplayEntry::Header(name) => format!("header {name}"),
                DisplayEntry::Item(tag) => format!("item {}", tag.uid),
            })
            .collect()
    }

    #[test]
    fn headers_only_on_group_transitions() {
        let tags = vec![
            tag(1, TagKind::Manual, Some("A"), 1),
            tag(2, TagKind::Manual, Some("A"), 2),
            tag(3, TagKind::Manual, Some("B"), 3),
        ];
        assert_eq!(
            shape(&project(&tags, false, None)),
            vec!["header A", "item 1", "item 2", "header B", "item 3"]
        );
    }

    #[test]
    fn returning_to_a_group_repeats_its_header() {
        let tags = vec![
            tag(1, TagKind::Manual, Some("A"), 1),
            tag(2, TagKind::Manual, None, 1),
            tag(3, TagKind::Manual, Some("A"), 1),
        ];
        assert_eq!(
            shape(&project(&tags, false, None)),
            vec!["header A", "item 1", "item 2", "header A", "item 3"]
        );
    }

    #[test]
    fn categories_hidden_without_category_support_except_all() {
        let tags = vec![
            tag(10, TagKind::Category, None, 5),
            tag(11, TagKind::Category, None, 2),
            tag(20, TagKind::Other(0), None, 1),
        ];
        assert_eq!(
            shape(&project(&tags, false, Some(10))),
            vec!["item 10", "item 20"]
        );
        assert_eq!(
            shape(&project(&tags, true, Some(10))),
            vec!["item 10", "item 11", "item 20"]
        );
    }

    #[test]
    fn empty_tags_are_suppressed() {
        let tags = vec![
            tag(1, TagKind::Manual, Some("A"), 0),
            tag(2, TagKind::Other(2), None, 0),
            tag(3, TagKind::Manual, Some("B"), 1),
        ];
        assert_eq!(
            shape(&project(&tags, false, None)),
            vec!["header B", "item 3"]
        );
    }

    #[test]
    fn index_derives_all_tag_and_categories() {
        let mut index = TagIndex::new();
        let mut uncategorized = tag(2, TagKind::Category, None, 1);
        uncategorized.name = UNCATEGORIZED.to_string();
        index.replace(vec![
            tag(1, TagKind::Category, None, 3),
            uncategorized,
            tag(3, TagKind::Manual, None, 1),
        ]);
        assert_eq!(index.all_uid(), Some(1));
        assert!(!index.has_categories());
        assert_eq!(shape(&index.project()), vec!["item 1", "item 3"]);

        index.replace(vec![
            tag(1, TagKind::Category, None, 3),
            tag(4, TagKind::Category, None, 1),
        ]);
        assert!(index.has_categories());
        assert_eq!(index.get(4).map(|t| t.count), Some(1));
        assert_eq!(index.tags().len(), 2);
    }
}
