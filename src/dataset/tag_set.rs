use std::collections::{BTreeMap, HashSet};
use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Runs of whitespace left behind once underscores become spaces
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

/// Turns a raw board tag into its dataset form (`long_hair` -> `long hair`).
pub fn normalize_tag(raw: &str) -> String {
    let spaced = raw.replace('_', " ");
    WHITESPACE_RUN.replace_all(spaced.trim(), " ").into_owned()
}

/// Ordered, duplicate-free collection of tags.
///
/// Insertion order is first-seen order. Rewrite rules substitute a tag in
/// place, so a rewritten tag keeps the position of the tag it replaced.
#[derive(Debug, Clone, Default)]
pub struct TagSet {
    tags: Vec<String>,
    seen: HashSet<String>,
    rewrites: BTreeMap<String, String>,
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty set that applies `rewrites` (`from -> to`) on insertion.
    pub fn with_rewrites(rewrites: &BTreeMap<String, String>) -> Self {
        let rewrites = rewrites
            .iter()
            .map(|(from, to)| (normalize_tag(from), normalize_tag(to)))
            .filter(|(from, to)| !from.is_empty() && !to.is_empty())
            .collect();
        Self {
            rewrites,
            ..Self::default()
        }
    }

    /// Builds a set from raw tags, keeping the first occurrence of each.
    pub fn from_raw<I, S>(raw: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = Self::new();
        set.extend(raw);
        set
    }

    /// Normalizes and inserts a tag. Returns `false` for empty or duplicate tags.
    pub fn insert(&mut self, raw: &str) -> bool {
        let mut tag = normalize_tag(raw);
        if tag.is_empty() {
            return false;
        }
        if let Some(replacement) = self.rewrites.get(&tag) {
            tag = replacement.clone();
        }
        if self.contains(&tag) {
            return false;
        }
        self.seen.insert(tag.clone());
        self.tags.push(tag);
        true
    }

    /// Puts a tag at the front, removing any later copy of it.
    pub fn insert_first(&mut self, raw: &str) {
        let tag = normalize_tag(raw);
        if tag.is_empty() {
            return;
        }
        self.tags.retain(|existing| existing != &tag);
        self.seen.insert(tag.clone());
        self.tags.insert(0, tag);
    }

    pub fn extend<I, S>(&mut self, raw: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for tag in raw {
            self.insert(tag.as_ref());
        }
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.seen.contains(tag)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    /// Tag file form: comma-joined, no spaces added.
    pub fn to_tag_line(&self) -> String {
        self.to_string()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.tags
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, tag) in self.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            f.write_str(tag)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keeps_first_seen_order() {
        let set = TagSet::from_raw(["a", "b", "a", "c", "b"]);
        assert_eq!(set.iter().collect::<Vec<_>>(), ["a", "b", "c"]);
    }

    #[test]
    fn test_underscores_become_spaces_before_dedup() {
        let set = TagSet::from_raw(["long_hair", "long hair", "  blue__eyes "]);
        assert_eq!(set.iter().collect::<Vec<_>>(), ["long hair", "blue eyes"]);
        assert_eq!(set.to_tag_line(), "long hair,blue eyes");
    }

    #[test]
    fn test_empty_tags_are_dropped() {
        let mut set = TagSet::new();
        assert!(!set.insert(""));
        assert!(!set.insert("___"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_rewrite_keeps_position() {
        let mut rewrites = BTreeMap::new();
        rewrites.insert("1girl".to_string(), "solo_female".to_string());
        let mut set = TagSet::with_rewrites(&rewrites);

        set.extend(["cat", "1girl", "smile"]);

        assert_eq!(set.iter().collect::<Vec<_>>(), ["cat", "solo female", "smile"]);
    }

    #[test]
    fn test_rewrite_target_already_present_is_not_duplicated() {
        let mut rewrites = BTreeMap::new();
        rewrites.insert("kitty".to_string(), "cat".to_string());
        let mut set = TagSet::with_rewrites(&rewrites);

        set.extend(["cat", "kitty", "dog"]);

        assert_eq!(set.iter().collect::<Vec<_>>(), ["cat", "dog"]);
    }

    #[test]
    fn test_insert_first_moves_existing_tag() {
        let mut set = TagSet::from_raw(["a", "B2", "c"]);
        set.insert_first("B2");
        assert_eq!(set.iter().collect::<Vec<_>>(), ["B2", "a", "c"]);
        assert!(set.contains("B2"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_tag_line_matches_display() {
        let set = TagSet::from_raw(["cat", "long_hair"]);
        assert_eq!(set.to_tag_line(), "cat,long hair");
        assert_eq!(set.to_string(), set.to_tag_line());
        assert_eq!(TagSet::new().to_tag_line(), "");
    }
}
