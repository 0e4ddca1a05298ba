use crate::entity::Entity;

/// How a turn's parsed entities combine with what was already shown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MergeMode {
    /// Parsed entities supersede the existing ones (first turn, regenerate).
    #[default]
    Replace,
    /// Parsed entities follow a snapshot taken when the turn started
    /// (generate more).
    Append,
}

/// Combines `head` (the snapshot taken at turn start) with the entities
/// parsed so far in this turn.
///
/// Order is kept as given. Nothing is sorted or deduplicated.
pub fn merge(head: &[Entity], parsed: Vec<Entity>, mode: MergeMode) -> Vec<Entity> {
    match mode {
        MergeMode::Replace => parsed,
        MergeMode::Append => {
            let mut merged = Vec::with_capacity(head.len() + parsed.len());
            merged.extend_from_slice(head);
            merged.extend(parsed);
            merged
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(title: &str) -> Entity {
        Entity::default().with("title", title)
    }

    fn titles(entities: &[Entity]) -> Vec<&str> {
        entities.iter().filter_map(Entity::title).collect()
    }

    #[test]
    fn replace_discards_head() {
        let merged = merge(&[card("A")], vec![card("B")], MergeMode::Replace);
        assert_eq!(titles(&merged), vec!["B"]);
    }

    #[test]
    fn append_rebuilds_tail_from_same_head() {
        let head = vec![card("A")];
        let first = merge(&head, vec![card("B")], MergeMode::Append);
        assert_eq!(titles(&first), vec!["A", "B"]);
        let second = merge(&head, vec![card("B"), card("C")], MergeMode::Append);
        assert_eq!(titles(&second), vec!["A", "B", "C"]);
    }

    #[test]
    fn duplicates_are_kept() {
        let merged = merge(&[card("A")], vec![card("A")], MergeMode::Append);
        assert_eq!(titles(&merged), vec!["A", "A"]);
    }
}
