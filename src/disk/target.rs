//! Device target naming.
//!
//! A target is a device prefix followed by one letter (`hda`, `vdb`, ...).
//! Each queued disk takes the first letter not used yet on its prefix.
use std::collections::BTreeSet;

/// Letters available after a device prefix
pub const TARGET_LETTERS: u8 = 26;

/// Assigns a target to every `(prefix, key)` pair, in queue order, and
/// records it in `used`.
///
/// When the 26 letters of a prefix are all taken the last candidate (`z`) is
/// kept even though it collides.
pub fn assign_disk_targets<K, I>(queue: I, used: &mut BTreeSet<String>) -> Vec<(K, String)>
where
    I: IntoIterator<Item = (String, K)>,
{
    queue
        .into_iter()
        .map(|(prefix, key)| {
            let mut index = 0;
            let target = loop {
                let candidate = format!("{}{}", prefix, char::from(b'a' + index));
                index += 1;
                if !used.contains(&candidate) || index >= TARGET_LETTERS {
                    break candidate;
                }
            };
            used.insert(target.clone());
            (key, target)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn used(targets: &[&str]) -> BTreeSet<String> {
        targets.iter().map(|t| t.to_string()).collect()
    }

    #[test]
    fn lowest_free_letter() {
        let mut used = used(&["hda", "hdc"]);
        let assigned = assign_disk_targets(
            vec![
                ("hd".to_string(), 0),
                ("hd".to_string(), 1),
                ("vd".to_string(), 2),
            ],
            &mut used,
        );
        assert_eq!(
            assigned,
            vec![
                (0, "hdb".to_string()),
                (1, "hdd".to_string()),
                (2, "vda".to_string())
            ]
        );
        assert!(used.contains("vda"));
        assert_eq!(used.len(), 5);
    }

    #[test]
    fn exhausted_prefix_keeps_last_letter() {
        let mut used: BTreeSet<String> = (b'a'..=b'z')
            .map(|c| format!("sd{}", char::from(c)))
            .collect();
        let assigned = assign_disk_targets(vec![("sd".to_string(), ())], &mut used);
        assert_eq!(assigned, vec![((), "sdz".to_string())]);
        assert_eq!(used.len(), 26);
    }

    #[test]
    fn deterministic() {
        let queue = || vec![("vd".to_string(), "a"), ("vd".to_string(), "b")];
        let first = assign_disk_targets(queue(), &mut BTreeSet::new());
        let second = assign_disk_targets(queue(), &mut BTreeSet::new());
        assert_eq!(first, second);
    }
}
