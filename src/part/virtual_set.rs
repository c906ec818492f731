//! Set of parts a replica expects to materialise.

use std::{collections::BTreeSet, ops::Bound};

use crate::part::PartInfo;

/// Ordered set of part infos with covering-part queries.
///
/// Adding a part prunes every stored part it strictly contains, so the set
/// always holds the maximal cover of everything ever added.
#[derive(Debug, Clone, Default)]
pub struct VirtualPartSet {
    parts: BTreeSet<PartInfo>,
}

impl VirtualPartSet {
    /// Insert a part, dropping stored parts it covers.
    pub fn add(&mut self, info: PartInfo) {
        let covered: Vec<PartInfo> = self
            .partition_parts(&info.partition_id)
            .filter(|stored| *stored != &info && info.contains(stored))
            .cloned()
            .collect();
        for part in covered {
            self.parts.remove(&part);
        }
        self.parts.insert(info);
    }

    /// The stored part covering `info`, if any. A part covers itself.
    pub fn get_containing_part(&self, info: &PartInfo) -> Option<&PartInfo> {
        self.partition_parts(&info.partition_id)
            .find(|stored| stored.contains(info))
    }

    /// Names of stored parts covered by `info`, in part order.
    pub fn parts_covered_by(&self, info: &PartInfo) -> Vec<String> {
        self.partition_parts(&info.partition_id)
            .filter(|stored| info.contains(stored))
            .map(PartInfo::name)
            .collect()
    }

    /// Number of stored parts.
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// Returns `true` when nothing has been added.
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Iterate all stored parts in order.
    pub fn iter(&self) -> impl Iterator<Item = &PartInfo> {
        self.parts.iter()
    }

    fn partition_parts<'a>(&'a self, partition_id: &str) -> impl Iterator<Item = &'a PartInfo> {
        // Parts order by partition id first, so one partition is a contiguous
        // range delimited by the smallest id strictly above it.
        let floor = PartInfo {
            partition_id: partition_id.to_owned(),
            min_block: i64::MIN,
            max_block: i64::MIN,
            level: 0,
            mutation: i64::MIN,
        };
        let ceiling = PartInfo {
            partition_id: format!("{partition_id}\0"),
            min_block: i64::MIN,
            max_block: i64::MIN,
            level: 0,
            mutation: i64::MIN,
        };
        self.parts
            .range((Bound::Included(floor), Bound::Excluded(ceiling)))
    }
}
