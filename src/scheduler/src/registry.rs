// Copyright 2024 Zinc Labs Inc.
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

use dashmap::DashSet;

/// In-process tracking of events currently owned (locked) by this replica,
/// one set per event class. Mutated by the Processor as it claims and
/// releases rows, and read by the shutdown hook, which snapshots both sets
/// before calling `unlock_cron` / `unlock_oneoff`.
#[derive(Default)]
pub struct LockedEventsCtx {
    cron_locked: DashSet<String>,
    oneoff_locked: DashSet<String>,
}

pub enum EventClass {
    Cron,
    OneOff,
}

impl LockedEventsCtx {
    pub fn new() -> Self {
        Self::default()
    }

    fn set_for(&self, class: &EventClass) -> &DashSet<String> {
        match class {
            EventClass::Cron => &self.cron_locked,
            EventClass::OneOff => &self.oneoff_locked,
        }
    }

    pub fn insert_many(&self, class: &EventClass, ids: impl IntoIterator<Item = String>) {
        let set = self.set_for(class);
        for id in ids {
            set.insert(id);
        }
    }

    pub fn remove(&self, class: &EventClass, id: &str) {
        self.set_for(class).remove(id);
    }

    pub fn snapshot(&self, class: &EventClass) -> Vec<String> {
        self.set_for(class).iter().map(|r| r.clone()).collect()
    }

    pub fn cron_snapshot(&self) -> Vec<String> {
        self.snapshot(&EventClass::Cron)
    }

    pub fn oneoff_snapshot(&self) -> Vec<String> {
        self.snapshot(&EventClass::OneOff)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn insert_then_snapshot_then_remove() {
        let ctx = LockedEventsCtx::new();
        ctx.insert_many(&EventClass::Cron, vec!["a".to_string(), "b".to_string()]);
        let mut snap = ctx.cron_snapshot();
        snap.sort();
        assert_eq!(snap, vec!["a".to_string(), "b".to_string()]);

        ctx.remove(&EventClass::Cron, "a");
        assert_eq!(ctx.cron_snapshot(), vec!["b".to_string()]);
    }

    #[test]
    fn cron_and_oneoff_sets_are_disjoint() {
        let ctx = LockedEventsCtx::new();
        ctx.insert_many(&EventClass::Cron, vec!["shared-id".to_string()]);
        assert!(ctx.oneoff_snapshot().is_empty());
        ctx.insert_many(&EventClass::OneOff, vec!["shared-id".to_string()]);
        assert_eq!(ctx.cron_snapshot(), vec!["shared-id".to_string()]);
        assert_eq!(ctx.oneoff_snapshot(), vec!["shared-id".to_string()]);
    }

    #[tokio::test]
    async fn tolerates_concurrent_mutation() {
        let ctx = Arc::new(LockedEventsCtx::new());
        let mut handles = Vec::new();
        for i in 0..50 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                ctx.insert_many(&EventClass::Cron, vec![format!("id-{i}")]);
                ctx.remove(&EventClass::Cron, &format!("id-{i}"));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(ctx.cron_snapshot().is_empty());
    }
}
