//! Bootstrapping from a pre-`permanent_id` on-disk layout.
//!
//! Grounded on `dingaiminGIT-vmark`'s `hot_exit::migration`: the legacy
//! shape is deserialized permissively (every field optional, via
//! `#[serde(default)]`), then migrated once into the current
//! [`super::OnDiskState`]. Unlike the teacher's step-wise version ladder
//! (there is only one legacy shape to migrate from here), the same
//! single-pass, idempotent contract applies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{Space, TabKind, TabRecord};

use super::{OnDiskState, SCHEMA_VERSION};

/// A single legacy space record, keyed by window id in the old layout
/// rather than by a stable permanent id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LegacySpace {
    pub urls: Vec<String>,
    pub created_at: Option<i64>,
    pub last_modified: Option<i64>,
}

/// The legacy top-level record: one optional map per logical collection,
/// plus the separate custom-name and permanent-id side tables the old
/// layout kept apart from the space records themselves.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct LegacyLayout {
    pub spaces: HashMap<String, LegacySpace>,
    pub closed_spaces: HashMap<String, LegacySpace>,
    pub custom_names: HashMap<String, String>,
    pub permanent_ids: HashMap<String, String>,
}

impl LegacyLayout {
    /// Migrates this layout into a fresh [`OnDiskState`]. Legacy custom
    /// names become `name` with `named=true`; a missing `permanent_id` is
    /// allocated; `tabs` rows are seeded from each space's `urls`.
    pub fn migrate(self) -> OnDiskState {
        let now = crate::model::now_ms();
        let mut state = OnDiskState {
            schema_version: SCHEMA_VERSION,
            ..Default::default()
        };

        migrate_collection(
            &self.spaces,
            &self.custom_names,
            &self.permanent_ids,
            now,
            true,
            &mut state,
        );
        migrate_collection(
            &self.closed_spaces,
            &self.custom_names,
            &self.permanent_ids,
            now,
            false,
            &mut state,
        );

        state
    }
}

fn migrate_collection(
    legacy: &HashMap<String, LegacySpace>,
    custom_names: &HashMap<String, String>,
    permanent_ids: &HashMap<String, String>,
    now: i64,
    active: bool,
    state: &mut OnDiskState,
) {
    for (window_key, legacy_space) in legacy {
        let permanent_id = permanent_ids
            .get(window_key)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        let name = custom_names.get(window_key).cloned();
        let named = name.is_some();

        let space = Space {
            permanent_id,
            name: name.unwrap_or_else(|| crate::model::default_name(1)),
            named,
            urls: legacy_space.urls.clone(),
            window_id: if active { Some(window_key.clone()) } else { None },
            is_active: active,
            version: 1,
            created_at: legacy_space.created_at.unwrap_or(now),
            last_modified: legacy_space.last_modified.unwrap_or(now),
            last_used: now,
            last_sync: now,
        };

        let kind = if active { TabKind::Active } else { TabKind::Closed };
        let rows = TabRecord::from_urls(permanent_id, kind, &legacy_space.urls, now);
        state.tabs.extend(rows);

        if active {
            state.spaces.insert(permanent_id, space);
            state.permanent_id_map.insert(window_key.clone(), permanent_id);
        } else {
            state.closed_spaces.insert(permanent_id, space);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_name_becomes_named_space() {
        let mut legacy = LegacyLayout::default();
        legacy.spaces.insert(
            "12".to_string(),
            LegacySpace {
                urls: vec!["https://a".into()],
                created_at: None,
                last_modified: None,
            },
        );
        legacy.custom_names.insert("12".to_string(), "Work".to_string());

        let migrated = legacy.migrate();
        assert_eq!(migrated.spaces.len(), 1);
        let space = migrated.spaces.values().next().unwrap();
        assert_eq!(space.name, "Work");
        assert!(space.named);
        assert!(space.is_active);
    }

    #[test]
    fn missing_permanent_id_is_allocated() {
        let mut legacy = LegacyLayout::default();
        legacy.closed_spaces.insert(
            "old-key".to_string(),
            LegacySpace {
                urls: vec!["https://a".into(), "https://b".into()],
                created_at: Some(100),
                last_modified: Some(200),
            },
        );

        let migrated = legacy.migrate();
        assert_eq!(migrated.closed_spaces.len(), 1);
        let (id, space) = migrated.closed_spaces.iter().next().unwrap();
        assert!(!space.named);
        assert!(!space.is_active);
        assert_eq!(migrated.tabs_for(*id, TabKind::Closed).len(), 2);
    }
}
