//! Tri-state database/collection selection.
//!
//! A database can be checked before its collections have been enumerated. It is
//! then stored as [`ChildSelection::All`], which means "every collection,
//! whatever they turn out to be". When the collections load, `All` resolves to
//! the full set, never to an empty one.

use std::collections::{BTreeSet, HashMap};

use super::models::Scope;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildSelection {
    /// Every child; children not enumerated yet.
    All,
    Some(BTreeSet<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    Checked,
    Partial,
    Unchecked,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionTree {
    parents: Vec<String>,
    children: HashMap<String, Vec<String>>,
    selected: HashMap<String, ChildSelection>,
}

impl SelectionTree {
    pub fn new(parents: Vec<String>) -> Self {
        Self {
            parents,
            ..Default::default()
        }
    }

    pub fn parents(&self) -> &[String] {
        &self.parents
    }

    pub fn children(&self, parent: &str) -> Option<&[String]> {
        self.children.get(parent).map(Vec::as_slice)
    }

    /// Record the enumerated children of `parent`, resolving a pending `All`.
    pub fn children_loaded(&mut self, parent: &str, children: Vec<String>) {
        if let Some(ChildSelection::All) = self.selected.get(parent) {
            let all: BTreeSet<String> = children.iter().cloned().collect();
            if all.is_empty() {
                self.selected.remove(parent);
            } else {
                self.selected
                    .insert(parent.to_string(), ChildSelection::Some(all));
            }
        } else if let Some(ChildSelection::Some(set)) = self.selected.get_mut(parent) {
            set.retain(|c| children.contains(c));
            if set.is_empty() {
                self.selected.remove(parent);
            }
        }
        self.children.insert(parent.to_string(), children);
    }

    /// Check or uncheck a parent with all of its children, loaded or not.
    pub fn set_parent(&mut self, parent: &str, checked: bool) {
        if !checked {
            self.selected.remove(parent);
            return;
        }
        let selection = match self.children.get(parent) {
            Some(children) if !children.is_empty() => {
                ChildSelection::Some(children.iter().cloned().collect())
            }
            Some(_) => return,
            None => ChildSelection::All,
        };
        self.selected.insert(parent.to_string(), selection);
    }

    /// Checked becomes unchecked; partial or unchecked becomes checked.
    pub fn toggle_parent(&mut self, parent: &str) {
        let checked = self.state(parent) == CheckState::Checked;
        self.set_parent(parent, !checked);
    }

    /// Flip one child. Toggling a child of a fully checked parent expands the
    /// parent into an explicit set first; an emptied set unchecks the parent.
    pub fn toggle_child(&mut self, parent: &str, child: &str) {
        let mut set = match self.selected.remove(parent) {
            Some(ChildSelection::Some(set)) => set,
            Some(ChildSelection::All) => self
                .children
                .get(parent)
                .map(|c| c.iter().cloned().collect())
                .unwrap_or_default(),
            None => BTreeSet::new(),
        };
        if !set.remove(child) {
            set.insert(child.to_string());
        }
        if !set.is_empty() {
            self.selected
                .insert(parent.to_string(), ChildSelection::Some(set));
        }
    }

    /// Check every parent, children included.
    pub fn select_all(&mut self) {
        for parent in self.parents.clone() {
            self.set_parent(&parent, true);
        }
    }

    pub fn clear(&mut self) {
        self.selected.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }

    /// Tri-state of a parent as shown next to it. A set covering every loaded
    /// child counts as `Checked`; with children unknown it stays `Partial`.
    pub fn state(&self, parent: &str) -> CheckState {
        match self.selected.get(parent) {
            None => CheckState::Unchecked,
            Some(ChildSelection::All) => CheckState::Checked,
            Some(ChildSelection::Some(set)) => match self.children.get(parent) {
                Some(children) if children.iter().all(|c| set.contains(c)) => CheckState::Checked,
                _ => CheckState::Partial,
            },
        }
    }

    pub fn is_child_selected(&self, parent: &str, child: &str) -> bool {
        match self.selected.get(parent) {
            Some(ChildSelection::All) => true,
            Some(ChildSelection::Some(set)) => set.contains(child),
            None => false,
        }
    }

    /// The ordered selection for a transfer of the given scope.
    ///
    /// Connection scope yields database names, or `db.collection` for partly
    /// selected databases. Database scope yields that database's collections,
    /// which must have been loaded.
    pub fn items_for(&self, scope: &Scope) -> Vec<String> {
        match scope {
            Scope::Connection => {
                let mut items = Vec::new();
                for parent in &self.parents {
                    match self.state(parent) {
                        CheckState::Checked => items.push(parent.clone()),
                        CheckState::Partial => items.extend(
                            self.selected_children(parent)
                                .into_iter()
                                .map(|c| format!("{parent}.{c}")),
                        ),
                        CheckState::Unchecked => {}
                    }
                }
                items
            }
            Scope::Database { database } => self.selected_children(database),
            Scope::Collection {
                database,
                collection,
            } => {
                if self.is_child_selected(database, collection) {
                    vec![collection.clone()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    fn selected_children(&self, parent: &str) -> Vec<String> {
        self.children
            .get(parent)
            .map(|children| {
                children
                    .iter()
                    .filter(|c| self.is_child_selected(parent, c))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}
