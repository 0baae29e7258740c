//! Named collections of plots with per-group visibility.
//!
//! Plots may appear in multiple groups; a group references them by name
//! so identity stays with the `PlotHandler`. Renaming a plot therefore
//! has to be propagated across all groups.

use std::sync::Mutex;

/// Fallback group name created when the last group is removed.
const DEFAULT_GROUP: &str = "new group0";

/// One entry of a group: a plot name and whether it is shown while this
/// group is active.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub plot_name: String,
    pub visible: bool,
}

/// An insertion-ordered set of plots.
#[derive(Debug, Clone)]
pub struct PlotGroup {
    name: String,
    entries: Vec<GroupEntry>,
}

impl PlotGroup {
    pub fn new(name: impl Into<String>) -> Self {
        PlotGroup {
            name: name.into(),
            entries: vec![],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_plot(&mut self, plot_name: &str, visible: bool) {
        match self.entries.iter_mut().find(|e| e.plot_name == plot_name) {
            Some(entry) => entry.visible = visible,
            None => self.entries.push(GroupEntry {
                plot_name: plot_name.to_string(),
                visible,
            }),
        }
    }

    pub fn remove_plot(&mut self, plot_name: &str) {
        self.entries.retain(|e| e.plot_name != plot_name);
    }

    pub fn set_visibility(&mut self, plot_name: &str, visible: bool) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.plot_name == plot_name) {
            entry.visible = visible;
        }
    }

    pub fn visibility(&self, plot_name: &str) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| e.plot_name == plot_name)
            .map(|e| e.visible)
    }

    pub fn rename_plot(&mut self, old: &str, new: &str) -> bool {
        match self.entries.iter_mut().find(|e| e.plot_name == old) {
            Some(entry) => {
                entry.plot_name = new.to_string();
                true
            }
            None => false,
        }
    }

    pub fn entries(&self) -> &[GroupEntry] {
        &self.entries
    }

    pub fn visible_plot_count(&self) -> usize {
        self.entries.iter().filter(|e| e.visible).count()
    }
}

/// Owns the set of groups and the active-group selector.
///
/// Invariant: if any groups exist, exactly one is active. If the active
/// name is absent, the first group takes over. Removing the last group
/// auto-creates a default so the GUI always has something to render.
#[derive(Default)]
pub struct PlotGroupHandler {
    state: Mutex<GroupState>,
}

#[derive(Default)]
struct GroupState {
    groups: Vec<PlotGroup>,
    active: String,
}

impl PlotGroupHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        if !state.groups.iter().any(|g| g.name == name) {
            state.groups.push(PlotGroup::new(name));
        }
        if state.active.is_empty() {
            state.active = name.to_string();
        }
    }

    pub fn remove_group(&self, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.groups.retain(|g| g.name != name);

        if state.groups.is_empty() {
            state.groups.push(PlotGroup::new(DEFAULT_GROUP));
        }
        state.active = state.groups[0].name.clone();
    }

    pub fn remove_all_groups(&self) {
        let mut state = self.state.lock().unwrap();
        state.groups.clear();
        state.active.clear();
    }

    pub fn rename_group(&self, old: &str, new: &str) {
        let mut state = self.state.lock().unwrap();
        if state.active == old {
            state.active = new.to_string();
        }
        if let Some(group) = state.groups.iter_mut().find(|g| g.name == old) {
            group.name = new.to_string();
        }
    }

    /// Propagates a plot rename to every group that references it.
    pub fn rename_plot_in_all_groups(&self, old: &str, new: &str) {
        let mut state = self.state.lock().unwrap();
        for group in state.groups.iter_mut() {
            group.rename_plot(old, new);
        }
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().unwrap().groups.len()
    }

    pub fn group_exists(&self, name: &str) -> bool {
        self.state.lock().unwrap().groups.iter().any(|g| g.name == name)
    }

    pub fn set_active_group(&self, name: &str) {
        self.state.lock().unwrap().active = name.to_string();
    }

    /// Name of the active group, falling back to the first group when
    /// the stored name no longer exists.
    pub fn active_group_name(&self) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        if !state.groups.iter().any(|g| g.name == state.active) {
            state.active = state.groups.first()?.name.clone();
        }
        Some(state.active.clone())
    }

    /// Snapshot of the active group.
    pub fn active_group(&self) -> Option<PlotGroup> {
        let name = self.active_group_name()?;
        self.state
            .lock()
            .unwrap()
            .groups
            .iter()
            .find(|g| g.name == name)
            .cloned()
    }

    /// Runs `f` with the named group locked for mutation.
    pub fn with_group<R>(&self, name: &str, f: impl FnOnce(&mut PlotGroup) -> R) -> Option<R> {
        let mut state = self.state.lock().unwrap();
        state.groups.iter_mut().find(|g| g.name == name).map(f)
    }

    /// Snapshot of all groups in insertion order.
    pub fn groups(&self) -> Vec<PlotGroup> {
        self.state.lock().unwrap().groups.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_group_becomes_active() {
        let handler = PlotGroupHandler::new();
        handler.add_group("alpha");
        handler.add_group("beta");
        assert_eq!(handler.active_group_name().as_deref(), Some("alpha"));

        handler.set_active_group("beta");
        assert_eq!(handler.active_group_name().as_deref(), Some("beta"));
    }

    #[test]
    fn absent_active_falls_back_to_first() {
        let handler = PlotGroupHandler::new();
        handler.add_group("alpha");
        handler.add_group("beta");
        handler.set_active_group("gone");
        assert_eq!(handler.active_group_name().as_deref(), Some("alpha"));
    }

    #[test]
    fn removing_last_group_creates_default() {
        let handler = PlotGroupHandler::new();
        handler.add_group("only");
        handler.remove_group("only");

        assert_eq!(handler.group_count(), 1);
        assert_eq!(handler.active_group_name().as_deref(), Some("new group0"));
    }

    #[test]
    fn rename_propagates_to_all_groups() {
        let handler = PlotGroupHandler::new();
        handler.add_group("a");
        handler.add_group("b");
        handler.with_group("a", |g| g.add_plot("speed", true));
        handler.with_group("b", |g| g.add_plot("speed", false));

        handler.rename_plot_in_all_groups("speed", "velocity");

        for group in handler.groups() {
            assert!(group.visibility("velocity").is_some());
            assert!(group.visibility("speed").is_none());
        }
        // per-group visibility survives the rename
        assert_eq!(handler.groups()[0].visibility("velocity"), Some(true));
        assert_eq!(handler.groups()[1].visibility("velocity"), Some(false));
    }

    #[test]
    fn shared_plot_keeps_per_group_visibility() {
        let handler = PlotGroupHandler::new();
        handler.add_group("g");
        handler.with_group("g", |g| {
            g.add_plot("p1", true);
            g.add_plot("p2", true);
            g.set_visibility("p2", false);
        });

        let group = handler.active_group().unwrap();
        assert_eq!(group.visible_plot_count(), 1);
    }
}
