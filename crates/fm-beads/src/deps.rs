//! Cross-project dependency readiness.
//!
//! A bead is ready when every id in its `depends_on` list resolves to a
//! closed bead. Each id is either local to the bead's own project, qualified
//! as `project:id`, or a bare id found in another project's backlog. An id
//! that resolves nowhere blocks the bead.

use std::collections::HashMap;

use fm_core::types::{Bead, BeadStatus};

/// Index of bead statuses across all enabled projects.
pub struct DependencyIndex<'a> {
    /// `(project, bead id)` -> status
    by_project: HashMap<(&'a str, &'a str), BeadStatus>,
    /// bare bead id -> status (last writer wins; ids are globally unique in
    /// practice)
    global: HashMap<&'a str, BeadStatus>,
    project_ids: Vec<&'a str>,
}

impl<'a> DependencyIndex<'a> {
    pub fn build(projects: &'a [(String, Vec<Bead>)]) -> Self {
        let mut by_project = HashMap::new();
        let mut global = HashMap::new();
        let mut project_ids = Vec::new();
        for (project, beads) in projects {
            project_ids.push(project.as_str());
            for bead in beads {
                by_project.insert((project.as_str(), bead.id.as_str()), bead.status);
                global.insert(bead.id.as_str(), bead.status);
            }
        }
        Self {
            by_project,
            global,
            project_ids,
        }
    }

    /// Resolve one dependency id relative to `own_project`.
    fn resolve(&self, own_project: &str, dep: &str) -> Option<BeadStatus> {
        if let Some((prefix, rest)) = dep.split_once(':') {
            if self.project_ids.iter().any(|p| *p == prefix) {
                return self.by_project.get(&(prefix, rest)).copied();
            }
        }
        if let Some(status) = self.by_project.get(&(own_project, dep)) {
            return Some(*status);
        }
        self.global.get(dep).copied()
    }

    /// True when every dependency of `bead` is closed.
    pub fn is_ready(&self, own_project: &str, bead: &Bead) -> bool {
        bead.depends_on.iter().all(|dep| {
            self.resolve(own_project, dep)
                .map(|s| s.satisfies_dependency())
                .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fm_core::types::BeadType;

    fn bead(id: &str, status: BeadStatus, deps: &[&str]) -> Bead {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Bead {
            id: id.into(),
            title: id.into(),
            description: String::new(),
            status,
            bead_type: BeadType::Task,
            priority: 0,
            labels: vec![],
            estimate_minutes: 0,
            acceptance: None,
            design: None,
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            parent: None,
            dependencies: vec![],
            created_at: t,
            updated_at: t,
            closed_at: None,
            assignee: None,
        }
    }

    fn fixture() -> Vec<(String, Vec<Bead>)> {
        vec![
            (
                "alpha".to_string(),
                vec![bead("alpha-1", BeadStatus::Closed, &[])],
            ),
            (
                "beta".to_string(),
                vec![
                    bead("beta-1", BeadStatus::Open, &["alpha-1"]),
                    bead("beta-2", BeadStatus::Open, &["alpha-99"]),
                    bead("beta-3", BeadStatus::Open, &["alpha:alpha-1"]),
                    bead("beta-4", BeadStatus::Open, &["beta-1"]),
                ],
            ),
        ]
    }

    #[test]
    fn closed_cross_project_dep_is_satisfied() {
        let projects = fixture();
        let idx = DependencyIndex::build(&projects);
        let b = &projects[1].1[0];
        assert!(idx.is_ready("beta", b));
    }

    #[test]
    fn missing_dep_blocks() {
        let projects = fixture();
        let idx = DependencyIndex::build(&projects);
        let b = &projects[1].1[1];
        assert!(!idx.is_ready("beta", b));
    }

    #[test]
    fn qualified_dep_resolves() {
        let projects = fixture();
        let idx = DependencyIndex::build(&projects);
        let b = &projects[1].1[2];
        assert!(idx.is_ready("beta", b));
    }

    #[test]
    fn open_local_dep_blocks() {
        let projects = fixture();
        let idx = DependencyIndex::build(&projects);
        let b = &projects[1].1[3];
        assert!(!idx.is_ready("beta", b));
    }

    #[test]
    fn no_deps_is_ready() {
        let projects = fixture();
        let idx = DependencyIndex::build(&projects);
        let free = bead("beta-9", BeadStatus::Open, &[]);
        assert!(idx.is_ready("beta", &free));
    }
}
