//! Component dependency graph
//!
//! A fixed parent-to-children table describes which components must be in
//! place before others. From it this module derives the install tree (for
//! display and diagnostics) and the order in which rendered charts are
//! applied: every component comes after all of its ancestors.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::component::ComponentName;
use crate::Error;

/// Parent-to-children adjacency used by the operator.
pub const COMPONENT_DEPENDENCIES: &[(ComponentName, &[ComponentName])] = &[
    (
        ComponentName::Base,
        &[
            ComponentName::Citadel,
            ComponentName::Galley,
            ComponentName::CertManager,
        ],
    ),
    (ComponentName::Citadel, &[ComponentName::NodeAgent]),
    (
        ComponentName::Galley,
        &[
            ComponentName::Pilot,
            ComponentName::Policy,
            ComponentName::Telemetry,
            ComponentName::SidecarInjector,
        ],
    ),
    (
        ComponentName::Pilot,
        &[ComponentName::IngressGateway, ComponentName::EgressGateway],
    ),
];

/// A component and everything that must be installed after it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstallTree {
    /// Component at this node
    pub component: ComponentName,
    /// Dependent subtrees in declaration order
    pub children: Vec<InstallTree>,
}

impl InstallTree {
    /// Components in pre-order: every parent precedes its children.
    pub fn preorder(&self) -> Vec<ComponentName> {
        let mut out = vec![self.component];
        for child in &self.children {
            out.extend(child.preorder());
        }
        out
    }

    /// Components grouped by depth. Everything in one wave depends only on
    /// earlier waves.
    pub fn waves(&self) -> Vec<Vec<ComponentName>> {
        let mut waves = Vec::new();
        let mut level = vec![self];
        while !level.is_empty() {
            waves.push(level.iter().map(|t| t.component).collect());
            level = level.iter().flat_map(|t| t.children.iter()).collect();
        }
        waves
    }

    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        writeln!(f, "{:indent$}{}", "", self.component, indent = depth * 2)?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for InstallTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}

/// Install ordering derived from a dependency table.
///
/// Built once and shared read-only across reconciles.
#[derive(Clone, Debug)]
pub struct DependencyGraph {
    tree: InstallTree,
    known_order: Vec<ComponentName>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::standard()
    }
}

impl DependencyGraph {
    /// Graph over [`COMPONENT_DEPENDENCIES`] rooted at Base
    pub fn standard() -> Self {
        // The built-in table is a tree (see standard_table_builds_without_fallback).
        match Self::new(ComponentName::Base, COMPONENT_DEPENDENCIES) {
            Ok(graph) => graph,
            Err(_) => Self::from_tree(InstallTree {
                component: ComponentName::Base,
                children: Vec::new(),
            }),
        }
    }

    /// Build a graph rooted at `root`.
    ///
    /// Fails if a component is reachable along two paths (which includes
    /// any cycle).
    pub fn new(
        root: ComponentName,
        adjacency: &[(ComponentName, &[ComponentName])],
    ) -> Result<Self, Error> {
        let children: BTreeMap<ComponentName, &[ComponentName]> =
            adjacency.iter().copied().collect();
        let mut seen = BTreeSet::new();
        let tree = build_tree(root, &children, &mut seen)?;
        Ok(Self::from_tree(tree))
    }

    fn from_tree(tree: InstallTree) -> Self {
        let known_order = tree.preorder();
        Self { tree, known_order }
    }

    /// The install tree rooted at Base
    pub fn install_tree(&self) -> &InstallTree {
        &self.tree
    }

    /// Every component in the graph, parents before children
    pub fn known_order(&self) -> &[ComponentName] {
        &self.known_order
    }

    /// Order in which to apply a set of rendered charts.
    ///
    /// Charts of known components come first in dependency order; any other
    /// rendered chart follows in the map's own order.
    pub fn processing_order<V>(&self, rendered: &BTreeMap<String, V>) -> Vec<String> {
        let mut order: Vec<String> = self
            .known_order
            .iter()
            .map(|c| c.chart())
            .filter(|chart| rendered.contains_key(*chart))
            .map(str::to_string)
            .collect();

        for chart in rendered.keys() {
            if !order.contains(chart) {
                order.push(chart.clone());
            }
        }
        order
    }
}

fn build_tree(
    component: ComponentName,
    children: &BTreeMap<ComponentName, &[ComponentName]>,
    seen: &mut BTreeSet<ComponentName>,
) -> Result<InstallTree, Error> {
    if !seen.insert(component) {
        return Err(Error::internal(
            "dependency_graph",
            format!("component {component} is reachable more than once"),
        ));
    }

    let subtrees = children
        .get(&component)
        .copied()
        .unwrap_or_default()
        .iter()
        .map(|child| build_tree(*child, children, seen))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InstallTree {
        component,
        children: subtrees,
    })
}
