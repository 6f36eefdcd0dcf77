//! Tied kinematic parameters.
//!
//! Kinematics are passed to the optimizer as one flat vector: component `c`
//! owns slots `start[c] .. start[c] + |moments[c]|`, with the velocity first
//! and the dispersion second. Components sharing a velocity (or sigma) group
//! are constrained by tying every member's slot to the slot of the
//! lowest-index member.

use serde::{Deserialize, Serialize};

use crate::lines::TieResolution;

/// State of one slot in the flat kinematics vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamTie {
    Free,
    /// Equal to the value of another (free) slot.
    Tied(usize),
}

/// Kinematic setup of one component as seen by the tie compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComponentSpec {
    /// Signed number of moments; negative means fixed (not refit).
    pub moments: i32,
    pub velocity_group: Option<usize>,
    pub sigma_group: Option<usize>,
}

impl ComponentSpec {
    pub fn fitted(moments: i32, velocity_group: usize, sigma_group: usize) -> Self {
        Self {
            moments,
            velocity_group: Some(velocity_group),
            sigma_group: Some(sigma_group),
        }
    }

    pub fn fixed(moments: i32) -> Self {
        Self {
            moments: -moments.abs(),
            velocity_group: None,
            sigma_group: None,
        }
    }

    pub fn is_fixed(&self) -> bool {
        self.moments < 0
    }

    pub fn n_moments(&self) -> usize {
        self.moments.unsigned_abs() as usize
    }
}

/// Compiled kinematic ties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TiedParameters {
    pub ties: Vec<ParamTie>,
    pub moments: Vec<i32>,
    /// First flat slot of each component.
    pub component_start: Vec<usize>,
    pub n_free: usize,
    pub dof: usize,
}

impl TiedParameters {
    pub fn n_components(&self) -> usize {
        self.moments.len()
    }

    pub fn n_params(&self) -> usize {
        self.ties.len()
    }

    /// Slot whose value defines `slot` (itself unless tied).
    pub fn defining_slot(&self, slot: usize) -> usize {
        match self.ties[slot] {
            ParamTie::Free => slot,
            ParamTie::Tied(to) => to,
        }
    }

    /// Defining slots for each moment of `component`.
    pub fn component_slots(&self, component: usize) -> Vec<usize> {
        let start = self.component_start[component];
        (start..start + self.moments[component].unsigned_abs() as usize)
            .map(|s| self.defining_slot(s))
            .collect()
    }

    /// Flat indices of the defining slot of every parameter, in order.
    pub fn tied_index(&self) -> Vec<usize> {
        (0..self.n_params()).map(|s| self.defining_slot(s)).collect()
    }

    pub fn is_velocity_slot(&self, slot: usize) -> bool {
        self.component_start.contains(&slot)
    }

    pub fn is_sigma_slot(&self, slot: usize) -> bool {
        self.component_start
            .iter()
            .zip(&self.moments)
            .any(|(start, m)| m.unsigned_abs() >= 2 && start + 1 == slot)
    }

    pub fn is_fixed_component(&self, component: usize) -> bool {
        self.moments[component] < 0
    }

    /// Component owning `slot`.
    pub fn component_of_slot(&self, slot: usize) -> usize {
        self.component_start.partition_point(|s| *s <= slot) - 1
    }

    /// Free slots of refit components; these are what the optimizer varies.
    pub fn free_slots(&self) -> Vec<usize> {
        (0..self.n_params())
            .filter(|s| {
                self.ties[*s] == ParamTie::Free
                    && !self.is_fixed_component(self.component_of_slot(*s))
            })
            .collect()
    }
}

/// Compile per-component groups into a flat tie vector.
///
/// `mdegree` and `degree` only enter the degrees-of-freedom count.
pub fn compile_ties(components: &[ComponentSpec], degree: i32, mdegree: i32) -> TiedParameters {
    let mut component_start = Vec::with_capacity(components.len());
    let mut n_params = 0;
    for c in components {
        component_start.push(n_params);
        n_params += c.n_moments();
    }

    let mut ties = vec![ParamTie::Free; n_params];
    tie_groups(components, &component_start, &mut ties, 0, |c| c.velocity_group);
    tie_groups(components, &component_start, &mut ties, 1, |c| c.sigma_group);

    let n_free = components
        .iter()
        .zip(&component_start)
        .filter(|(c, _)| !c.is_fixed())
        .map(|(c, start)| {
            (*start..start + c.n_moments())
                .filter(|s| ties[*s] == ParamTie::Free)
                .count()
        })
        .sum::<usize>();
    let fixed: usize = components
        .iter()
        .filter(|c| c.is_fixed())
        .map(|c| c.n_moments())
        .sum();

    let mut dof = n_free + fixed + mdegree.max(0) as usize;
    if degree >= 0 {
        dof += degree as usize + 1;
    }

    TiedParameters {
        ties,
        moments: components.iter().map(|c| c.moments).collect(),
        component_start,
        n_free,
        dof,
    }
}

fn tie_groups(
    components: &[ComponentSpec],
    component_start: &[usize],
    ties: &mut [ParamTie],
    moment: usize,
    group_of: impl Fn(&ComponentSpec) -> Option<usize>,
) {
    let n_groups = components.iter().filter_map(&group_of).max().map_or(0, |g| g + 1);
    for group in 0..n_groups {
        // Members in ascending component order; fixed components never join.
        let members: Vec<usize> = components
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_fixed() && c.n_moments() > moment && group_of(*c) == Some(group))
            .map(|(i, _)| i)
            .collect();
        let Some((&leader, rest)) = members.split_first() else {
            continue;
        };
        let authority = component_start[leader] + moment;
        for &m in rest {
            ties[component_start[m] + moment] = ParamTie::Tied(authority);
        }
    }
}

/// Per-component specs for the emission-line components of a resolution.
///
/// Every template of a component carries the same groups, so the first one
/// found defines them.
pub fn emission_components(resolution: &TieResolution, moments: i32) -> Vec<ComponentSpec> {
    let mut specs: Vec<Option<ComponentSpec>> = vec![None; resolution.n_components];
    for t in 0..resolution.n_templates() {
        let c = resolution.template_component[t];
        if specs[c].is_none() {
            specs[c] = Some(ComponentSpec::fitted(
                moments,
                resolution.template_velocity_group[t],
                resolution.template_sigma_group[t],
            ));
        }
    }
    specs
        .into_iter()
        .map(|s| {
            s.unwrap_or(ComponentSpec {
                moments,
                velocity_group: None,
                sigma_group: None,
            })
        })
        .collect()
}
