//! Tie-graph resolution.
//!
//! Turns the tie modes of a [`LineDatabase`] into:
//!
//! - the template each fitted line contributes to (`a` lines share one)
//! - the kinematic component of each template
//! - the velocity and sigma group of each template
//!
//! Independent lines (`f`, `w`) are assigned first, in input order. Tied lines
//! are then resolved in repeated passes: a line is resolved once the line it
//! points at is resolved. Every tied line must reach an independent line in at
//! most `n_lines` hops; cycles, dangling targets, and chains through ignored
//! lines are reported as [`ValidationError`]s naming the offending line.

use tracing::{info, warn};

use crate::domain::{KinematicsTie, LineRecord, RunContext, TieMode};
use crate::error::ValidationError;
use crate::lines::LineDatabase;

/// Monotonic id source for templates, components, and groups.
#[derive(Debug, Default)]
struct IdAllocator {
    next: usize,
}

impl IdAllocator {
    fn allocate(&mut self) -> usize {
        let id = self.next;
        self.next += 1;
        id
    }

    fn count(&self) -> usize {
        self.next
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Groups {
    template: usize,
    component: usize,
    velocity: usize,
    sigma: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum LineStatus {
    /// Ignored or outside the wavelength range.
    Excluded,
    Unresolved,
    Resolved(Groups),
    Failed(ValidationError),
}

/// Outcome of tie resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TieResolution {
    /// Template of each line (by database position); `None` for lines not fit.
    pub line_template: Vec<Option<usize>>,
    /// Kinematic component of each template.
    pub template_component: Vec<usize>,
    /// Velocity group of each template.
    pub template_velocity_group: Vec<usize>,
    /// Sigma group of each template.
    pub template_sigma_group: Vec<usize>,
    pub n_components: usize,
    pub n_velocity_groups: usize,
    pub n_sigma_groups: usize,
}

impl TieResolution {
    pub fn n_templates(&self) -> usize {
        self.template_component.len()
    }

    /// Database positions of the lines contributing to `template`.
    pub fn template_lines(&self, template: usize) -> Vec<usize> {
        self.line_template
            .iter()
            .enumerate()
            .filter_map(|(pos, t)| (*t == Some(template)).then_some(pos))
            .collect()
    }

    /// Kinematic component of the line at database position `pos`.
    pub fn line_component(&self, pos: usize) -> Option<usize> {
        self.line_template
            .get(pos)
            .copied()
            .flatten()
            .map(|t| self.template_component[t])
    }

    pub fn n_fit_lines(&self) -> usize {
        self.line_template.iter().filter(|t| t.is_some()).count()
    }
}

/// Resolves tie modes into template / component / group assignments.
#[derive(Debug, Clone, Default)]
pub struct TieResolver {
    kinematics_tie: KinematicsTie,
    wave_range: Option<[f64; 2]>,
}

impl TieResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kinematics_tie(mut self, kinematics_tie: KinematicsTie) -> Self {
        self.kinematics_tie = kinematics_tie;
        self
    }

    /// Lines with rest wavelengths outside `range` are treated as ignored.
    pub fn with_wavelength_range(mut self, range: [f64; 2]) -> Self {
        self.wave_range = Some(range);
        self
    }

    pub fn resolve(
        &self,
        db: &LineDatabase,
        ctx: &RunContext,
    ) -> Result<TieResolution, ValidationError> {
        let lines = db.lines();
        let n_lines = lines.len();

        if let Some(line) = lines
            .iter()
            .find(|l| matches!(l.mode, TieMode::TieFluxOnly(_)))
        {
            return Err(ValidationError::UnsupportedMode {
                index: line.index,
                name: line.name.clone(),
                mode: line.mode,
            });
        }

        let mut status: Vec<LineStatus> = lines
            .iter()
            .map(|l| {
                if self.is_excluded(l) {
                    LineStatus::Excluded
                } else {
                    LineStatus::Unresolved
                }
            })
            .collect();

        for (line, st) in lines.iter().zip(&status) {
            if line.is_fit() && *st == LineStatus::Excluded {
                warn!(
                    "Line {} ({}) at {:.2} is outside the wavelength range and will not be fit.",
                    line.index, line.name, line.rest_wavelength
                );
            }
        }

        let n_excluded = status.iter().filter(|s| **s == LineStatus::Excluded).count();
        let n_tie_all = lines
            .iter()
            .zip(&status)
            .filter(|(l, s)| **s != LineStatus::Excluded && matches!(l.mode, TieMode::TieAll(_)))
            .count();
        let n_templates = n_lines - n_excluded - n_tie_all;

        let mut templates = IdAllocator::default();
        let mut components = IdAllocator::default();
        let mut velocity_groups = IdAllocator::default();
        let mut sigma_groups = IdAllocator::default();

        // Independent lines root their own template, component, and groups.
        for (line, st) in lines.iter().zip(status.iter_mut()) {
            if *st != LineStatus::Unresolved || !line.mode.is_independent() {
                continue;
            }
            if line.mode == TieMode::WeakIndependent {
                warn!(
                    "Line {} ({}) has mode 'w'; treated the same as mode 'f'.",
                    line.index, line.name
                );
            }
            *st = LineStatus::Resolved(Groups {
                template: templates.allocate(),
                component: components.allocate(),
                velocity: velocity_groups.allocate(),
                sigma: sigma_groups.allocate(),
            });
        }

        loop {
            let mut progressed = false;
            let mut remaining = false;

            for i in 0..n_lines {
                if status[i] != LineStatus::Unresolved {
                    continue;
                }
                let line = &lines[i];
                if let Err(e) = trace_to_independent(db, &status, i) {
                    status[i] = LineStatus::Failed(e);
                    progressed = true;
                    continue;
                }

                // `trace_to_independent` guarantees the target exists.
                let Some(target_pos) = line.mode.target().and_then(|t| db.position_of(t)) else {
                    continue;
                };
                let LineStatus::Resolved(target) = status[target_pos] else {
                    remaining = true;
                    continue;
                };

                let groups = match line.mode {
                    TieMode::TieAll(_) => target,
                    TieMode::TieKinematics(_) => Groups {
                        template: templates.allocate(),
                        component: match self.kinematics_tie {
                            KinematicsTie::SharedComponent => target.component,
                            KinematicsTie::TiedComponent => components.allocate(),
                        },
                        velocity: target.velocity,
                        sigma: target.sigma,
                    },
                    TieMode::TieVelocity(_) => Groups {
                        template: templates.allocate(),
                        component: components.allocate(),
                        velocity: target.velocity,
                        sigma: sigma_groups.allocate(),
                    },
                    TieMode::TieSigma(_) => Groups {
                        template: templates.allocate(),
                        component: components.allocate(),
                        velocity: velocity_groups.allocate(),
                        sigma: target.sigma,
                    },
                    TieMode::Primary | TieMode::WeakIndependent | TieMode::TieFluxOnly(_) => {
                        continue;
                    }
                };
                status[i] = LineStatus::Resolved(groups);
                progressed = true;
            }

            if let Some(err) = status.iter().find_map(|s| match s {
                LineStatus::Failed(e) => Some(e.clone()),
                _ => None,
            }) {
                return Err(err);
            }

            if !remaining {
                break;
            }
            if !progressed {
                // Chains were all valid, so a stall means the graph is cyclic.
                if let Some(line) = lines
                    .iter()
                    .zip(&status)
                    .find_map(|(l, s)| (*s == LineStatus::Unresolved).then_some(l))
                {
                    return Err(ValidationError::Cycle {
                        index: line.index,
                        name: line.name.clone(),
                        mode: line.mode,
                        path: vec![line.index],
                    });
                }
                break;
            }
        }

        if templates.count() == 0 {
            return Err(ValidationError::NoPrimaryLines);
        }

        let resolution = assemble(&status, n_templates, templates.count())?;

        if !ctx.quiet {
            info!("Number of emission lines to fit: {}", resolution.n_fit_lines());
            info!("Number of emission-line templates: {}", resolution.n_templates());
            info!("Number of emission-line kinematic components: {}", components.count());
            info!("Number of emission-line velocity groups: {}", velocity_groups.count());
            info!("Number of emission-line sigma groups: {}", sigma_groups.count());
        }

        Ok(TieResolution {
            n_components: components.count(),
            n_velocity_groups: velocity_groups.count(),
            n_sigma_groups: sigma_groups.count(),
            ..resolution
        })
    }

    fn is_excluded(&self, line: &LineRecord) -> bool {
        if !line.is_fit() {
            return true;
        }
        match self.wave_range {
            Some([lo, hi]) => line.rest_wavelength < lo || line.rest_wavelength > hi,
            None => false,
        }
    }
}

/// Follow the tie chain from `start` until an independent line is reached.
///
/// Returns the position of that line.
fn trace_to_independent(
    db: &LineDatabase,
    status: &[LineStatus],
    start: usize,
) -> Result<usize, ValidationError> {
    let lines = db.lines();
    let origin = &lines[start];
    let max_hops = lines.len();

    let mut path = vec![start];
    let mut current = start;
    for _ in 0..max_hops {
        let Some(target) = lines[current].mode.target() else {
            return Ok(current);
        };
        let Some(next) = db.position_of(target) else {
            return Err(ValidationError::UnknownTarget {
                index: origin.index,
                name: origin.name.clone(),
                mode: origin.mode,
                target,
            });
        };
        if status[next] == LineStatus::Excluded {
            return Err(ValidationError::TargetIgnored {
                index: origin.index,
                name: origin.name.clone(),
                mode: origin.mode,
                target,
            });
        }
        if path.contains(&next) {
            path.push(next);
            return Err(ValidationError::Cycle {
                index: origin.index,
                name: origin.name.clone(),
                mode: origin.mode,
                path: path.iter().map(|p| lines[*p].index).collect(),
            });
        }
        path.push(next);
        current = next;
    }

    if lines[current].mode.is_independent() {
        return Ok(current);
    }
    Err(ValidationError::ChainTooLong {
        index: origin.index,
        name: origin.name.clone(),
        mode: origin.mode,
        max_hops,
    })
}

fn assemble(
    status: &[LineStatus],
    expected_templates: usize,
    allocated_templates: usize,
) -> Result<TieResolution, ValidationError> {
    if expected_templates != allocated_templates {
        return Err(ValidationError::Internal {
            template: allocated_templates,
            what: "consistent template count",
        });
    }

    let mut component = vec![None; allocated_templates];
    let mut velocity = vec![None; allocated_templates];
    let mut sigma = vec![None; allocated_templates];
    let mut line_template = Vec::with_capacity(status.len());

    for st in status {
        match st {
            LineStatus::Resolved(g) => {
                component[g.template] = Some(g.component);
                velocity[g.template] = Some(g.velocity);
                sigma[g.template] = Some(g.sigma);
                line_template.push(Some(g.template));
            }
            LineStatus::Excluded => line_template.push(None),
            LineStatus::Unresolved | LineStatus::Failed(_) => {
                return Err(ValidationError::Internal {
                    template: line_template.len(),
                    what: "resolved line",
                });
            }
        }
    }

    let defined = |v: Vec<Option<usize>>, what: &'static str| {
        v.into_iter()
            .enumerate()
            .map(|(t, id)| id.ok_or(ValidationError::Internal { template: t, what }))
            .collect::<Result<Vec<_>, _>>()
    };

    Ok(TieResolution {
        line_template,
        template_component: defined(component, "kinematic component")?,
        template_velocity_group: defined(velocity, "velocity group")?,
        template_sigma_group: defined(sigma, "sigma group")?,
        n_components: 0,
        n_velocity_groups: 0,
        n_sigma_groups: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LineAction, LineRecord};

    fn db(modes: &[(i64, &str)]) -> LineDatabase {
        let lines = modes
            .iter()
            .enumerate()
            .map(|(i, (index, mode))| {
                LineRecord::new(*index, format!("L{index}"), 4000.0 + 100.0 * i as f64, mode.parse().unwrap())
            })
            .collect();
        LineDatabase::new(lines).unwrap()
    }

    fn resolve(db: &LineDatabase) -> Result<TieResolution, ValidationError> {
        TieResolver::new().resolve(db, &RunContext::quiet())
    }

    #[test]
    fn single_primary_line() {
        let r = resolve(&db(&[(0, "f")])).unwrap();
        assert_eq!(r.n_templates(), 1);
        assert_eq!(r.template_component, vec![0]);
        assert_eq!(r.template_velocity_group, vec![0]);
        assert_eq!(r.template_sigma_group, vec![0]);
        assert_eq!(r.line_template, vec![Some(0)]);
    }

    #[test]
    fn tie_all_and_tie_kinematics() {
        let d = db(&[(0, "f"), (1, "a0"), (2, "k0")]);
        let r = resolve(&d).unwrap();
        assert_eq!(r.n_templates(), 2);
        assert_eq!(r.template_lines(0), vec![0, 1]);
        assert_eq!(r.template_lines(1), vec![2]);
        assert_eq!(r.template_component, vec![0, 0]);
        assert_eq!(r.template_velocity_group, vec![0, 0]);
        assert_eq!(r.template_sigma_group, vec![0, 0]);
    }

    #[test]
    fn tie_kinematics_with_tied_component_mode() {
        let d = db(&[(0, "f"), (1, "a0"), (2, "k0")]);
        let r = TieResolver::new()
            .with_kinematics_tie(KinematicsTie::TiedComponent)
            .resolve(&d, &RunContext::quiet())
            .unwrap();
        assert_eq!(r.n_templates(), 2);
        assert_eq!(r.template_component, vec![0, 1]);
        assert_eq!(r.template_velocity_group, vec![0, 0]);
        assert_eq!(r.template_sigma_group, vec![0, 0]);
        assert_eq!(r.n_components, 2);
    }

    #[test]
    fn tie_all_is_transitive() {
        // C -> B -> A, listed out of order.
        let d = db(&[(2, "a1"), (1, "a0"), (0, "f")]);
        let r = resolve(&d).unwrap();
        assert_eq!(r.n_templates(), 1);
        assert_eq!(r.line_template, vec![Some(0), Some(0), Some(0)]);
    }

    #[test]
    fn tie_velocity_shares_only_velocity_group() {
        let d = db(&[(0, "f"), (1, "v0")]);
        let r = resolve(&d).unwrap();
        assert_eq!(r.n_templates(), 2);
        assert_ne!(r.template_component[0], r.template_component[1]);
        assert_eq!(r.template_velocity_group[0], r.template_velocity_group[1]);
        assert_ne!(r.template_sigma_group[0], r.template_sigma_group[1]);
    }

    #[test]
    fn tie_sigma_shares_only_sigma_group() {
        let d = db(&[(0, "f"), (1, "s0")]);
        let r = resolve(&d).unwrap();
        assert_ne!(r.template_component[0], r.template_component[1]);
        assert_ne!(r.template_velocity_group[0], r.template_velocity_group[1]);
        assert_eq!(r.template_sigma_group[0], r.template_sigma_group[1]);
        assert_eq!(r.n_velocity_groups, 2);
        assert_eq!(r.n_sigma_groups, 1);
    }

    #[test]
    fn two_line_cycle_is_rejected() {
        let d = db(&[(0, "a1"), (1, "a0")]);
        for _ in 0..3 {
            let err = resolve(&d).unwrap_err();
            assert_eq!(
                err,
                ValidationError::Cycle {
                    index: 0,
                    name: "L0".to_string(),
                    mode: TieMode::TieAll(1),
                    path: vec![0, 1, 0],
                }
            );
        }
    }

    #[test]
    fn all_ignored_has_no_primary_lines() {
        let lines = vec![
            LineRecord::new(0, "A", 5000.0, TieMode::Primary).with_action(LineAction::Ignore),
        ];
        let d = LineDatabase::new(lines).unwrap();
        assert_eq!(resolve(&d).unwrap_err(), ValidationError::NoPrimaryLines);
    }

    #[test]
    fn cycle_beside_a_primary_is_reported_as_cycle() {
        let d = db(&[(0, "f"), (1, "a2"), (2, "k1")]);
        let err = resolve(&d).unwrap_err();
        match err {
            ValidationError::Cycle { index, path, .. } => {
                assert_eq!(index, 1);
                assert_eq!(path, vec![1, 2, 1]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn tie_flux_only_is_unsupported_anywhere() {
        let d = db(&[(0, "f"), (1, "a0"), (2, "x0")]);
        let err = resolve(&d).unwrap_err();
        assert!(matches!(err, ValidationError::UnsupportedMode { index: 2, .. }));
    }

    #[test]
    fn unknown_target_names_the_line() {
        let d = db(&[(0, "f"), (5, "v9")]);
        let err = resolve(&d).unwrap_err();
        assert!(matches!(err, ValidationError::UnknownTarget { index: 5, target: 9, .. }));
    }

    #[test]
    fn tie_through_ignored_line_is_rejected() {
        let lines = vec![
            LineRecord::new(0, "A", 5000.0, TieMode::Primary).with_action(LineAction::Ignore),
            LineRecord::new(1, "B", 5100.0, TieMode::TieAll(0)),
        ];
        let d = LineDatabase::new(lines).unwrap();
        let err = resolve(&d).unwrap_err();
        assert!(matches!(err, ValidationError::TargetIgnored { index: 1, target: 0, .. }));
    }

    #[test]
    fn ignored_lines_have_no_template() {
        let lines = vec![
            LineRecord::new(0, "A", 5000.0, TieMode::Primary),
            LineRecord::new(1, "B", 5100.0, TieMode::Primary).with_action(LineAction::Ignore),
            LineRecord::new(2, "C", 5200.0, TieMode::TieVelocity(0)),
        ];
        let d = LineDatabase::new(lines).unwrap();
        let r = resolve(&d).unwrap();
        assert_eq!(r.line_template, vec![Some(0), None, Some(1)]);
    }

    #[test]
    fn out_of_range_lines_are_excluded() {
        let d = db(&[(0, "f"), (1, "f")]);
        let r = TieResolver::new()
            .with_wavelength_range([3500.0, 4050.0])
            .resolve(&d, &RunContext::quiet())
            .unwrap();
        assert_eq!(r.line_template, vec![Some(0), None]);
    }

    #[test]
    fn weak_independent_acts_as_primary() {
        let d = db(&[(0, "w"), (1, "a0")]);
        let r = resolve(&d).unwrap();
        assert_eq!(r.n_templates(), 1);
        assert_eq!(r.line_template, vec![Some(0), Some(0)]);
    }

    #[test]
    fn chained_ties_use_the_immediate_target() {
        // 2 ties velocity to 1, which only shares sigma with 0.
        let d = db(&[(0, "f"), (1, "s0"), (2, "v1")]);
        let r = resolve(&d).unwrap();
        let t1 = r.line_template[1].unwrap();
        let t2 = r.line_template[2].unwrap();
        assert_eq!(r.template_velocity_group[t2], r.template_velocity_group[t1]);
        assert_ne!(r.template_velocity_group[t2], r.template_velocity_group[0]);
    }

    #[test]
    fn grouping_is_independent_of_input_order() {
        let a = db(&[(0, "f"), (1, "a0"), (2, "k1"), (3, "v2"), (4, "f"), (5, "s4")]);
        let b = db(&[(5, "s4"), (3, "v2"), (2, "k1"), (4, "f"), (1, "a0"), (0, "f")]);
        let ra = resolve(&a).unwrap();
        let rb = resolve(&b).unwrap();

        // Pairs of line indices that share a template / velocity group.
        fn shared(d: &LineDatabase, key: impl Fn(usize) -> usize) -> Vec<(i64, i64)> {
            let mut pairs = Vec::new();
            for (i, li) in d.iter().enumerate() {
                for (j, lj) in d.iter().enumerate() {
                    if key(i) == key(j) {
                        pairs.push((li.index, lj.index));
                    }
                }
            }
            pairs.sort();
            pairs
        }

        let tpl = |r: &TieResolution, i: usize| r.line_template[i].unwrap();
        let vgrp = |r: &TieResolution, i: usize| r.template_velocity_group[tpl(r, i)];
        let sgrp = |r: &TieResolution, i: usize| r.template_sigma_group[tpl(r, i)];

        assert_eq!(shared(&a, |i| tpl(&ra, i)), shared(&b, |i| tpl(&rb, i)));
        assert_eq!(shared(&a, |i| vgrp(&ra, i)), shared(&b, |i| vgrp(&rb, i)));
        assert_eq!(shared(&a, |i| sgrp(&ra, i)), shared(&b, |i| sgrp(&rb, i)));
    }
}
