use nalgebra::{Quaternion, Vector3};
use slotmap::SlotMap;

use crate::{
    Constraint, ConstraintKey, Line, LineKey, ModelError, ObservationKey, PointKey, Result,
    ViewpointKey, Viewpoint, WorldPoint,
};

/// A 2D pixel observation tying one world point to one viewpoint.
#[derive(Debug, Clone, Copy)]
pub struct ImagePoint {
    pub world_point: PointKey,
    pub viewpoint: ViewpointKey,
    pub u: f64,
    pub v: f64,
}

/// Which entity a [`Delta`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityRef {
    Point(PointKey),
    Line(LineKey),
    Viewpoint(ViewpointKey),
    Observation(ObservationKey),
    Constraint(ConstraintKey),
}

/// Change notification emitted after each mutating call; hosts drain these
/// with [`Project::take_deltas`] to drive their own invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delta {
    pub entity: EntityRef,
    pub field: &'static str,
}

/// Owning container for every entity of one reconstruction project.
#[derive(Debug, Default, Clone)]
pub struct Project {
    pub(crate) points: SlotMap<PointKey, WorldPoint>,
    pub(crate) lines: SlotMap<LineKey, Line>,
    pub(crate) viewpoints: SlotMap<ViewpointKey, Viewpoint>,
    pub(crate) observations: SlotMap<ObservationKey, ImagePoint>,
    pub(crate) constraints: SlotMap<ConstraintKey, Constraint>,
    deltas: Vec<Delta>,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, entity: EntityRef, field: &'static str) {
        self.deltas.push(Delta { entity, field });
    }

    /// Drain the change log accumulated since the previous call.
    pub fn take_deltas(&mut self) -> Vec<Delta> {
        std::mem::take(&mut self.deltas)
    }

    // ---- read access -------------------------------------------------------

    pub fn point(&self, key: PointKey) -> Option<&WorldPoint> {
        self.points.get(key)
    }

    pub fn line(&self, key: LineKey) -> Option<&Line> {
        self.lines.get(key)
    }

    pub fn viewpoint(&self, key: ViewpointKey) -> Option<&Viewpoint> {
        self.viewpoints.get(key)
    }

    pub fn observation(&self, key: ObservationKey) -> Option<&ImagePoint> {
        self.observations.get(key)
    }

    pub fn constraint(&self, key: ConstraintKey) -> Option<&Constraint> {
        self.constraints.get(key)
    }

    pub fn points(&self) -> impl Iterator<Item = (PointKey, &WorldPoint)> {
        self.points.iter()
    }

    pub fn lines(&self) -> impl Iterator<Item = (LineKey, &Line)> {
        self.lines.iter()
    }

    pub fn viewpoints(&self) -> impl Iterator<Item = (ViewpointKey, &Viewpoint)> {
        self.viewpoints.iter()
    }

    pub fn observations(&self) -> impl Iterator<Item = (ObservationKey, &ImagePoint)> {
        self.observations.iter()
    }

    pub fn constraints(&self) -> impl Iterator<Item = (ConstraintKey, &Constraint)> {
        self.constraints.iter()
    }

    pub fn num_points(&self) -> usize {
        self.points.len()
    }

    pub fn num_viewpoints(&self) -> usize {
        self.viewpoints.len()
    }

    // ---- factories ---------------------------------------------------------

    pub fn add_point(&mut self, name: impl Into<String>) -> PointKey {
        let key = self.points.insert(WorldPoint::new(name.into()));
        self.record(EntityRef::Point(key), "created");
        key
    }

    pub fn add_viewpoint(
        &mut self,
        name: impl Into<String>,
        image_width: u32,
        image_height: u32,
    ) -> ViewpointKey {
        let key = self
            .viewpoints
            .insert(Viewpoint::new(name.into(), image_width, image_height));
        self.record(EntityRef::Viewpoint(key), "created");
        key
    }

    pub fn add_line(
        &mut self,
        name: impl Into<String>,
        point_a: PointKey,
        point_b: PointKey,
    ) -> Result<LineKey> {
        if !self.points.contains_key(point_a) || !self.points.contains_key(point_b) {
            return Err(ModelError::UnknownPoint);
        }
        let key = self.lines.insert(Line::new(name.into(), point_a, point_b));
        self.record(EntityRef::Line(key), "created");
        Ok(key)
    }

    /// Attach a 2D observation, wiring both the world point and the viewpoint.
    pub fn add_observation(
        &mut self,
        world_point: PointKey,
        viewpoint: ViewpointKey,
        u: f64,
        v: f64,
    ) -> Result<ObservationKey> {
        if !self.points.contains_key(world_point) {
            return Err(ModelError::UnknownPoint);
        }
        if !self.viewpoints.contains_key(viewpoint) {
            return Err(ModelError::UnknownViewpoint);
        }
        let duplicate = self.viewpoints[viewpoint]
            .observations
            .iter()
            .any(|k| self.observations[*k].world_point == world_point);
        if duplicate {
            return Err(ModelError::DuplicateObservation);
        }
        let key = self.observations.insert(ImagePoint {
            world_point,
            viewpoint,
            u,
            v,
        });
        self.points[world_point].observations.insert(key);
        self.viewpoints[viewpoint].observations.insert(key);
        self.record(EntityRef::Observation(key), "created");
        Ok(key)
    }

    /// Register a constraint, wiring back-references on every operand.
    pub fn add_constraint(&mut self, constraint: Constraint) -> Result<ConstraintKey> {
        let count = constraint.kind.operand_count();
        let needed = constraint.kind.min_operands();
        if count < needed {
            return Err(ModelError::TooFewOperands { needed, got: count });
        }
        for p in constraint.kind.points() {
            if !self.points.contains_key(p) {
                return Err(ModelError::UnknownPoint);
            }
        }
        for l in constraint.kind.lines() {
            if !self.lines.contains_key(l) {
                return Err(ModelError::UnknownLine);
            }
        }
        for v in constraint.kind.viewpoints() {
            if !self.viewpoints.contains_key(v) {
                return Err(ModelError::UnknownViewpoint);
            }
        }
        let key = self.constraints.insert(constraint);
        self.register_constraint(key);
        self.record(EntityRef::Constraint(key), "created");
        Ok(key)
    }

    fn register_constraint(&mut self, key: ConstraintKey) {
        let kind = self.constraints[key].kind.clone();
        for p in kind.points() {
            self.points[p].constraints.insert(key);
        }
        for l in kind.lines() {
            self.lines[l].constraints.insert(key);
        }
    }

    fn deregister_constraint(&mut self, key: ConstraintKey) {
        let kind = self.constraints[key].kind.clone();
        for p in kind.points() {
            if let Some(point) = self.points.get_mut(p) {
                point.constraints.remove(&key);
            }
        }
        for l in kind.lines() {
            if let Some(line) = self.lines.get_mut(l) {
                line.constraints.remove(&key);
            }
        }
    }

    // ---- targeted mutation -------------------------------------------------

    pub fn point_mut(&mut self, key: PointKey) -> Option<&mut WorldPoint> {
        if self.points.contains_key(key) {
            self.record(EntityRef::Point(key), "modified");
        }
        self.points.get_mut(key)
    }

    pub fn line_mut(&mut self, key: LineKey) -> Option<&mut Line> {
        if self.lines.contains_key(key) {
            self.record(EntityRef::Line(key), "modified");
        }
        self.lines.get_mut(key)
    }

    pub fn viewpoint_mut(&mut self, key: ViewpointKey) -> Option<&mut Viewpoint> {
        if self.viewpoints.contains_key(key) {
            self.record(EntityRef::Viewpoint(key), "modified");
        }
        self.viewpoints.get_mut(key)
    }

    pub fn constraint_mut(&mut self, key: ConstraintKey) -> Option<&mut Constraint> {
        if self.constraints.contains_key(key) {
            self.record(EntityRef::Constraint(key), "modified");
        }
        self.constraints.get_mut(key)
    }

    pub fn set_optimized_xyz(&mut self, key: PointKey, xyz: Vector3<f64>) -> Result<()> {
        let point = self.points.get_mut(key).ok_or(ModelError::UnknownPoint)?;
        point.optimized_xyz = Some(xyz);
        self.record(EntityRef::Point(key), "optimizedXyz");
        Ok(())
    }

    pub fn set_viewpoint_pose(
        &mut self,
        key: ViewpointKey,
        position: Vector3<f64>,
        rotation: Quaternion<f64>,
    ) -> Result<()> {
        let vp = self
            .viewpoints
            .get_mut(key)
            .ok_or(ModelError::UnknownViewpoint)?;
        vp.position = position;
        vp.rotation = rotation;
        self.record(EntityRef::Viewpoint(key), "pose");
        Ok(())
    }

    // ---- deletion cascades -------------------------------------------------

    /// Remove an observation, unhooking it from both owners.
    pub fn remove_observation(&mut self, key: ObservationKey) -> Result<()> {
        let obs = self
            .observations
            .remove(key)
            .ok_or(ModelError::UnknownObservation)?;
        if let Some(point) = self.points.get_mut(obs.world_point) {
            point.observations.remove(&key);
        }
        if let Some(vp) = self.viewpoints.get_mut(obs.viewpoint) {
            vp.observations.remove(&key);
        }
        self.record(EntityRef::Observation(key), "removed");
        Ok(())
    }

    pub fn remove_constraint(&mut self, key: ConstraintKey) -> Result<()> {
        if !self.constraints.contains_key(key) {
            return Err(ModelError::UnknownConstraint);
        }
        self.deregister_constraint(key);
        self.constraints.remove(key);
        self.record(EntityRef::Constraint(key), "removed");
        Ok(())
    }

    /// Remove a line together with the constraints that name it.
    pub fn remove_line(&mut self, key: LineKey) -> Result<()> {
        let line = self.lines.get(key).ok_or(ModelError::UnknownLine)?;
        let dependents: Vec<ConstraintKey> = line.constraints.iter().copied().collect();
        for c in dependents {
            self.remove_constraint(c)?;
        }
        self.lines.remove(key);
        self.record(EntityRef::Line(key), "removed");
        Ok(())
    }

    /// Remove a world point. Observations and lines that reference it die
    /// with it; constraints shrink when their variant allows it and die
    /// otherwise.
    pub fn remove_point(&mut self, key: PointKey) -> Result<()> {
        if !self.points.contains_key(key) {
            return Err(ModelError::UnknownPoint);
        }

        let observations: Vec<ObservationKey> =
            self.points[key].observations.iter().copied().collect();
        for obs in observations {
            self.remove_observation(obs)?;
        }

        let dead_lines: Vec<LineKey> = self
            .lines
            .iter()
            .filter(|(_, l)| l.point_a == key || l.point_b == key)
            .map(|(k, _)| k)
            .collect();
        for l in dead_lines {
            self.remove_line(l)?;
        }
        for (_, line) in self.lines.iter_mut() {
            line.coincident.remove(&key);
        }

        let dependents: Vec<ConstraintKey> = self.points[key].constraints.iter().copied().collect();
        for c in dependents {
            // shrink-or-die, re-registering the survivors
            self.deregister_constraint(c);
            let survives = self.constraints[c].kind.remove_point(key);
            if survives {
                self.register_constraint(c);
                self.record(EntityRef::Constraint(c), "shrunk");
            } else {
                tracing::debug!(
                    constraint = %self.constraints[c].common.name,
                    "removing constraint that lost an operand point"
                );
                self.constraints.remove(c);
                self.record(EntityRef::Constraint(c), "removed");
            }
        }

        self.points.remove(key);
        self.record(EntityRef::Point(key), "removed");
        Ok(())
    }

    /// Remove a viewpoint together with its observations and projection
    /// constraints.
    pub fn remove_viewpoint(&mut self, key: ViewpointKey) -> Result<()> {
        if !self.viewpoints.contains_key(key) {
            return Err(ModelError::UnknownViewpoint);
        }
        let observations: Vec<ObservationKey> =
            self.viewpoints[key].observations.iter().copied().collect();
        for obs in observations {
            self.remove_observation(obs)?;
        }
        let dependents: Vec<ConstraintKey> = self
            .constraints
            .iter()
            .filter(|(_, c)| c.kind.viewpoints().contains(&key))
            .map(|(k, _)| k)
            .collect();
        for c in dependents {
            self.remove_constraint(c)?;
        }
        self.viewpoints.remove(key);
        self.record(EntityRef::Viewpoint(key), "removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AxisState, ConstraintKind};

    #[test]
    fn observation_links_both_sides() {
        let mut p = Project::new();
        let pt = p.add_point("corner");
        let vp = p.add_viewpoint("cam", 640, 480);
        let obs = p.add_observation(pt, vp, 100.0, 200.0).unwrap();
        assert!(p.point(pt).unwrap().observations.contains(&obs));
        assert!(p.viewpoint(vp).unwrap().observations.contains(&obs));

        p.remove_observation(obs).unwrap();
        assert!(p.point(pt).unwrap().observations.is_empty());
        assert!(p.viewpoint(vp).unwrap().observations.is_empty());
    }

    #[test]
    fn duplicate_observation_rejected() {
        let mut p = Project::new();
        let pt = p.add_point("corner");
        let vp = p.add_viewpoint("cam", 640, 480);
        p.add_observation(pt, vp, 1.0, 2.0).unwrap();
        assert!(matches!(
            p.add_observation(pt, vp, 3.0, 4.0),
            Err(ModelError::DuplicateObservation)
        ));
    }

    #[test]
    fn removing_point_cascades() {
        let mut p = Project::new();
        let a = p.add_point("a");
        let b = p.add_point("b");
        let vp = p.add_viewpoint("cam", 640, 480);
        let obs = p.add_observation(a, vp, 1.0, 2.0).unwrap();
        let line = p.add_line("ab", a, b).unwrap();
        let c = p
            .add_constraint(Constraint::new(
                "d",
                ConstraintKind::DistancePointPoint {
                    a,
                    b,
                    distance: 2.0,
                },
            ))
            .unwrap();

        p.remove_point(a).unwrap();
        assert!(p.point(a).is_none());
        assert!(p.observation(obs).is_none());
        assert!(p.line(line).is_none());
        assert!(p.constraint(c).is_none());
        // survivor has clean back-references
        assert!(p.point(b).unwrap().constraints.is_empty());
    }

    #[test]
    fn coplanar_constraint_shrinks_instead_of_dying() {
        let mut p = Project::new();
        let pts: Vec<_> = (0..5).map(|i| p.add_point(format!("p{i}"))).collect();
        let c = p
            .add_constraint(Constraint::new(
                "cop",
                ConstraintKind::CoplanarPoints {
                    points: pts.clone(),
                },
            ))
            .unwrap();
        p.remove_point(pts[4]).unwrap();
        let kind = &p.constraint(c).unwrap().kind;
        assert_eq!(kind.operand_count(), 4);
        // one more removal drops it below the minimum and it dies
        p.remove_point(pts[3]).unwrap();
        assert!(p.constraint(c).is_none());
    }

    #[test]
    fn deltas_are_drained() {
        let mut p = Project::new();
        let pt = p.add_point("a");
        p.set_optimized_xyz(pt, Vector3::new(1.0, 2.0, 3.0)).unwrap();
        let deltas = p.take_deltas();
        assert_eq!(deltas.len(), 2);
        assert_eq!(deltas[1].field, "optimizedXyz");
        assert!(p.take_deltas().is_empty());
    }

    #[test]
    fn locked_axes_survive_via_point_mut() {
        let mut p = Project::new();
        let pt = p.add_point("a");
        p.point_mut(pt).unwrap().axes[0] = AxisState::Locked(5.0);
        assert_eq!(p.point(pt).unwrap().axes[0], AxisState::Locked(5.0));
    }
}
