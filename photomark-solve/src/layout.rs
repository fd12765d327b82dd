//! Variable layout for the explicit-Jacobian back end (and the leaf order of
//! the autodiff back end).
//!
//! Free and inferred point axes become optimisation variables; locked axes go
//! to a separate constant-slot table so the Jacobian stays small. Cameras
//! contribute three position variables, four quaternion variables and
//! optionally the focal length; with pose optimisation disabled a camera
//! contributes no variables at all.

use nalgebra::{DVector, Quaternion, Vector3};
use slotmap::SecondaryMap;

use photomark_autodiff::{Var3, VarQuat};
use photomark_types::{AxisState, PointKey, Project, ViewpointKey};

use crate::camera::CameraParams;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRef {
    Var(usize),
    Const(usize),
}

impl SlotRef {
    pub fn var_index(&self) -> Option<usize> {
        match self {
            SlotRef::Var(i) => Some(*i),
            SlotRef::Const(_) => None,
        }
    }
}

pub type PointSlots = [SlotRef; 3];

/// Intrinsics that never enter the variable vector.
#[derive(Debug, Clone, Copy)]
pub struct FixedIntrinsics {
    pub aspect: f64,
    pub cx: f64,
    pub cy: f64,
    pub skew: f64,
    pub k1: f64,
    pub k2: f64,
    pub k3: f64,
    pub p1: f64,
    pub p2: f64,
    pub z_reflected: bool,
}

#[derive(Debug, Clone)]
pub struct CameraSlots {
    pub position: [SlotRef; 3],
    pub rotation: [SlotRef; 4],
    pub focal: SlotRef,
    pub fixed: FixedIntrinsics,
    /// True when this camera's pose entered the variable vector.
    pub optimized: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct LayoutOptions {
    pub optimize_pose: bool,
    pub optimize_intrinsics: bool,
}

impl Default for LayoutOptions {
    fn default() -> Self {
        Self {
            optimize_pose: true,
            optimize_intrinsics: false,
        }
    }
}

/// Contiguous assignment of optimisation variables and constant slots.
pub struct VariableLayout {
    initial: Vec<f64>,
    constants: Vec<f64>,
    point_slots: SecondaryMap<PointKey, PointSlots>,
    camera_slots: SecondaryMap<ViewpointKey, CameraSlots>,
    next_provider_id: u32,
}

impl VariableLayout {
    pub fn build(project: &Project, opts: &LayoutOptions) -> Self {
        let mut layout = Self {
            initial: Vec::new(),
            constants: Vec::new(),
            point_slots: SecondaryMap::new(),
            camera_slots: SecondaryMap::new(),
            next_provider_id: 0,
        };

        for (key, point) in project.points() {
            let mut slots = [SlotRef::Const(0); 3];
            for (i, axis) in point.axes.iter().enumerate() {
                slots[i] = match axis {
                    AxisState::Locked(v) => layout.push_const(*v),
                    AxisState::Inferred(v) => {
                        let initial = point.optimized_xyz.map(|o| o[i]).unwrap_or(*v);
                        layout.push_var(initial)
                    }
                    AxisState::Free => {
                        let initial = point.optimized_xyz.map(|o| o[i]).unwrap_or(0.0);
                        layout.push_var(initial)
                    }
                };
            }
            layout.point_slots.insert(key, slots);
        }

        for (key, vp) in project.viewpoints() {
            // normalise the stored rotation before it enters the solve
            let q = vp.unit_rotation().into_inner();
            let fixed = FixedIntrinsics {
                aspect: vp.aspect_ratio,
                cx: vp.principal_point.x,
                cy: vp.principal_point.y,
                skew: vp.skew,
                k1: vp.radial[0],
                k2: vp.radial[1],
                k3: vp.radial[2],
                p1: vp.tangential[0],
                p2: vp.tangential[1],
                z_reflected: vp.is_z_reflected,
            };
            let slots = if opts.optimize_pose {
                CameraSlots {
                    position: [
                        layout.push_var(vp.position.x),
                        layout.push_var(vp.position.y),
                        layout.push_var(vp.position.z),
                    ],
                    rotation: [
                        layout.push_var(q.w),
                        layout.push_var(q.i),
                        layout.push_var(q.j),
                        layout.push_var(q.k),
                    ],
                    focal: if opts.optimize_intrinsics {
                        layout.push_var(vp.focal_length)
                    } else {
                        layout.push_const(vp.focal_length)
                    },
                    fixed,
                    optimized: true,
                }
            } else {
                CameraSlots {
                    position: [
                        layout.push_const(vp.position.x),
                        layout.push_const(vp.position.y),
                        layout.push_const(vp.position.z),
                    ],
                    rotation: [
                        layout.push_const(q.w),
                        layout.push_const(q.i),
                        layout.push_const(q.j),
                        layout.push_const(q.k),
                    ],
                    focal: layout.push_const(vp.focal_length),
                    fixed,
                    optimized: false,
                }
            };
            layout.camera_slots.insert(key, slots);
        }

        layout
    }

    fn push_var(&mut self, initial: f64) -> SlotRef {
        self.initial.push(initial);
        SlotRef::Var(self.initial.len() - 1)
    }

    fn push_const(&mut self, value: f64) -> SlotRef {
        self.constants.push(value);
        SlotRef::Const(self.constants.len() - 1)
    }

    pub fn num_variables(&self) -> usize {
        self.initial.len()
    }

    pub fn initial_values(&self) -> DVector<f64> {
        DVector::from_column_slice(&self.initial)
    }

    pub fn point_slots(&self, key: PointKey) -> Option<&PointSlots> {
        self.point_slots.get(key)
    }

    pub fn camera_slots(&self, key: ViewpointKey) -> Option<&CameraSlots> {
        self.camera_slots.get(key)
    }

    pub fn constants(&self) -> &[f64] {
        &self.constants
    }

    /// Monotonic provider-id generator; reset with the layout per solve.
    pub fn next_provider_id(&mut self) -> u32 {
        let id = self.next_provider_id;
        self.next_provider_id += 1;
        id
    }

    /// Write a solution vector back into the project.
    pub fn apply(&self, project: &mut Project, vars: &DVector<f64>) {
        let view = Vars {
            layout: self,
            values: vars,
        };
        let point_keys: Vec<PointKey> = self.point_slots.keys().collect();
        for key in point_keys {
            let slots = &self.point_slots[key];
            let xyz = Vector3::new(
                view.get(slots[0]),
                view.get(slots[1]),
                view.get(slots[2]),
            );
            let _ = project.set_optimized_xyz(key, xyz);
        }
        let camera_keys: Vec<ViewpointKey> = self.camera_slots.keys().collect();
        for key in camera_keys {
            let slots = &self.camera_slots[key];
            if !slots.optimized {
                continue;
            }
            let position = Vector3::new(
                view.get(slots.position[0]),
                view.get(slots.position[1]),
                view.get(slots.position[2]),
            );
            let rotation = Quaternion::new(
                view.get(slots.rotation[0]),
                view.get(slots.rotation[1]),
                view.get(slots.rotation[2]),
                view.get(slots.rotation[3]),
            );
            let _ = project.set_viewpoint_pose(key, position, rotation);
            if let SlotRef::Var(_) = slots.focal {
                if let Some(vp) = project.viewpoint_mut(key) {
                    vp.focal_length = view.get(slots.focal);
                }
            }
        }
    }
}

/// One view of (variables, constants) during an evaluation.
#[derive(Clone, Copy)]
pub struct Vars<'a> {
    pub layout: &'a VariableLayout,
    pub values: &'a DVector<f64>,
}

impl Vars<'_> {
    #[inline]
    pub fn get(&self, slot: SlotRef) -> f64 {
        match slot {
            SlotRef::Var(i) => self.values[i],
            SlotRef::Const(i) => self.layout.constants[i],
        }
    }

    pub fn point(&self, slots: &PointSlots) -> Var3<f64> {
        Var3::new(
            self.get(slots[0]),
            self.get(slots[1]),
            self.get(slots[2]),
        )
    }

    pub fn camera(&self, slots: &CameraSlots) -> CameraParams<f64> {
        CameraParams {
            position: Var3::new(
                self.get(slots.position[0]),
                self.get(slots.position[1]),
                self.get(slots.position[2]),
            ),
            rotation: VarQuat::new(
                self.get(slots.rotation[0]),
                self.get(slots.rotation[1]),
                self.get(slots.rotation[2]),
                self.get(slots.rotation[3]),
            ),
            focal: self.get(slots.focal),
            aspect: slots.fixed.aspect,
            cx: slots.fixed.cx,
            cy: slots.fixed.cy,
            skew: slots.fixed.skew,
            k1: slots.fixed.k1,
            k2: slots.fixed.k2,
            k3: slots.fixed.k3,
            p1: slots.fixed.p1,
            p2: slots.fixed.p2,
            z_reflected: slots.fixed.z_reflected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn locked_axes_become_constants() {
        let mut project = Project::new();
        let p = project.add_point("p");
        project.point_mut(p).unwrap().axes =
            [AxisState::Locked(1.0), AxisState::Free, AxisState::Free];
        let layout = VariableLayout::build(&project, &LayoutOptions::default());
        // only the two unlocked axes become variables
        assert_eq!(layout.num_variables(), 2);
        let slots = layout.point_slots(p).unwrap();
        assert!(matches!(slots[0], SlotRef::Const(_)));
        assert!(matches!(slots[1], SlotRef::Var(_)));
    }

    #[test]
    fn disabled_pose_contributes_no_variables() {
        let mut project = Project::new();
        project.add_viewpoint("cam", 640, 480);
        let opts = LayoutOptions {
            optimize_pose: false,
            optimize_intrinsics: false,
        };
        let layout = VariableLayout::build(&project, &opts);
        assert_eq!(layout.num_variables(), 0);

        let layout = VariableLayout::build(&project, &LayoutOptions::default());
        assert_eq!(layout.num_variables(), 7); // position + quaternion

        let opts = LayoutOptions {
            optimize_pose: true,
            optimize_intrinsics: true,
        };
        let layout = VariableLayout::build(&project, &opts);
        assert_eq!(layout.num_variables(), 8); // + focal
    }

    #[test]
    fn apply_writes_optimized_coordinates() {
        let mut project = Project::new();
        let p = project.add_point("p");
        project.point_mut(p).unwrap().axes =
            [AxisState::Locked(9.0), AxisState::Free, AxisState::Free];
        let layout = VariableLayout::build(&project, &LayoutOptions::default());
        let mut vars = layout.initial_values();
        vars[0] = 4.0;
        vars[1] = 5.0;
        layout.apply(&mut project, &vars);
        let xyz = project.point(p).unwrap().optimized_xyz.unwrap();
        assert_relative_eq!(xyz.x, 9.0); // locked constant flows through
        assert_relative_eq!(xyz.y, 4.0);
        assert_relative_eq!(xyz.z, 5.0);
    }

    #[test]
    fn provider_ids_are_monotonic() {
        let project = Project::new();
        let mut layout = VariableLayout::build(&project, &LayoutOptions::default());
        assert_eq!(layout.next_provider_id(), 0);
        assert_eq!(layout.next_provider_id(), 1);
    }
}
