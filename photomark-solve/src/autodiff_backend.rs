//! Back end A: residual evaluation over tape [`Value`]s with one reverse
//! sweep per residual row.
//!
//! Every Jacobian evaluation rebuilds the expression graph of each residual
//! group from the current variable values; graphs never survive an
//! evaluation.

use std::collections::HashMap;

use nalgebra::{DMatrix, DVector};

use photomark_autodiff::{Tape, Value, Var3, VarQuat};
use photomark_types::{PointKey, Project, ViewpointKey};

use crate::camera::CameraParams;
use crate::layout::{CameraSlots, PointSlots, SlotRef, VariableLayout, Vars};
use crate::lm::LeastSquaresSystem;
use crate::residuals::OperandSource;
use crate::system::{group_points, group_residuals, group_viewpoints, ResidualGroup};
use crate::SolveError;

/// Operand source reading straight from the layout's slots (plain numbers).
pub struct SlotSource<'a> {
    pub vars: Vars<'a>,
}

impl OperandSource<f64> for SlotSource<'_> {
    fn point(&self, key: PointKey) -> Option<Var3<f64>> {
        self.vars.layout.point_slots(key).map(|s| self.vars.point(s))
    }

    fn camera(&self, key: ViewpointKey) -> Option<CameraParams<f64>> {
        self.vars
            .layout
            .camera_slots(key)
            .map(|s| self.vars.camera(s))
    }

    fn context(&self) -> f64 {
        0.0
    }
}

/// Operand source whose values are tape leaves for one residual group.
struct TapeSource<'t> {
    points: HashMap<PointKey, Var3<Value<'t>>>,
    cameras: HashMap<ViewpointKey, CameraParams<Value<'t>>>,
    ctx: Value<'t>,
}

impl<'t> OperandSource<Value<'t>> for TapeSource<'t> {
    fn point(&self, key: PointKey) -> Option<Var3<Value<'t>>> {
        self.points.get(&key).copied()
    }

    fn camera(&self, key: ViewpointKey) -> Option<CameraParams<Value<'t>>> {
        self.cameras.get(&key).copied()
    }

    fn context(&self) -> Value<'t> {
        self.ctx
    }
}

/// The autodiff-driven least-squares system.
pub struct AutodiffSystem<'p> {
    project: &'p Project,
    layout: &'p VariableLayout,
    groups: Vec<ResidualGroup>,
}

impl<'p> AutodiffSystem<'p> {
    pub fn new(
        project: &'p Project,
        layout: &'p VariableLayout,
        groups: Vec<ResidualGroup>,
    ) -> Self {
        Self {
            project,
            layout,
            groups,
        }
    }

    /// Lift one slot onto the tape; active variables become leaves that are
    /// remembered for gradient harvesting.
    fn lift_slot<'t>(
        &self,
        tape: &'t Tape,
        vars: &DVector<f64>,
        slot: SlotRef,
        leaves: &mut Vec<(usize, Value<'t>)>,
    ) -> Value<'t> {
        match slot {
            SlotRef::Var(i) => {
                let leaf = tape.var(vars[i]);
                leaves.push((i, leaf));
                leaf
            }
            SlotRef::Const(i) => tape.constant(self.layout.constants()[i]),
        }
    }

    fn lift_point<'t>(
        &self,
        tape: &'t Tape,
        vars: &DVector<f64>,
        slots: &PointSlots,
        leaves: &mut Vec<(usize, Value<'t>)>,
    ) -> Var3<Value<'t>> {
        Var3::new(
            self.lift_slot(tape, vars, slots[0], leaves),
            self.lift_slot(tape, vars, slots[1], leaves),
            self.lift_slot(tape, vars, slots[2], leaves),
        )
    }

    fn lift_camera<'t>(
        &self,
        tape: &'t Tape,
        vars: &DVector<f64>,
        slots: &CameraSlots,
        leaves: &mut Vec<(usize, Value<'t>)>,
    ) -> CameraParams<Value<'t>> {
        CameraParams {
            position: Var3::new(
                self.lift_slot(tape, vars, slots.position[0], leaves),
                self.lift_slot(tape, vars, slots.position[1], leaves),
                self.lift_slot(tape, vars, slots.position[2], leaves),
            ),
            rotation: VarQuat::new(
                self.lift_slot(tape, vars, slots.rotation[0], leaves),
                self.lift_slot(tape, vars, slots.rotation[1], leaves),
                self.lift_slot(tape, vars, slots.rotation[2], leaves),
                self.lift_slot(tape, vars, slots.rotation[3], leaves),
            ),
            focal: self.lift_slot(tape, vars, slots.focal, leaves),
            aspect: tape.constant(slots.fixed.aspect),
            cx: tape.constant(slots.fixed.cx),
            cy: tape.constant(slots.fixed.cy),
            skew: tape.constant(slots.fixed.skew),
            k1: tape.constant(slots.fixed.k1),
            k2: tape.constant(slots.fixed.k2),
            k3: tape.constant(slots.fixed.k3),
            p1: tape.constant(slots.fixed.p1),
            p2: tape.constant(slots.fixed.p2),
            z_reflected: slots.fixed.z_reflected,
        }
    }
}

impl LeastSquaresSystem for AutodiffSystem<'_> {
    fn num_variables(&self) -> usize {
        self.layout.num_variables()
    }

    fn residuals(&mut self, vars: &DVector<f64>) -> Result<DVector<f64>, SolveError> {
        let source = SlotSource {
            vars: Vars {
                layout: self.layout,
                values: vars,
            },
        };
        let mut out = Vec::new();
        for group in &self.groups {
            for r in group_residuals(self.project, group, &source) {
                out.push(r * group.weight);
            }
        }
        Ok(DVector::from_column_slice(&out))
    }

    fn jacobian(&mut self, vars: &DVector<f64>) -> Result<DMatrix<f64>, SolveError> {
        // count rows first with a plain evaluation
        let m = self.residuals(vars)?.len();
        let n = self.num_variables();
        let mut jac = DMatrix::zeros(m, n);

        let mut row = 0;
        for group in &self.groups {
            let tape = Tape::new();
            let mut leaves = Vec::new();

            let mut points = HashMap::new();
            for key in group_points(self.project, group) {
                if let Some(slots) = self.layout.point_slots(key) {
                    points.insert(key, self.lift_point(&tape, vars, slots, &mut leaves));
                }
            }
            let mut cameras = HashMap::new();
            for key in group_viewpoints(self.project, group) {
                if let Some(slots) = self.layout.camera_slots(key) {
                    cameras.insert(key, self.lift_camera(&tape, vars, slots, &mut leaves));
                }
            }
            let source = TapeSource {
                points,
                cameras,
                ctx: tape.constant(0.0),
            };

            let residuals = group_residuals(self.project, group, &source);
            for r in residuals {
                let grads = r.grad();
                for (var_index, leaf) in &leaves {
                    jac[(row, *var_index)] += grads.wrt(*leaf) * group.weight;
                }
                row += 1;
            }
        }
        debug_assert_eq!(row, m);
        Ok(jac)
    }
}
