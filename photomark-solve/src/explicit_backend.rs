//! Back end B: residual providers with hand-derived analytic Jacobians.
//!
//! Each provider exposes its residual count, the optimisation variables it
//! touches, and residual/Jacobian evaluation against a [`Vars`] view. The
//! assembled [`ExplicitSystem`] feeds the LM core with either a dense
//! Jacobian or per-row sparse entries.

use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

use photomark_types::{ConstraintKind, Project};

use crate::camera::{project_with_jacobians, BEHIND_CAMERA_RESIDUAL};
use crate::layout::{CameraSlots, PointSlots, SlotRef, VariableLayout, Vars};
use crate::lm::{LeastSquaresSystem, SparseJacobian};
use crate::system::{GroupKind, ResidualGroup};
use crate::SolveError;

/// One residual block with analytic derivatives.
pub trait ResidualProvider {
    fn id(&self) -> u32;
    fn residual_count(&self) -> usize;
    /// Optimisation variables this block depends on; Jacobian rows are
    /// aligned with this list.
    fn variable_indices(&self) -> &[usize];
    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64>;
    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>>;
}

/// Maps an ordered slot list onto the provider's local Jacobian columns.
/// Constant slots produce no column; a variable appearing twice accumulates.
struct Bindings {
    var_indices: Vec<usize>,
    cols: Vec<Option<usize>>,
}

impl Bindings {
    fn new(slots: &[SlotRef]) -> Self {
        let mut var_indices: Vec<usize> = Vec::new();
        let mut cols = Vec::with_capacity(slots.len());
        for slot in slots {
            match slot {
                SlotRef::Var(i) => {
                    let col = match var_indices.iter().position(|v| v == i) {
                        Some(pos) => pos,
                        None => {
                            var_indices.push(*i);
                            var_indices.len() - 1
                        }
                    };
                    cols.push(Some(col));
                }
                SlotRef::Const(_) => cols.push(None),
            }
        }
        Self { var_indices, cols }
    }

    fn empty_row(&self) -> Vec<f64> {
        vec![0.0; self.var_indices.len()]
    }

    /// Accumulate ∂r/∂slot into the row.
    fn add(&self, row: &mut [f64], slot_pos: usize, value: f64) {
        if let Some(col) = self.cols[slot_pos] {
            row[col] += value;
        }
    }

    /// Accumulate a 3-vector gradient for the point starting at `base`.
    fn add_vec3(&self, row: &mut [f64], base: usize, g: &Vector3<f64>) {
        for i in 0..3 {
            self.add(row, base + i, g[i]);
        }
    }
}

fn read_point(vars: &Vars<'_>, slots: &PointSlots) -> Vector3<f64> {
    Vector3::new(
        vars.get(slots[0]),
        vars.get(slots[1]),
        vars.get(slots[2]),
    )
}

fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -v.z, v.y, v.z, 0.0, -v.x, -v.y, v.x, 0.0)
}

const DEGENERATE_EPS: f64 = 1e-12;

// ---- distance / line length ------------------------------------------------

pub struct DistanceProvider {
    id: u32,
    weight: f64,
    target: f64,
    a: PointSlots,
    b: PointSlots,
    bindings: Bindings,
}

impl DistanceProvider {
    pub fn new(id: u32, weight: f64, target: f64, a: PointSlots, b: PointSlots) -> Self {
        let slots: Vec<SlotRef> = a.iter().chain(b.iter()).copied().collect();
        Self {
            id,
            weight,
            target,
            a,
            b,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for DistanceProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let a = read_point(vars, &self.a);
        let b = read_point(vars, &self.b);
        vec![self.weight * ((b - a).norm() - self.target)]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let a = read_point(vars, &self.a);
        let b = read_point(vars, &self.b);
        let mut row = self.bindings.empty_row();
        let diff = b - a;
        let len = diff.norm();
        if len > DEGENERATE_EPS {
            let dir = diff / len * self.weight;
            self.bindings.add_vec3(&mut row, 0, &(-dir));
            self.bindings.add_vec3(&mut row, 3, &dir);
        }
        vec![row]
    }
}

// ---- angle at a vertex -----------------------------------------------------

/// Gradient of ∠(A−V, C−V) with respect to A, V, C. Zero near degeneracy.
fn angle_gradients(
    a: &Vector3<f64>,
    v: &Vector3<f64>,
    c: &Vector3<f64>,
) -> Option<(Vector3<f64>, Vector3<f64>, Vector3<f64>)> {
    let u = a - v;
    let w = c - v;
    let nu = u.norm();
    let nw = w.norm();
    if nu < DEGENERATE_EPS || nw < DEGENERATE_EPS {
        return None;
    }
    let cos = u.dot(&w) / (nu * nw);
    let sin = u.cross(&w).norm() / (nu * nw);
    if sin < 1e-9 {
        return None;
    }
    // θ = acos(u·w / |u||w|)
    let grad_u = -(w / (nu * nw) - u * (cos / (nu * nu))) / sin;
    let grad_w = -(u / (nu * nw) - w * (cos / (nw * nw))) / sin;
    let grad_v = -(grad_u + grad_w);
    Some((grad_u, grad_v, grad_w))
}

pub struct AngleProvider {
    id: u32,
    weight: f64,
    /// Target angle in radians (stored targets are degrees; converted once).
    target: f64,
    a: PointSlots,
    v: PointSlots,
    c: PointSlots,
    bindings: Bindings,
}

impl AngleProvider {
    pub fn new(
        id: u32,
        weight: f64,
        target_radians: f64,
        a: PointSlots,
        v: PointSlots,
        c: PointSlots,
    ) -> Self {
        let slots: Vec<SlotRef> = a.iter().chain(v.iter()).chain(c.iter()).copied().collect();
        Self {
            id,
            weight,
            target: target_radians,
            a,
            v,
            c,
            bindings: Bindings::new(&slots),
        }
    }
}

fn angle_at(a: &Vector3<f64>, v: &Vector3<f64>, c: &Vector3<f64>) -> f64 {
    let u = a - v;
    let w = c - v;
    u.cross(&w).norm().atan2(u.dot(&w))
}

impl ResidualProvider for AngleProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let a = read_point(vars, &self.a);
        let v = read_point(vars, &self.v);
        let c = read_point(vars, &self.c);
        vec![self.weight * (angle_at(&a, &v, &c) - self.target)]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let a = read_point(vars, &self.a);
        let v = read_point(vars, &self.v);
        let c = read_point(vars, &self.c);
        let mut row = self.bindings.empty_row();
        if let Some((ga, gv, gc)) = angle_gradients(&a, &v, &c) {
            self.bindings.add_vec3(&mut row, 0, &(ga * self.weight));
            self.bindings.add_vec3(&mut row, 3, &(gv * self.weight));
            self.bindings.add_vec3(&mut row, 6, &(gc * self.weight));
        }
        vec![row]
    }
}

// ---- fixed point -----------------------------------------------------------

pub struct FixedPointProvider {
    id: u32,
    weight: f64,
    target: Vector3<f64>,
    p: PointSlots,
    bindings: Bindings,
}

impl FixedPointProvider {
    pub fn new(id: u32, weight: f64, target: Vector3<f64>, p: PointSlots) -> Self {
        Self {
            id,
            weight,
            target,
            p,
            bindings: Bindings::new(&p),
        }
    }
}

impl ResidualProvider for FixedPointProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        3
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let p = read_point(vars, &self.p);
        (0..3).map(|i| self.weight * (p[i] - self.target[i])).collect()
    }

    fn jacobian(&self, _vars: &Vars<'_>) -> Vec<Vec<f64>> {
        (0..3)
            .map(|i| {
                let mut row = self.bindings.empty_row();
                self.bindings.add(&mut row, i, self.weight);
                row
            })
            .collect()
    }
}

// ---- collinear (one provider per extra point) ------------------------------

pub struct CollinearProvider {
    id: u32,
    weight: f64,
    p0: PointSlots,
    p1: PointSlots,
    extra: PointSlots,
    bindings: Bindings,
}

impl CollinearProvider {
    pub fn new(id: u32, weight: f64, p0: PointSlots, p1: PointSlots, extra: PointSlots) -> Self {
        let slots: Vec<SlotRef> = p0
            .iter()
            .chain(p1.iter())
            .chain(extra.iter())
            .copied()
            .collect();
        Self {
            id,
            weight,
            p0,
            p1,
            extra,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for CollinearProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        3
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let p0 = read_point(vars, &self.p0);
        let p1 = read_point(vars, &self.p1);
        let pe = read_point(vars, &self.extra);
        let r = (p1 - p0).cross(&(pe - p0)) * self.weight;
        vec![r.x, r.y, r.z]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let p0 = read_point(vars, &self.p0);
        let p1 = read_point(vars, &self.p1);
        let pe = read_point(vars, &self.extra);
        let u = p1 - p0;
        let v = pe - p0;
        // r = u×v: ∂r/∂p1 = −[v]ₓ, ∂r/∂extra = [u]ₓ, ∂r/∂p0 = [v]ₓ − [u]ₓ
        let d_p1 = -skew(&v) * self.weight;
        let d_pe = skew(&u) * self.weight;
        let d_p0 = (skew(&v) - skew(&u)) * self.weight;
        (0..3)
            .map(|comp| {
                let mut row = self.bindings.empty_row();
                self.bindings
                    .add_vec3(&mut row, 0, &d_p0.row(comp).transpose());
                self.bindings
                    .add_vec3(&mut row, 3, &d_p1.row(comp).transpose());
                self.bindings
                    .add_vec3(&mut row, 6, &d_pe.row(comp).transpose());
                row
            })
            .collect()
    }
}

// ---- coplanar (one provider per extra point, first three as base) ----------

pub struct CoplanarProvider {
    id: u32,
    weight: f64,
    p0: PointSlots,
    p1: PointSlots,
    p2: PointSlots,
    extra: PointSlots,
    bindings: Bindings,
}

impl CoplanarProvider {
    pub fn new(
        id: u32,
        weight: f64,
        p0: PointSlots,
        p1: PointSlots,
        p2: PointSlots,
        extra: PointSlots,
    ) -> Self {
        let slots: Vec<SlotRef> = p0
            .iter()
            .chain(p1.iter())
            .chain(p2.iter())
            .chain(extra.iter())
            .copied()
            .collect();
        Self {
            id,
            weight,
            p0,
            p1,
            p2,
            extra,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for CoplanarProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let p0 = read_point(vars, &self.p0);
        let p1 = read_point(vars, &self.p1);
        let p2 = read_point(vars, &self.p2);
        let q = read_point(vars, &self.extra);
        let n = (p1 - p0).cross(&(p2 - p0));
        let denom = (n.norm_squared() + crate::residuals::COPLANAR_EPSILON).sqrt();
        vec![self.weight * (q - p0).dot(&n) / denom]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let p0 = read_point(vars, &self.p0);
        let p1 = read_point(vars, &self.p1);
        let p2 = read_point(vars, &self.p2);
        let q = read_point(vars, &self.extra);
        let u = p1 - p0;
        let v = p2 - p0;
        let n = u.cross(&v);
        let s = (n.norm_squared() + crate::residuals::COPLANAR_EPSILON).sqrt();
        let d = (q - p0).dot(&n);

        // r = d/s with s = sqrt(n·n + ε)
        let g_n = (q - p0) / s - n * (d / (s * s * s));
        let d_q = n / s;
        let d_p1 = v.cross(&g_n); // g_nᵀ·(−[v]ₓ)
        let d_p2 = g_n.cross(&u); // g_nᵀ·[u]ₓ
        let d_p0 = -(d_q + d_p1 + d_p2); // translation invariance

        let mut row = self.bindings.empty_row();
        self.bindings.add_vec3(&mut row, 0, &(d_p0 * self.weight));
        self.bindings.add_vec3(&mut row, 3, &(d_p1 * self.weight));
        self.bindings.add_vec3(&mut row, 6, &(d_p2 * self.weight));
        self.bindings.add_vec3(&mut row, 9, &(d_q * self.weight));
        vec![row]
    }
}

// ---- parallel / perpendicular lines ----------------------------------------

/// ∂(u/|u|)/∂u = (I − ûûᵀ)/|u|
fn normalize_jacobian(raw: &Vector3<f64>) -> Option<(Vector3<f64>, Matrix3<f64>)> {
    let len = raw.norm();
    if len < DEGENERATE_EPS {
        return None;
    }
    let unit = raw / len;
    Some((unit, (Matrix3::identity() - unit * unit.transpose()) / len))
}

pub struct ParallelLinesProvider {
    id: u32,
    weight: f64,
    a0: PointSlots,
    a1: PointSlots,
    b0: PointSlots,
    b1: PointSlots,
    bindings: Bindings,
}

impl ParallelLinesProvider {
    pub fn new(
        id: u32,
        weight: f64,
        a0: PointSlots,
        a1: PointSlots,
        b0: PointSlots,
        b1: PointSlots,
    ) -> Self {
        let slots: Vec<SlotRef> = a0
            .iter()
            .chain(a1.iter())
            .chain(b0.iter())
            .chain(b1.iter())
            .copied()
            .collect();
        Self {
            id,
            weight,
            a0,
            a1,
            b0,
            b1,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for ParallelLinesProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        3
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let u = read_point(vars, &self.a1) - read_point(vars, &self.a0);
        let w = read_point(vars, &self.b1) - read_point(vars, &self.b0);
        let r = u.normalize().cross(&w.normalize()) * self.weight;
        vec![r.x, r.y, r.z]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let u_raw = read_point(vars, &self.a1) - read_point(vars, &self.a0);
        let w_raw = read_point(vars, &self.b1) - read_point(vars, &self.b0);
        let (Some((u, ju)), Some((w, jw))) =
            (normalize_jacobian(&u_raw), normalize_jacobian(&w_raw))
        else {
            return vec![self.bindings.empty_row(); 3];
        };
        // r = û×ŵ
        let d_u = -skew(&w) * ju * self.weight;
        let d_w = skew(&u) * jw * self.weight;
        (0..3)
            .map(|comp| {
                let mut row = self.bindings.empty_row();
                let gu = d_u.row(comp).transpose();
                let gw = d_w.row(comp).transpose();
                self.bindings.add_vec3(&mut row, 0, &(-gu));
                self.bindings.add_vec3(&mut row, 3, &gu);
                self.bindings.add_vec3(&mut row, 6, &(-gw));
                self.bindings.add_vec3(&mut row, 9, &gw);
                row
            })
            .collect()
    }
}

pub struct PerpendicularLinesProvider {
    id: u32,
    weight: f64,
    a0: PointSlots,
    a1: PointSlots,
    b0: PointSlots,
    b1: PointSlots,
    bindings: Bindings,
}

impl PerpendicularLinesProvider {
    pub fn new(
        id: u32,
        weight: f64,
        a0: PointSlots,
        a1: PointSlots,
        b0: PointSlots,
        b1: PointSlots,
    ) -> Self {
        let slots: Vec<SlotRef> = a0
            .iter()
            .chain(a1.iter())
            .chain(b0.iter())
            .chain(b1.iter())
            .copied()
            .collect();
        Self {
            id,
            weight,
            a0,
            a1,
            b0,
            b1,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for PerpendicularLinesProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let u = read_point(vars, &self.a1) - read_point(vars, &self.a0);
        let w = read_point(vars, &self.b1) - read_point(vars, &self.b0);
        vec![self.weight * u.normalize().dot(&w.normalize())]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let u_raw = read_point(vars, &self.a1) - read_point(vars, &self.a0);
        let w_raw = read_point(vars, &self.b1) - read_point(vars, &self.b0);
        let (Some((u, ju)), Some((w, jw))) =
            (normalize_jacobian(&u_raw), normalize_jacobian(&w_raw))
        else {
            return vec![self.bindings.empty_row()];
        };
        let g_u = ju.transpose() * w * self.weight;
        let g_w = jw.transpose() * u * self.weight;
        let mut row = self.bindings.empty_row();
        self.bindings.add_vec3(&mut row, 0, &(-g_u));
        self.bindings.add_vec3(&mut row, 3, &g_u);
        self.bindings.add_vec3(&mut row, 6, &(-g_w));
        self.bindings.add_vec3(&mut row, 9, &g_w);
        vec![row]
    }
}

// ---- equal distances / equal angles ----------------------------------------

pub struct EqualDistancesProvider {
    id: u32,
    weight: f64,
    pairs: Vec<(PointSlots, PointSlots)>,
    bindings: Bindings,
}

impl EqualDistancesProvider {
    pub fn new(id: u32, weight: f64, pairs: Vec<(PointSlots, PointSlots)>) -> Self {
        let slots: Vec<SlotRef> = pairs
            .iter()
            .flat_map(|(a, b)| a.iter().chain(b.iter()).copied().collect::<Vec<_>>())
            .collect();
        Self {
            id,
            weight,
            pairs,
            bindings: Bindings::new(&slots),
        }
    }

    fn pair_dir(&self, vars: &Vars<'_>, i: usize) -> Option<(f64, Vector3<f64>)> {
        let (a, b) = &self.pairs[i];
        let diff = read_point(vars, b) - read_point(vars, a);
        let len = diff.norm();
        (len > DEGENERATE_EPS).then(|| (len, diff / len))
    }
}

impl ResidualProvider for EqualDistancesProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        self.pairs.len() - 1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let first = {
            let (a, b) = &self.pairs[0];
            (read_point(vars, b) - read_point(vars, a)).norm()
        };
        self.pairs[1..]
            .iter()
            .map(|(a, b)| {
                self.weight * ((read_point(vars, b) - read_point(vars, a)).norm() - first)
            })
            .collect()
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let first = self.pair_dir(vars, 0);
        (1..self.pairs.len())
            .map(|i| {
                let mut row = self.bindings.empty_row();
                if let Some((_, dir)) = self.pair_dir(vars, i) {
                    let base = 6 * i;
                    self.bindings.add_vec3(&mut row, base, &(-dir * self.weight));
                    self.bindings
                        .add_vec3(&mut row, base + 3, &(dir * self.weight));
                }
                if let Some((_, dir0)) = first {
                    self.bindings.add_vec3(&mut row, 0, &(dir0 * self.weight));
                    self.bindings.add_vec3(&mut row, 3, &(-dir0 * self.weight));
                }
                row
            })
            .collect()
    }
}

pub struct EqualAnglesProvider {
    id: u32,
    weight: f64,
    triplets: Vec<(PointSlots, PointSlots, PointSlots)>,
    bindings: Bindings,
}

impl EqualAnglesProvider {
    pub fn new(id: u32, weight: f64, triplets: Vec<(PointSlots, PointSlots, PointSlots)>) -> Self {
        let slots: Vec<SlotRef> = triplets
            .iter()
            .flat_map(|(a, v, c)| {
                a.iter()
                    .chain(v.iter())
                    .chain(c.iter())
                    .copied()
                    .collect::<Vec<_>>()
            })
            .collect();
        Self {
            id,
            weight,
            triplets,
            bindings: Bindings::new(&slots),
        }
    }

    fn triplet_points(
        &self,
        vars: &Vars<'_>,
        i: usize,
    ) -> (Vector3<f64>, Vector3<f64>, Vector3<f64>) {
        let (a, v, c) = &self.triplets[i];
        (read_point(vars, a), read_point(vars, v), read_point(vars, c))
    }
}

impl ResidualProvider for EqualAnglesProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        self.triplets.len() - 1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let (a0, v0, c0) = self.triplet_points(vars, 0);
        let first = angle_at(&a0, &v0, &c0);
        (1..self.triplets.len())
            .map(|i| {
                let (a, v, c) = self.triplet_points(vars, i);
                self.weight * (angle_at(&a, &v, &c) - first)
            })
            .collect()
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let (a0, v0, c0) = self.triplet_points(vars, 0);
        let first = angle_gradients(&a0, &v0, &c0);
        (1..self.triplets.len())
            .map(|i| {
                let mut row = self.bindings.empty_row();
                let (a, v, c) = self.triplet_points(vars, i);
                if let Some((ga, gv, gc)) = angle_gradients(&a, &v, &c) {
                    let base = 9 * i;
                    self.bindings.add_vec3(&mut row, base, &(ga * self.weight));
                    self.bindings
                        .add_vec3(&mut row, base + 3, &(gv * self.weight));
                    self.bindings
                        .add_vec3(&mut row, base + 6, &(gc * self.weight));
                }
                if let Some((ga, gv, gc)) = first {
                    self.bindings.add_vec3(&mut row, 0, &(-ga * self.weight));
                    self.bindings.add_vec3(&mut row, 3, &(-gv * self.weight));
                    self.bindings.add_vec3(&mut row, 6, &(-gc * self.weight));
                }
                row
            })
            .collect()
    }
}

// ---- line axis direction ---------------------------------------------------

pub struct LineAxisProvider {
    id: u32,
    weight: f64,
    a: PointSlots,
    b: PointSlots,
    zero_components: &'static [usize],
    bindings: Bindings,
}

impl LineAxisProvider {
    pub fn new(
        id: u32,
        weight: f64,
        a: PointSlots,
        b: PointSlots,
        zero_components: &'static [usize],
    ) -> Self {
        let slots: Vec<SlotRef> = a.iter().chain(b.iter()).copied().collect();
        Self {
            id,
            weight,
            a,
            b,
            zero_components,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for LineAxisProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        self.zero_components.len()
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let d = (read_point(vars, &self.b) - read_point(vars, &self.a)).normalize();
        self.zero_components
            .iter()
            .map(|k| self.weight * d[*k])
            .collect()
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let raw = read_point(vars, &self.b) - read_point(vars, &self.a);
        let Some((_, jac)) = normalize_jacobian(&raw) else {
            return vec![self.bindings.empty_row(); self.zero_components.len()];
        };
        self.zero_components
            .iter()
            .map(|k| {
                let mut row = self.bindings.empty_row();
                let g = jac.row(*k).transpose() * self.weight;
                self.bindings.add_vec3(&mut row, 0, &(-g));
                self.bindings.add_vec3(&mut row, 3, &g);
                row
            })
            .collect()
    }
}

// ---- coincident point on a line --------------------------------------------

pub struct CoincidentProvider {
    id: u32,
    weight: f64,
    a: PointSlots,
    b: PointSlots,
    p: PointSlots,
    bindings: Bindings,
}

impl CoincidentProvider {
    pub fn new(id: u32, weight: f64, a: PointSlots, b: PointSlots, p: PointSlots) -> Self {
        let slots: Vec<SlotRef> = a.iter().chain(b.iter()).chain(p.iter()).copied().collect();
        Self {
            id,
            weight,
            a,
            b,
            p,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for CoincidentProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        3
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let a = read_point(vars, &self.a);
        let b = read_point(vars, &self.b);
        let p = read_point(vars, &self.p);
        let w = b - a;
        let r = (p - a).cross(&w) * (self.weight / w.norm());
        vec![r.x, r.y, r.z]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let a = read_point(vars, &self.a);
        let b = read_point(vars, &self.b);
        let p = read_point(vars, &self.p);
        let w = b - a;
        let len = w.norm();
        if len < DEGENERATE_EPS {
            return vec![self.bindings.empty_row(); 3];
        }
        let unit = w / len;
        let pa = p - a;
        let m = pa.cross(&w);

        // r = (p−a)×w / |w|
        let d_p = -skew(&w) / len;
        let d_b = skew(&pa) / len - m * unit.transpose() / (len * len);
        let d_a = (skew(&w) - skew(&pa)) / len + m * unit.transpose() / (len * len);

        (0..3)
            .map(|comp| {
                let mut row = self.bindings.empty_row();
                self.bindings.add_vec3(
                    &mut row,
                    0,
                    &(d_a.row(comp).transpose() * self.weight),
                );
                self.bindings.add_vec3(
                    &mut row,
                    3,
                    &(d_b.row(comp).transpose() * self.weight),
                );
                self.bindings.add_vec3(
                    &mut row,
                    6,
                    &(d_p.row(comp).transpose() * self.weight),
                );
                row
            })
            .collect()
    }
}

// ---- reprojection ----------------------------------------------------------

pub struct ReprojectionProvider {
    id: u32,
    weight: f64,
    observed: (f64, f64),
    point: PointSlots,
    camera: CameraSlots,
    bindings: Bindings,
}

impl ReprojectionProvider {
    pub fn new(
        id: u32,
        weight: f64,
        observed: (f64, f64),
        point: PointSlots,
        camera: CameraSlots,
    ) -> Self {
        let mut slots: Vec<SlotRef> = point.to_vec();
        slots.extend(camera.position);
        slots.extend(camera.rotation);
        slots.push(camera.focal);
        Self {
            id,
            weight,
            observed,
            point,
            camera,
            bindings: Bindings::new(&slots),
        }
    }
}

impl ResidualProvider for ReprojectionProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        2
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let cam = vars.camera(&self.camera);
        let world = read_point(vars, &self.point);
        match crate::camera::project_point(
            &cam,
            photomark_autodiff::Var3::new(world.x, world.y, world.z),
        ) {
            Some((u, v)) => vec![
                self.weight * (u - self.observed.0),
                self.weight * (v - self.observed.1),
            ],
            None => vec![
                self.weight * BEHIND_CAMERA_RESIDUAL,
                self.weight * BEHIND_CAMERA_RESIDUAL,
            ],
        }
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let cam = vars.camera(&self.camera);
        let world = read_point(vars, &self.point);
        let Some(jac) = project_with_jacobians(&cam, &world) else {
            return vec![self.bindings.empty_row(); 2];
        };
        (0..2)
            .map(|r| {
                let mut row = self.bindings.empty_row();
                for i in 0..3 {
                    self.bindings.add(&mut row, i, jac.d_point[(r, i)] * self.weight);
                    self.bindings
                        .add(&mut row, 3 + i, jac.d_position[(r, i)] * self.weight);
                }
                for i in 0..4 {
                    self.bindings
                        .add(&mut row, 6 + i, jac.d_quat[(r, i)] * self.weight);
                }
                self.bindings.add(&mut row, 10, jac.d_focal[r] * self.weight);
                row
            })
            .collect()
    }
}

// ---- vanishing point -------------------------------------------------------

/// Residual between a measured vanishing point and the projection of a world
/// axis direction. Touches rotation and focal length only; used by the
/// initialization refinement.
pub struct VanishingPointProvider {
    id: u32,
    weight: f64,
    axis: Vector3<f64>,
    measured: (f64, f64),
    camera: CameraSlots,
    bindings: Bindings,
}

impl VanishingPointProvider {
    pub fn new(
        id: u32,
        weight: f64,
        axis: Vector3<f64>,
        measured: (f64, f64),
        camera: CameraSlots,
    ) -> Self {
        let mut slots: Vec<SlotRef> = camera.rotation.to_vec();
        slots.push(camera.focal);
        Self {
            id,
            weight,
            axis,
            measured,
            camera,
            bindings: Bindings::new(&slots),
        }
    }

    fn direction(&self, vars: &Vars<'_>) -> (Vector3<f64>, Matrix3<f64>, nalgebra::Matrix3x4<f64>) {
        let q = nalgebra::Quaternion::new(
            vars.get(self.camera.rotation[0]),
            vars.get(self.camera.rotation[1]),
            vars.get(self.camera.rotation[2]),
            vars.get(self.camera.rotation[3]),
        );
        let (mut d, mut rot, mut dd_dq) = crate::camera::rotate_with_jacobians(&q, &self.axis);
        if self.camera.fixed.z_reflected {
            d.z = -d.z;
            for col in 0..3 {
                rot[(2, col)] = -rot[(2, col)];
            }
            for col in 0..4 {
                dd_dq[(2, col)] = -dd_dq[(2, col)];
            }
        }
        (d, rot, dd_dq)
    }
}

impl ResidualProvider for VanishingPointProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        2
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let (d, _, _) = self.direction(vars);
        if d.z.abs() < DEGENERATE_EPS {
            return vec![
                self.weight * BEHIND_CAMERA_RESIDUAL,
                self.weight * BEHIND_CAMERA_RESIDUAL,
            ];
        }
        let f = vars.get(self.camera.focal);
        let fixed = &self.camera.fixed;
        let xn = d.x / d.z;
        let yn = d.y / d.z;
        let u = f * xn + fixed.skew * yn + fixed.cx;
        let v = f * fixed.aspect * yn + fixed.cy;
        vec![
            self.weight * (u - self.measured.0),
            self.weight * (v - self.measured.1),
        ]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let (d, _, dd_dq) = self.direction(vars);
        if d.z.abs() < DEGENERATE_EPS {
            return vec![self.bindings.empty_row(); 2];
        }
        let f = vars.get(self.camera.focal);
        let fixed = &self.camera.fixed;
        let inv_z = 1.0 / d.z;
        let xn = d.x * inv_z;
        let yn = d.y * inv_z;
        #[rustfmt::skip]
        let j_norm = nalgebra::Matrix2x3::new(
            inv_z, 0.0, -d.x * inv_z * inv_z,
            0.0, inv_z, -d.y * inv_z * inv_z,
        );
        #[rustfmt::skip]
        let j_k = nalgebra::Matrix2::new(
            f, fixed.skew,
            0.0, f * fixed.aspect,
        );
        let d_quat = j_k * j_norm * dd_dq; // 2×4
        let d_focal = [xn, fixed.aspect * yn];
        (0..2)
            .map(|r| {
                let mut row = self.bindings.empty_row();
                for i in 0..4 {
                    self.bindings.add(&mut row, i, d_quat[(r, i)] * self.weight);
                }
                self.bindings.add(&mut row, 4, d_focal[r] * self.weight);
                row
            })
            .collect()
    }
}

// ---- quaternion norm -------------------------------------------------------

pub struct QuatNormProvider {
    id: u32,
    weight: f64,
    rotation: [SlotRef; 4],
    bindings: Bindings,
}

impl QuatNormProvider {
    pub fn new(id: u32, weight: f64, rotation: [SlotRef; 4]) -> Self {
        Self {
            id,
            weight,
            rotation,
            bindings: Bindings::new(&rotation),
        }
    }
}

impl ResidualProvider for QuatNormProvider {
    fn id(&self) -> u32 {
        self.id
    }
    fn residual_count(&self) -> usize {
        1
    }
    fn variable_indices(&self) -> &[usize] {
        &self.bindings.var_indices
    }

    fn residuals(&self, vars: &Vars<'_>) -> Vec<f64> {
        let q: Vec<f64> = self.rotation.iter().map(|s| vars.get(*s)).collect();
        let norm_sq: f64 = q.iter().map(|v| v * v).sum();
        vec![self.weight * (norm_sq - 1.0)]
    }

    fn jacobian(&self, vars: &Vars<'_>) -> Vec<Vec<f64>> {
        let mut row = self.bindings.empty_row();
        for (i, slot) in self.rotation.iter().enumerate() {
            self.bindings.add(&mut row, i, 2.0 * vars.get(*slot) * self.weight);
        }
        vec![row]
    }
}

// ---- system assembly -------------------------------------------------------

/// The explicit-Jacobian least-squares system.
pub struct ExplicitSystem {
    providers: Vec<Box<dyn ResidualProvider>>,
    num_vars: usize,
}

impl ExplicitSystem {
    pub fn from_providers(providers: Vec<Box<dyn ResidualProvider>>, num_vars: usize) -> Self {
        Self {
            providers,
            num_vars,
        }
    }

    /// Build the provider set for a project's residual groups.
    pub fn from_groups(
        project: &Project,
        layout: &mut VariableLayout,
        groups: &[ResidualGroup],
    ) -> Self {
        let mut providers: Vec<Box<dyn ResidualProvider>> = Vec::new();

        let point = |layout: &VariableLayout, key| *layout.point_slots(key).expect("point in layout");
        let camera =
            |layout: &VariableLayout, key| layout.camera_slots(key).expect("camera in layout").clone();

        for group in groups {
            let w = group.weight;
            match group.kind {
                GroupKind::Constraint(key) => {
                    let Some(constraint) = project.constraint(key) else {
                        continue;
                    };
                    match &constraint.kind {
                        ConstraintKind::DistancePointPoint { a, b, distance } => {
                            providers.push(Box::new(DistanceProvider::new(
                                layout.next_provider_id(),
                                w,
                                *distance,
                                point(layout, *a),
                                point(layout, *b),
                            )));
                        }
                        ConstraintKind::AnglePointPointPoint {
                            a,
                            vertex,
                            c,
                            degrees,
                        } => {
                            providers.push(Box::new(AngleProvider::new(
                                layout.next_provider_id(),
                                w,
                                degrees.to_radians(),
                                point(layout, *a),
                                point(layout, *vertex),
                                point(layout, *c),
                            )));
                        }
                        ConstraintKind::FixedPoint { point: p, target } => {
                            providers.push(Box::new(FixedPointProvider::new(
                                layout.next_provider_id(),
                                w,
                                *target,
                                point(layout, *p),
                            )));
                        }
                        ConstraintKind::CollinearPoints { points } => {
                            for extra in &points[2..] {
                                providers.push(Box::new(CollinearProvider::new(
                                    layout.next_provider_id(),
                                    w,
                                    point(layout, points[0]),
                                    point(layout, points[1]),
                                    point(layout, *extra),
                                )));
                            }
                        }
                        ConstraintKind::CoplanarPoints { points } => {
                            for extra in &points[3..] {
                                providers.push(Box::new(CoplanarProvider::new(
                                    layout.next_provider_id(),
                                    w,
                                    point(layout, points[0]),
                                    point(layout, points[1]),
                                    point(layout, points[2]),
                                    point(layout, *extra),
                                )));
                            }
                        }
                        ConstraintKind::ParallelLines { a, b } => {
                            let (Some(la), Some(lb)) = (project.line(*a), project.line(*b)) else {
                                continue;
                            };
                            providers.push(Box::new(ParallelLinesProvider::new(
                                layout.next_provider_id(),
                                w,
                                point(layout, la.point_a),
                                point(layout, la.point_b),
                                point(layout, lb.point_a),
                                point(layout, lb.point_b),
                            )));
                        }
                        ConstraintKind::PerpendicularLines { a, b } => {
                            let (Some(la), Some(lb)) = (project.line(*a), project.line(*b)) else {
                                continue;
                            };
                            providers.push(Box::new(PerpendicularLinesProvider::new(
                                layout.next_provider_id(),
                                w,
                                point(layout, la.point_a),
                                point(layout, la.point_b),
                                point(layout, lb.point_a),
                                point(layout, lb.point_b),
                            )));
                        }
                        ConstraintKind::EqualDistances { pairs } => {
                            providers.push(Box::new(EqualDistancesProvider::new(
                                layout.next_provider_id(),
                                w,
                                pairs
                                    .iter()
                                    .map(|(a, b)| (point(layout, *a), point(layout, *b)))
                                    .collect(),
                            )));
                        }
                        ConstraintKind::EqualAngles { triplets } => {
                            providers.push(Box::new(EqualAnglesProvider::new(
                                layout.next_provider_id(),
                                w,
                                triplets
                                    .iter()
                                    .map(|(a, v, c)| {
                                        (point(layout, *a), point(layout, *v), point(layout, *c))
                                    })
                                    .collect(),
                            )));
                        }
                        ConstraintKind::Projection {
                            point: p,
                            viewpoint,
                            observed,
                        } => {
                            providers.push(Box::new(ReprojectionProvider::new(
                                layout.next_provider_id(),
                                w,
                                (observed.x, observed.y),
                                point(layout, *p),
                                camera(layout, *viewpoint),
                            )));
                        }
                    }
                }
                GroupKind::LineLength(key) => {
                    let Some(line) = project.line(key) else { continue };
                    let Some(target) = line.target_length else {
                        continue;
                    };
                    providers.push(Box::new(DistanceProvider::new(
                        layout.next_provider_id(),
                        w,
                        target,
                        point(layout, line.point_a),
                        point(layout, line.point_b),
                    )));
                }
                GroupKind::LineAxis(key) => {
                    let Some(line) = project.line(key) else { continue };
                    providers.push(Box::new(LineAxisProvider::new(
                        layout.next_provider_id(),
                        w,
                        point(layout, line.point_a),
                        point(layout, line.point_b),
                        line.direction.zero_components(),
                    )));
                }
                GroupKind::Coincident(line_key, p) => {
                    let Some(line) = project.line(line_key) else {
                        continue;
                    };
                    providers.push(Box::new(CoincidentProvider::new(
                        layout.next_provider_id(),
                        w,
                        point(layout, line.point_a),
                        point(layout, line.point_b),
                        point(layout, p),
                    )));
                }
                GroupKind::Observation(key) => {
                    let Some(obs) = project.observation(key) else {
                        continue;
                    };
                    providers.push(Box::new(ReprojectionProvider::new(
                        layout.next_provider_id(),
                        w,
                        (obs.u, obs.v),
                        point(layout, obs.world_point),
                        camera(layout, obs.viewpoint),
                    )));
                }
                GroupKind::QuatNorm(key) => {
                    let slots = camera(layout, key);
                    providers.push(Box::new(QuatNormProvider::new(
                        layout.next_provider_id(),
                        w,
                        slots.rotation,
                    )));
                }
            }
        }

        Self {
            providers,
            num_vars: layout.num_variables(),
        }
    }

    pub fn providers(&self) -> &[Box<dyn ResidualProvider>] {
        &self.providers
    }

    fn vars<'a>(&self, layout: &'a VariableLayout, values: &'a DVector<f64>) -> Vars<'a> {
        Vars {
            layout,
            values,
        }
    }
}

/// [`ExplicitSystem`] paired with its layout, forming an LM-ready system.
pub struct ExplicitLmSystem<'a> {
    pub layout: &'a VariableLayout,
    pub system: ExplicitSystem,
}

impl LeastSquaresSystem for ExplicitLmSystem<'_> {
    fn num_variables(&self) -> usize {
        self.system.num_vars
    }

    fn residuals(&mut self, vars: &DVector<f64>) -> Result<DVector<f64>, SolveError> {
        let view = self.system.vars(self.layout, vars);
        let mut out = Vec::new();
        for p in &self.system.providers {
            out.extend(p.residuals(&view));
        }
        Ok(DVector::from_column_slice(&out))
    }

    fn jacobian(&mut self, vars: &DVector<f64>) -> Result<DMatrix<f64>, SolveError> {
        let view = self.system.vars(self.layout, vars);
        let m: usize = self.system.providers.iter().map(|p| p.residual_count()).sum();
        let mut jac = DMatrix::zeros(m, self.system.num_vars);
        let mut row = 0;
        for p in &self.system.providers {
            let local = p.jacobian(&view);
            debug_assert_eq!(local.len(), p.residual_count());
            for local_row in local {
                for (col_pos, var_index) in p.variable_indices().iter().enumerate() {
                    jac[(row, *var_index)] += local_row[col_pos];
                }
                row += 1;
            }
        }
        Ok(jac)
    }

    fn jacobian_rows(&mut self, vars: &DVector<f64>) -> Result<SparseJacobian, SolveError> {
        let view = self.system.vars(self.layout, vars);
        let mut rows = Vec::new();
        for p in &self.system.providers {
            for local_row in p.jacobian(&view) {
                let entries: Vec<(usize, f64)> = p
                    .variable_indices()
                    .iter()
                    .zip(local_row.iter())
                    .filter(|(_, v)| **v != 0.0)
                    .map(|(i, v)| (*i, *v))
                    .collect();
                rows.push(entries);
            }
        }
        Ok(SparseJacobian { rows })
    }
}
