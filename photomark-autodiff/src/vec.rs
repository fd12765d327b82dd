//! Small fixed-size vector and quaternion types over any [`Real`] scalar.

use crate::Real;

/// 3-vector of residual-expression scalars.
#[derive(Clone, Copy, Debug)]
pub struct Var3<S> {
    pub x: S,
    pub y: S,
    pub z: S,
}

impl<S: Real> Var3<S> {
    pub fn new(x: S, y: S, z: S) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> S {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn cross(self, rhs: Self) -> Self {
        Self {
            x: self.y * rhs.z - self.z * rhs.y,
            y: self.z * rhs.x - self.x * rhs.z,
            z: self.x * rhs.y - self.y * rhs.x,
        }
    }

    pub fn norm_squared(self) -> S {
        self.dot(self)
    }

    pub fn norm(self) -> S {
        self.norm_squared().sqrt()
    }

    pub fn scaled(self, s: S) -> Self {
        Self {
            x: self.x * s,
            y: self.y * s,
            z: self.z * s,
        }
    }

    pub fn normalized(self) -> Self {
        let inv = self.x.lift(1.0) / self.norm();
        self.scaled(inv)
    }

    /// Angle between two vectors in radians.
    ///
    /// `atan2(‖u×v‖, u·v)` rather than `acos` of the normalised dot: the
    /// gradient stays bounded as the vectors approach parallel.
    pub fn angle_between(self, rhs: Self) -> S {
        let cross_norm = self.cross(rhs).norm();
        cross_norm.atan2(self.dot(rhs))
    }

    pub fn to_array(self) -> [S; 3] {
        [self.x, self.y, self.z]
    }
}

impl<S: Real> std::ops::Add for Var3<S> {
    type Output = Var3<S>;
    fn add(self, rhs: Self) -> Self {
        Self {
            x: self.x + rhs.x,
            y: self.y + rhs.y,
            z: self.z + rhs.z,
        }
    }
}

impl<S: Real> std::ops::Sub for Var3<S> {
    type Output = Var3<S>;
    fn sub(self, rhs: Self) -> Self {
        Self {
            x: self.x - rhs.x,
            y: self.y - rhs.y,
            z: self.z - rhs.z,
        }
    }
}

impl<S: Real> std::ops::Neg for Var3<S> {
    type Output = Var3<S>;
    fn neg(self) -> Self {
        Self {
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
    }
}

/// Quaternion `(w, x, y, z)` over any [`Real`] scalar.
///
/// Stored quaternions are allowed to drift off unit length during a solve;
/// rotation therefore uses the homogeneous sandwich formula divided by the
/// squared norm, which is exact for any non-zero quaternion.
#[derive(Clone, Copy, Debug)]
pub struct VarQuat<S> {
    pub w: S,
    pub x: S,
    pub y: S,
    pub z: S,
}

impl<S: Real> VarQuat<S> {
    pub fn new(w: S, x: S, y: S, z: S) -> Self {
        Self { w, x, y, z }
    }

    pub fn norm_squared(self) -> S {
        self.w * self.w + self.x * self.x + self.y * self.y + self.z * self.z
    }

    /// Rotate `v` by this quaternion:
    /// `(v·(w² − ‖u‖²) + 2u(u·v) + 2w(u×v)) / ‖q‖²` with `u = (x, y, z)`.
    pub fn rotate(self, v: Var3<S>) -> Var3<S> {
        let u = Var3::new(self.x, self.y, self.z);
        let two = self.w.lift(2.0);
        let s = self.w * self.w - u.norm_squared();
        let a = v.scaled(s);
        let b = u.scaled(two * u.dot(v));
        let c = u.cross(v).scaled(two * self.w);
        let inv = self.w.lift(1.0) / self.norm_squared();
        (a + b + c).scaled(inv)
    }

    /// Rotate by the inverse (conjugate) of this quaternion.
    pub fn rotate_inverse(self, v: Var3<S>) -> Var3<S> {
        Self {
            w: self.w,
            x: -self.x,
            y: -self.y,
            z: -self.z,
        }
        .rotate(v)
    }
}
