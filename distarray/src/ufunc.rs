/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Elementwise functions.
//!
//! A [`Ufunc`] is a named scalar kernel with a fixed number of inputs
//! and a single output. The scheduler invokes it once per element of
//! an output apply-sub-block. Binary ufuncs double as reduction
//! operators.

use std::fmt;
use std::sync::Arc;

type Kernel = dyn Fn(&[f64]) -> f64 + Send + Sync;

/// An elementwise function.
#[derive(Clone)]
pub struct Ufunc {
    name: Arc<str>,
    nin: usize,
    identity: Option<f64>,
    kernel: Arc<Kernel>,
}

impl fmt::Debug for Ufunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ufunc")
            .field("name", &self.name)
            .field("nin", &self.nin)
            .field("identity", &self.identity)
            .finish()
    }
}

impl Ufunc {
    /// Create a ufunc from a kernel taking `nin` arguments.
    pub fn new(
        name: impl Into<Arc<str>>,
        nin: usize,
        kernel: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            nin,
            identity: None,
            kernel: Arc::new(kernel),
        }
    }

    /// Set the identity element of a binary function.
    pub fn with_identity(mut self, identity: f64) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn nin(&self) -> usize {
        self.nin
    }

    pub fn identity(&self) -> Option<f64> {
        self.identity
    }

    /// Apply the kernel to one set of arguments.
    #[inline]
    pub fn call(&self, args: &[f64]) -> f64 {
        debug_assert_eq!(args.len(), self.nin);
        (self.kernel)(args)
    }

    pub fn identity_copy() -> Self {
        Self::new("copy", 1, |a| a[0])
    }

    pub fn add() -> Self {
        Self::new("add", 2, |a| a[0] + a[1]).with_identity(0.0)
    }

    pub fn subtract() -> Self {
        Self::new("subtract", 2, |a| a[0] - a[1])
    }

    pub fn multiply() -> Self {
        Self::new("multiply", 2, |a| a[0] * a[1]).with_identity(1.0)
    }

    pub fn divide() -> Self {
        Self::new("divide", 2, |a| a[0] / a[1])
    }

    pub fn maximum() -> Self {
        Self::new("maximum", 2, |a| a[0].max(a[1]))
    }

    pub fn minimum() -> Self {
        Self::new("minimum", 2, |a| a[0].min(a[1]))
    }

    pub fn power() -> Self {
        Self::new("power", 2, |a| a[0].powf(a[1]))
    }

    pub fn negative() -> Self {
        Self::new("negative", 1, |a| -a[0])
    }

    pub fn absolute() -> Self {
        Self::new("absolute", 1, |a| a[0].abs())
    }

    pub fn sqrt() -> Self {
        Self::new("sqrt", 1, |a| a[0].sqrt())
    }

    /// Look up a built-in ufunc by name.
    pub fn by_name(name: &str) -> Option<Self> {
        Some(match name {
            "copy" => Self::identity_copy(),
            "add" => Self::add(),
            "subtract" => Self::subtract(),
            "multiply" => Self::multiply(),
            "divide" => Self::divide(),
            "maximum" => Self::maximum(),
            "minimum" => Self::minimum(),
            "power" => Self::power(),
            "negative" => Self::negative(),
            "absolute" => Self::absolute(),
            "sqrt" => Self::sqrt(),
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins() {
        assert_eq!(Ufunc::add().call(&[1.0, 2.0]), 3.0);
        assert_eq!(Ufunc::subtract().call(&[1.0, 2.0]), -1.0);
        assert_eq!(Ufunc::maximum().call(&[1.0, 2.0]), 2.0);
        assert_eq!(Ufunc::negative().call(&[4.0]), -4.0);
        assert_eq!(Ufunc::sqrt().call(&[9.0]), 3.0);
        assert_eq!(Ufunc::add().identity(), Some(0.0));
        assert_eq!(Ufunc::divide().identity(), None);
    }

    #[test]
    fn test_by_name() {
        let f = Ufunc::by_name("multiply").unwrap();
        assert_eq!(f.name(), "multiply");
        assert_eq!(f.nin(), 2);
        assert_eq!(f.call(&[3.0, 4.0]), 12.0);
        assert!(Ufunc::by_name("frobnicate").is_none());
    }

    #[test]
    fn test_custom() {
        let axpy = Ufunc::new("axpy", 3, |a| a[0] * a[1] + a[2]);
        assert_eq!(axpy.call(&[2.0, 3.0, 1.0]), 7.0);
        assert_eq!(format!("{:?}", axpy), "Ufunc { name: \"axpy\", nin: 3, identity: None }");
    }
}
