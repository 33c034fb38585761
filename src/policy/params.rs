// SPDX-License-Identifier: MIT

//! Views onto the arguments of an intercepted call.
//!
//! A [`ParameterSet`] borrows one argument and remembers its type.  Reads
//! with the wrong type fail; the value is never reinterpreted.

use std::{ffi::c_void, marker::PhantomData};

use widestring::{U16CStr, U16CString, U16Str, U16String};

/// The type tag of a [`ParameterSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterType {
    Unset,
    Ulong,
    VoidPtr,
    WideString,
    CountedString,
}

/// One borrowed argument.
#[derive(Debug, Clone, Copy, Default)]
pub enum ParameterSet<'a> {
    /// Not bound to an argument; every read fails.
    #[default]
    Unset,
    Ulong(&'a u32),
    VoidPtr(&'a *const c_void),
    /// NUL-terminated UTF-16.
    WideString(&'a U16CStr),
    /// Length-prefixed UTF-16, the `UNICODE_STRING` shape.
    CountedString(&'a U16Str),
}

impl<'a> ParameterSet<'a> {
    pub fn parameter_type(&self) -> ParameterType {
        match self {
            ParameterSet::Unset => ParameterType::Unset,
            ParameterSet::Ulong(_) => ParameterType::Ulong,
            ParameterSet::VoidPtr(_) => ParameterType::VoidPtr,
            ParameterSet::WideString(_) => ParameterType::WideString,
            ParameterSet::CountedString(_) => ParameterType::CountedString,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, ParameterSet::Unset)
    }

    pub fn get_u32(&self) -> Option<u32> {
        match self {
            ParameterSet::Ulong(v) => Some(**v),
            _ => None,
        }
    }

    pub fn get_ptr(&self) -> Option<*const c_void> {
        match self {
            ParameterSet::VoidPtr(v) => Some(**v),
            _ => None,
        }
    }

    pub fn get_wide_cstr(&self) -> Option<&'a U16CStr> {
        match self {
            ParameterSet::WideString(s) => Some(s),
            _ => None,
        }
    }

    pub fn get_counted_str(&self) -> Option<&'a U16Str> {
        match self {
            ParameterSet::CountedString(s) => Some(s),
            _ => None,
        }
    }

    /// The UTF-16 units of either string kind, without terminator.
    pub fn get_wide_units(&self) -> Option<&'a [u16]> {
        match self {
            ParameterSet::WideString(s) => Some(s.as_slice()),
            ParameterSet::CountedString(s) => Some(s.as_slice()),
            _ => None,
        }
    }
}

impl<'a> From<&'a u32> for ParameterSet<'a> {
    fn from(value: &'a u32) -> Self {
        ParameterSet::Ulong(value)
    }
}

impl<'a> From<&'a *const c_void> for ParameterSet<'a> {
    fn from(value: &'a *const c_void) -> Self {
        ParameterSet::VoidPtr(value)
    }
}

impl<'a> From<&'a U16CStr> for ParameterSet<'a> {
    fn from(value: &'a U16CStr) -> Self {
        ParameterSet::WideString(value)
    }
}

impl<'a> From<&'a U16CString> for ParameterSet<'a> {
    fn from(value: &'a U16CString) -> Self {
        ParameterSet::WideString(value.as_ucstr())
    }
}

impl<'a> From<&'a U16Str> for ParameterSet<'a> {
    fn from(value: &'a U16Str) -> Self {
        ParameterSet::CountedString(value)
    }
}

impl<'a> From<&'a U16String> for ParameterSet<'a> {
    fn from(value: &'a U16String) -> Self {
        ParameterSet::CountedString(value.as_ustr())
    }
}

/// The ordinal enum naming the interesting arguments of one call.
pub trait ParameterOrdinal: Copy {
    const COUNT: usize;

    fn index(self) -> usize;
}

/// The interesting arguments of one intercepted call, indexed by `A`.
#[derive(Debug, Clone, Copy)]
pub struct CountedParameterSet<'a, A: ParameterOrdinal, const N: usize> {
    parameters: [ParameterSet<'a>; N],
    ordinal: PhantomData<A>,
}

impl<'a, A: ParameterOrdinal, const N: usize> CountedParameterSet<'a, A, N> {
    pub fn new() -> Self {
        const { assert!(A::COUNT == N, "ordinal count does not match the parameter count") };
        CountedParameterSet { parameters: [ParameterSet::Unset; N], ordinal: PhantomData }
    }

    pub fn set(&mut self, ordinal: A, parameter: impl Into<ParameterSet<'a>>) -> &mut Self {
        self.parameters[ordinal.index()] = parameter.into();
        self
    }

    pub fn get(&self, ordinal: A) -> &ParameterSet<'a> {
        &self.parameters[ordinal.index()]
    }

    pub fn as_slice(&self) -> &[ParameterSet<'a>] {
        &self.parameters
    }

    pub fn len(&self) -> usize {
        N
    }

    pub fn is_empty(&self) -> bool {
        N == 0
    }
}

impl<'a, A: ParameterOrdinal, const N: usize> Default for CountedParameterSet<'a, A, N> {
    fn default() -> Self {
        Self::new()
    }
}
