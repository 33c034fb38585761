// SPDX-License-Identifier: MIT

//! Policy opcodes, their wire format and the opcode compiler.
//!
//! A compiled policy is one little-endian buffer:
//!
//! ```text
//! u32 opcode count
//! count x { u16 id, u16 options, i16 parameter, u16 reserved, u32 args[4] }
//! free space
//! string pool (NUL-terminated UTF-16LE), filled from the end down
//! ```
//!
//! String arguments are stored as an offset from the start of the record
//! that uses them.

use bitflags::bitflags;
use widestring::U16Str;

use super::params::ParameterSet;
use super::PolicyError;

pub const HEADER_LEN: usize = 4;
pub const RECORD_LEN: usize = 24;

/// Start position: find the first occurrence anywhere after the match
/// context.
pub const SEEK_FORWARD: i32 = -1;
/// Start position: the match must end where the argument ends.
pub const SEEK_TO_END: i32 = 0xFFFFF;

/// No parameter; for opcodes that do not test one.
pub const NO_PARAMETER: i16 = -1;

bitflags! {
    /// Options every opcode carries.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct OpcodeOptions: u16 {
        const NEGATE_EVAL = 1;
        const CLEAR_CONTEXT = 2;
        const USE_OR_EVAL = 4;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StringMatchOptions: u32 {
        const CASE_INSENSITIVE = 1;
        /// The match must cover the argument up to its end.
        const EXACT_LENGTH = 2;
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpcodeId {
    AlwaysFalse = 0,
    AlwaysTrue = 1,
    NumberMatch = 2,
    UlongMatchRange = 3,
    UlongAndMatch = 4,
    WStringMatch = 5,
    Action = 6,
}

impl OpcodeId {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => OpcodeId::AlwaysFalse,
            1 => OpcodeId::AlwaysTrue,
            2 => OpcodeId::NumberMatch,
            3 => OpcodeId::UlongMatchRange,
            4 => OpcodeId::UlongAndMatch,
            5 => OpcodeId::WStringMatch,
            6 => OpcodeId::Action,
            _ => return None,
        })
    }
}

/// What the broker should do when a rule matches.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyAction {
    AskBroker = 1,
    DenyAccess = 2,
    GiveReadonly = 3,
    GiveAllaccess = 4,
    GiveCached = 5,
    GiveFirst = 6,
    SignalAlarm = 7,
    FakeSuccess = 8,
    FakeAccessDenied = 9,
    TerminateProcess = 10,
}

impl PolicyAction {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => PolicyAction::AskBroker,
            2 => PolicyAction::DenyAccess,
            3 => PolicyAction::GiveReadonly,
            4 => PolicyAction::GiveAllaccess,
            5 => PolicyAction::GiveCached,
            6 => PolicyAction::GiveFirst,
            7 => PolicyAction::SignalAlarm,
            8 => PolicyAction::FakeSuccess,
            9 => PolicyAction::FakeAccessDenied,
            10 => PolicyAction::TerminateProcess,
            _ => return None,
        })
    }
}

/// Value kinds a number match compares.
const NUMBER_U32: u32 = 1;
const NUMBER_PTR: u32 = 2;

/// Outcome of one opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    True,
    False,
    Error,
    Action(PolicyAction),
}

/// Per-rule state carried between opcodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchContext {
    /// UTF-16 units of the string argument consumed by earlier matches.
    pub position: usize,
}

impl MatchContext {
    pub fn clear(&mut self) {
        *self = MatchContext::default();
    }
}

/// One decoded record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opcode {
    pub id: u16,
    pub options: OpcodeOptions,
    pub parameter: i16,
    pub args: [u32; 4],
    /// The string argument of a string match; `None` if it could not be read.
    pub string: Option<Vec<u16>>,
}

impl Opcode {
    /// Decode the record at `offset` of a compiled buffer.
    pub fn decode(buffer: &[u8], offset: usize) -> Option<Self> {
        let record = buffer.get(offset..offset + RECORD_LEN)?;
        let u16_at = |i: usize| u16::from_le_bytes([record[i], record[i + 1]]);
        let u32_at = |i: usize| u32::from_le_bytes([record[i], record[i + 1], record[i + 2], record[i + 3]]);
        let id = u16_at(0);
        let args = [u32_at(8), u32_at(12), u32_at(16), u32_at(20)];
        let string = if id == OpcodeId::WStringMatch as u16 {
            relative_string(buffer, offset, args[0], args[1])
        } else {
            None
        };
        Some(Opcode {
            id,
            options: OpcodeOptions::from_bits_retain(u16_at(2)),
            parameter: u16_at(4) as i16,
            args,
            string,
        })
    }

    pub fn is_action(&self) -> bool {
        self.id == OpcodeId::Action as u16
    }

    /// Evaluate against the call's parameters, then apply the generic
    /// options.
    pub fn evaluate(&self, parameters: &[ParameterSet<'_>], context: &mut MatchContext) -> EvalResult {
        let selected = match usize::try_from(self.parameter) {
            Ok(index) => match parameters.get(index) {
                Some(p) => Some(p),
                None => return EvalResult::Error,
            },
            Err(_) => None,
        };
        let mut result = self.evaluate_helper(selected, context);

        if self.options.contains(OpcodeOptions::NEGATE_EVAL) {
            result = match result {
                EvalResult::True => EvalResult::False,
                EvalResult::False => EvalResult::True,
                _ => EvalResult::Error,
            };
        }
        if self.options.contains(OpcodeOptions::CLEAR_CONTEXT) {
            context.clear();
        }
        result
    }

    fn evaluate_helper(&self, parameter: Option<&ParameterSet<'_>>, context: &mut MatchContext) -> EvalResult {
        let Some(id) = OpcodeId::from_u16(self.id) else {
            return EvalResult::Error;
        };
        match id {
            OpcodeId::AlwaysFalse => EvalResult::False,
            OpcodeId::AlwaysTrue => EvalResult::True,
            OpcodeId::Action => match PolicyAction::from_u32(self.args[0]) {
                Some(action) => EvalResult::Action(action),
                None => EvalResult::Error,
            },
            OpcodeId::NumberMatch => {
                let Some(p) = parameter else { return EvalResult::Error };
                let matched = match (self.args[0], p.get_u32(), p.get_ptr()) {
                    (NUMBER_U32, Some(value), _) => value == self.args[1],
                    (NUMBER_PTR, _, Some(pointer)) => {
                        pointer as usize as u64 == (self.args[1] as u64 | (self.args[2] as u64) << 32)
                    }
                    _ => return EvalResult::Error,
                };
                bool_result(matched)
            }
            OpcodeId::UlongMatchRange => match parameter.and_then(ParameterSet::get_u32) {
                Some(value) => bool_result(self.args[0] <= value && value <= self.args[1]),
                None => EvalResult::Error,
            },
            OpcodeId::UlongAndMatch => match parameter.and_then(ParameterSet::get_u32) {
                Some(value) => bool_result(value & self.args[0] != 0),
                None => EvalResult::Error,
            },
            OpcodeId::WStringMatch => {
                let (Some(source), Some(pattern)) =
                    (parameter.and_then(ParameterSet::get_wide_units), self.string.as_deref())
                else {
                    return EvalResult::Error;
                };
                wstring_match(
                    source,
                    pattern,
                    self.args[2] as i32,
                    StringMatchOptions::from_bits_retain(self.args[3]),
                    context,
                )
            }
        }
    }
}

fn bool_result(value: bool) -> EvalResult {
    if value { EvalResult::True } else { EvalResult::False }
}

fn relative_string(buffer: &[u8], record: usize, offset: u32, len: u32) -> Option<Vec<u16>> {
    let start = record.checked_add(offset as usize)?;
    let end = start.checked_add((len as usize).checked_mul(2)?)?;
    let bytes = buffer.get(start..end)?;
    Some(bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect())
}

fn upcase(unit: u16) -> u16 {
    let Some(c) = char::from_u32(unit as u32) else {
        return unit;
    };
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(u), None) if (u as u32) <= 0xFFFF => u as u32 as u16,
        _ => unit,
    }
}

fn units_equal(a: &[u16], b: &[u16], case_insensitive: bool) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b)
            .all(|(x, y)| x == y || (case_insensitive && upcase(*x) == upcase(*y)))
}

/// Match `pattern` inside `source`, continuing after the units earlier
/// matches of the same rule consumed.
fn wstring_match(
    source: &[u16],
    pattern: &[u16],
    start_position: i32,
    options: StringMatchOptions,
    context: &mut MatchContext,
) -> EvalResult {
    let Some(source) = source.get(context.position..) else {
        return EvalResult::False;
    };
    let case_insensitive = options.contains(StringMatchOptions::CASE_INSENSITIVE);
    let source_len = source.len();
    let match_len = pattern.len();
    if source_len == 0 || match_len > source_len {
        return EvalResult::False;
    }

    if start_position >= 0 {
        let start = if start_position == SEEK_TO_END {
            source_len - match_len
        } else {
            let start = start_position as usize;
            if options.contains(StringMatchOptions::EXACT_LENGTH) && start + match_len != source_len {
                return EvalResult::False;
            }
            start
        };
        if start + match_len > source_len {
            return EvalResult::False;
        }
        if units_equal(&source[start..start + match_len], pattern, case_insensitive) {
            context.position += start + match_len;
            return EvalResult::True;
        }
        return EvalResult::False;
    }

    for start in 0..=(source_len - match_len) {
        if units_equal(&source[start..start + match_len], pattern, case_insensitive) {
            context.position += start + match_len;
            return EvalResult::True;
        }
    }
    EvalResult::False
}

/// Compiles opcodes into a policy buffer of fixed capacity.
///
/// Records fill the buffer from the front, strings from the back; a
/// `make_*` call fails once the two would overlap.
#[derive(Debug, Clone)]
pub struct OpcodeFactory {
    buffer: Vec<u8>,
    count: u32,
    top: usize,
    bottom: usize,
}

impl OpcodeFactory {
    pub fn new(capacity: usize) -> Self {
        OpcodeFactory { buffer: vec![0; capacity], count: 0, top: HEADER_LEN.min(capacity), bottom: capacity }
    }

    pub fn opcode_count(&self) -> u32 {
        self.count
    }

    /// Bytes left between the records and the string pool.
    pub fn remaining(&self) -> usize {
        self.bottom.saturating_sub(self.top)
    }

    pub fn make_always_false(&mut self, options: OpcodeOptions) -> Result<(), PolicyError> {
        self.push(OpcodeId::AlwaysFalse, options, NO_PARAMETER, [0; 4])
    }

    pub fn make_always_true(&mut self, options: OpcodeOptions) -> Result<(), PolicyError> {
        self.push(OpcodeId::AlwaysTrue, options, NO_PARAMETER, [0; 4])
    }

    pub fn make_number_match(&mut self, parameter: i16, value: u32, options: OpcodeOptions) -> Result<(), PolicyError> {
        self.push(OpcodeId::NumberMatch, options, parameter, [NUMBER_U32, value, 0, 0])
    }

    /// Match a pointer argument.  Only its address is compared.
    pub fn make_void_ptr_match(
        &mut self,
        parameter: i16,
        value: *const std::ffi::c_void,
        options: OpcodeOptions,
    ) -> Result<(), PolicyError> {
        let value = value as usize as u64;
        self.push(OpcodeId::NumberMatch, options, parameter, [NUMBER_PTR, value as u32, (value >> 32) as u32, 0])
    }

    /// Match `lower <= argument <= upper`.
    pub fn make_ulong_match_range(
        &mut self,
        parameter: i16,
        lower: u32,
        upper: u32,
        options: OpcodeOptions,
    ) -> Result<(), PolicyError> {
        self.push(OpcodeId::UlongMatchRange, options, parameter, [lower, upper, 0, 0])
    }

    /// Match when the argument shares a bit with `mask`.
    pub fn make_ulong_and_match(&mut self, parameter: i16, mask: u32, options: OpcodeOptions) -> Result<(), PolicyError> {
        self.push(OpcodeId::UlongAndMatch, options, parameter, [mask, 0, 0, 0])
    }

    /// Match `literal` at `start_position` (an index, [`SEEK_FORWARD`] or
    /// [`SEEK_TO_END`]) of a string argument.
    pub fn make_wstring_match(
        &mut self,
        parameter: i16,
        literal: &U16Str,
        start_position: i32,
        match_options: StringMatchOptions,
        options: OpcodeOptions,
    ) -> Result<(), PolicyError> {
        let units = literal.as_slice();
        let string_len = (units.len() + 1) * 2;
        let needed = RECORD_LEN + string_len;
        if self.remaining() < needed {
            return Err(PolicyError::BufferFull { needed, available: self.remaining() });
        }
        let record = self.top;
        let string_at = self.bottom - string_len;
        for (i, unit) in units.iter().chain(std::iter::once(&0)).enumerate() {
            self.buffer[string_at + 2 * i..string_at + 2 * i + 2].copy_from_slice(&unit.to_le_bytes());
        }
        self.bottom = string_at;
        let args = [(string_at - record) as u32, units.len() as u32, start_position as u32, match_options.bits()];
        self.push(OpcodeId::WStringMatch, options, parameter, args)
    }

    pub fn make_action(&mut self, action: PolicyAction, options: OpcodeOptions) -> Result<(), PolicyError> {
        self.push(OpcodeId::Action, options, NO_PARAMETER, [action as u32, 0, 0, 0])
    }

    fn push(&mut self, id: OpcodeId, options: OpcodeOptions, parameter: i16, args: [u32; 4]) -> Result<(), PolicyError> {
        if self.remaining() < RECORD_LEN {
            return Err(PolicyError::BufferFull { needed: RECORD_LEN, available: self.remaining() });
        }
        let record = &mut self.buffer[self.top..self.top + RECORD_LEN];
        record[0..2].copy_from_slice(&(id as u16).to_le_bytes());
        record[2..4].copy_from_slice(&options.bits().to_le_bytes());
        record[4..6].copy_from_slice(&parameter.to_le_bytes());
        record[6..8].copy_from_slice(&0u16.to_le_bytes());
        for (i, arg) in args.iter().enumerate() {
            record[8 + 4 * i..12 + 4 * i].copy_from_slice(&arg.to_le_bytes());
        }
        self.top += RECORD_LEN;
        self.count += 1;
        Ok(())
    }

    /// The compiled policy.
    pub fn finish(mut self) -> Vec<u8> {
        if self.buffer.len() >= HEADER_LEN {
            self.buffer[..HEADER_LEN].copy_from_slice(&self.count.to_le_bytes());
        }
        self.buffer
    }
}
