//! A file open policy evaluated the way a broker would.

use std::ffi::c_void;

use widestring::{u16cstr, u16str};

use crate::policy::{
    CountedParameterSet, EvaluationOptions, OpcodeFactory, OpcodeOptions, ParameterOrdinal, PolicyAction,
    PolicyProcessor, PolicyResult, StringMatchOptions, SEEK_TO_END,
};

const CREATE_NEW: u32 = 1;
const OPEN_EXISTING: u32 = 3;
const OPEN_ALWAYS: u32 = 4;

#[derive(Debug, Clone, Copy)]
enum OpenFileArgs {
    Name,
    Disposition,
    SecurityDescriptor,
}

impl ParameterOrdinal for OpenFileArgs {
    const COUNT: usize = 3;

    fn index(self) -> usize {
        self as usize
    }
}

/// Rule one: opening an existing file under `c:\documents and settings\`
/// without a security descriptor is faked as a success.
///
/// Rule two: a `.txt` file opened any way except `CREATE_NEW` is denied.
fn file_policy() -> PolicyProcessor {
    let none = OpcodeOptions::empty();
    let mut f = OpcodeFactory::new(1024);
    f.make_wstring_match(
        OpenFileArgs::Name as i16,
        u16str!("c:\\documents and settings\\"),
        0,
        StringMatchOptions::CASE_INSENSITIVE,
        none,
    )
    .unwrap();
    f.make_number_match(OpenFileArgs::Disposition as i16, OPEN_EXISTING, none).unwrap();
    f.make_void_ptr_match(OpenFileArgs::SecurityDescriptor as i16, std::ptr::null(), none).unwrap();
    f.make_action(PolicyAction::FakeSuccess, none).unwrap();

    f.make_wstring_match(
        OpenFileArgs::Name as i16,
        u16str!(".txt"),
        SEEK_TO_END,
        StringMatchOptions::CASE_INSENSITIVE,
        none,
    )
    .unwrap();
    f.make_number_match(OpenFileArgs::Disposition as i16, CREATE_NEW, OpcodeOptions::NEGATE_EVAL).unwrap();
    f.make_action(PolicyAction::FakeAccessDenied, none).unwrap();
    assert_eq!(f.opcode_count(), 7);

    PolicyProcessor::new(&f.finish()).unwrap()
}

#[test]
fn test_file_open_policy() {
    let policy = file_policy();
    let name = u16cstr!("c:\\Documents and Settings\\Microsoft\\BLAH.txt");
    let security: *const c_void = std::ptr::null();

    let evaluate = |disposition: u32| {
        let mut params = CountedParameterSet::<OpenFileArgs, 3>::new();
        params
            .set(OpenFileArgs::Name, name)
            .set(OpenFileArgs::Disposition, &disposition)
            .set(OpenFileArgs::SecurityDescriptor, &security);
        policy.evaluate(EvaluationOptions::SHORT_EVAL, params.as_slice())
    };

    let open = evaluate(OPEN_EXISTING);
    assert_eq!(open.result(), PolicyResult::PolicyMatch);
    assert_eq!(open.action(), Some(PolicyAction::FakeSuccess));

    let create = evaluate(CREATE_NEW);
    assert_eq!(create.result(), PolicyResult::NoPolicyMatch);
    assert_eq!(create.action(), None);

    let open_always = evaluate(OPEN_ALWAYS);
    assert_eq!(open_always.result(), PolicyResult::PolicyMatch);
    assert_eq!(open_always.action(), Some(PolicyAction::FakeAccessDenied));
}

#[test]
fn test_file_open_policy_other_paths() {
    let policy = file_policy();
    let security: *const c_void = 0x1000 as *const c_void;
    let disposition = OPEN_EXISTING;

    for (path, expected) in [
        // A security descriptor fails rule one; rule two still applies.
        (u16cstr!("c:\\documents and settings\\a.TXT"), Some(PolicyAction::FakeAccessDenied)),
        (u16cstr!("c:\\windows\\a.dll"), None),
        (u16cstr!("c:\\windows\\a.txt.bak"), None),
    ] {
        let mut params = CountedParameterSet::<OpenFileArgs, 3>::new();
        params
            .set(OpenFileArgs::Name, path)
            .set(OpenFileArgs::Disposition, &disposition)
            .set(OpenFileArgs::SecurityDescriptor, &security);
        let evaluation = policy.evaluate(EvaluationOptions::SHORT_EVAL, params.as_slice());
        assert_eq!(evaluation.action(), expected, "{}", path.display());
    }
}

#[test]
fn test_unset_parameter_fails_closed() {
    let policy = file_policy();
    let name = u16cstr!("c:\\documents and settings\\a.txt");
    let mut params = CountedParameterSet::<OpenFileArgs, 3>::new();
    params.set(OpenFileArgs::Name, name);

    // The number matches error on the unset disposition.
    let lenient = policy.evaluate(EvaluationOptions::SHORT_EVAL, params.as_slice());
    assert_eq!(lenient.result(), PolicyResult::NoPolicyMatch);
    let strict = policy.evaluate(EvaluationOptions::SHORT_EVAL | EvaluationOptions::STOP_ON_ERRORS, params.as_slice());
    assert_eq!(strict.result(), PolicyResult::PolicyError);
}
