// SPDX-License-Identifier: MIT

//! Evaluation of a compiled policy against one call's parameters.

use bitflags::bitflags;
use tracing::{debug, trace};

use super::opcodes::{EvalResult, MatchContext, Opcode, OpcodeOptions, PolicyAction, HEADER_LEN, RECORD_LEN};
use super::params::ParameterSet;
use super::PolicyError;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EvaluationOptions: u32 {
        /// Stop at the first opcode that decides the rule.  Required.
        const SHORT_EVAL = 1;
        /// Report an opcode error as a policy error instead of failing the
        /// rule.
        const STOP_ON_ERRORS = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyResult {
    NoPolicyMatch,
    PolicyMatch,
    PolicyError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEvaluation {
    result: PolicyResult,
    action: Option<PolicyAction>,
    opcode: Option<usize>,
}

impl PolicyEvaluation {
    fn no_match() -> Self {
        PolicyEvaluation { result: PolicyResult::NoPolicyMatch, action: None, opcode: None }
    }

    fn error() -> Self {
        PolicyEvaluation { result: PolicyResult::PolicyError, action: None, opcode: None }
    }

    pub fn result(&self) -> PolicyResult {
        self.result
    }

    /// The action of the matching rule.
    pub fn action(&self) -> Option<PolicyAction> {
        self.action
    }

    /// Index of the action opcode that matched.
    pub fn opcode(&self) -> Option<usize> {
        self.opcode
    }
}

/// A decoded policy.  Evaluation never mutates it.
#[derive(Debug, Clone)]
pub struct PolicyProcessor {
    opcodes: Vec<Opcode>,
}

impl PolicyProcessor {
    /// Decode a compiled buffer.  Only the header and record table are
    /// checked; bad record contents surface as opcode errors at evaluation.
    pub fn new(buffer: &[u8]) -> Result<Self, PolicyError> {
        let header: [u8; HEADER_LEN] = buffer
            .get(..HEADER_LEN)
            .and_then(|h| h.try_into().ok())
            .ok_or_else(|| PolicyError::Malformed("buffer shorter than its header".to_string()))?;
        let count = u32::from_le_bytes(header) as usize;
        let table_end = count
            .checked_mul(RECORD_LEN)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .filter(|end| *end <= buffer.len())
            .ok_or_else(|| PolicyError::Malformed(format!("{count} opcodes do not fit in {} bytes", buffer.len())))?;

        let opcodes = (HEADER_LEN..table_end)
            .step_by(RECORD_LEN)
            .filter_map(|offset| Opcode::decode(buffer, offset))
            .collect::<Vec<_>>();
        debug!(opcodes = opcodes.len(), "loaded policy");
        Ok(PolicyProcessor { opcodes })
    }

    pub fn opcode_count(&self) -> usize {
        self.opcodes.len()
    }

    /// Run the rules in order; the first rule whose match opcodes all
    /// succeed supplies the action.
    pub fn evaluate(&self, options: EvaluationOptions, parameters: &[ParameterSet<'_>]) -> PolicyEvaluation {
        if self.opcodes.is_empty() {
            return PolicyEvaluation::no_match();
        }
        if !options.contains(EvaluationOptions::SHORT_EVAL) {
            return PolicyEvaluation::error();
        }

        let mut context = MatchContext::default();
        let mut rule = RuleState::Matching;
        // An OR opcode failed and nothing in its group has succeeded yet.
        let mut or_group_failed = false;
        let mut evaluation = false;

        for (index, opcode) in self.opcodes.iter().enumerate() {
            if opcode.is_action() {
                let matched = match rule {
                    RuleState::OrMatched => true,
                    RuleState::Matching => !or_group_failed,
                    RuleState::Failed => false,
                };
                if !matched {
                    trace!(opcode = index, "rule failed");
                    context.clear();
                    rule = RuleState::Matching;
                    or_group_failed = false;
                    evaluation = false;
                    continue;
                }
            } else if rule != RuleState::Matching {
                continue;
            }

            let or_eval = opcode.options.contains(OpcodeOptions::USE_OR_EVAL);
            match opcode.evaluate(parameters, &mut context) {
                EvalResult::False => {
                    evaluation = false;
                    if or_eval {
                        or_group_failed = true;
                    } else {
                        rule = RuleState::Failed;
                    }
                }
                EvalResult::Error => {
                    if options.contains(EvaluationOptions::STOP_ON_ERRORS) {
                        return PolicyEvaluation::error();
                    }
                    trace!(opcode = index, "opcode error fails its rule");
                    evaluation = false;
                    if opcode.is_action() {
                        context.clear();
                        rule = RuleState::Matching;
                        or_group_failed = false;
                    } else {
                        rule = RuleState::Failed;
                    }
                }
                EvalResult::True => {
                    evaluation = true;
                    if or_eval {
                        // The first success of an OR group jumps to the action.
                        rule = RuleState::OrMatched;
                    }
                }
                EvalResult::Action(action) => {
                    return PolicyEvaluation { result: PolicyResult::PolicyMatch, action: Some(action), opcode: Some(index) };
                }
            }
        }

        if evaluation {
            // Match opcodes that succeeded without an action after them.
            return PolicyEvaluation::error();
        }
        PolicyEvaluation::no_match()
    }
}

/// Where the current rule stands while its match opcodes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleState {
    Matching,
    /// An opcode failed; the rest of the rule up to its action is skipped.
    Failed,
    /// An OR opcode succeeded; the rest of the rule up to its action is
    /// skipped and the action applies.
    OrMatched,
}
