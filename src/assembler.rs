use std::collections::HashMap;

use num_bigint::{BigInt, BigUint};

use crate::chunk::{self, Op};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmErrorKind {
    UnknownOpcode(String),
    UnknownSymbol(String),
    DuplicateLabel(String),
    BadLabel(String),
    MissingOperand(&'static str),
    UnexpectedOperand(&'static str),
    BadOperand(String),
    ExtraTokens,
}

impl std::fmt::Display for AsmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmErrorKind::UnknownOpcode(token) => write!(f, "unknown opcode '{token}'"),
            AsmErrorKind::UnknownSymbol(token) => write!(f, "unknown label '{token}'"),
            AsmErrorKind::DuplicateLabel(name) => write!(f, "duplicate label '{name}'"),
            AsmErrorKind::BadLabel(name) => write!(f, "invalid label '{name}'"),
            AsmErrorKind::MissingOperand(mnemonic) => {
                write!(f, "{mnemonic} requires an operand")
            }
            AsmErrorKind::UnexpectedOperand(mnemonic) => {
                write!(f, "{mnemonic} takes no operand")
            }
            AsmErrorKind::BadOperand(token) => write!(f, "invalid operand '{token}'"),
            AsmErrorKind::ExtraTokens => write!(f, "unexpected extra tokens"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblerError {
    pub line: usize,
    pub kind: AsmErrorKind,
}

impl AssemblerError {
    fn new(line: usize, kind: AsmErrorKind) -> Self {
        Self { line, kind }
    }
}

impl std::fmt::Display for AssemblerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {}", self.line, self.kind)
    }
}

impl std::error::Error for AssemblerError {}

struct Pending {
    op: Op,
    operand: Option<String>,
    line: usize,
}

/// Assemble source text into the chunk sequence.
///
/// Pass one records labels against the chunk index they precede and
/// collects one record per instruction line; pass two resolves operands
/// (literals, or labels as relative offsets) and invokes the codec. Forward
/// references are free because pass one fixes every index first.
pub fn assemble(source: &str) -> Result<Vec<BigUint>, AssemblerError> {
    let mut instructions: Vec<Pending> = Vec::new();
    let mut labels: HashMap<String, usize> = HashMap::new();

    for (line_idx, raw_line) in source.lines().enumerate() {
        let line_no = line_idx + 1;
        let mut line = strip_comment(raw_line).trim();

        while let Some((name, rest)) = split_label(line) {
            if !is_identifier(name) {
                return Err(AssemblerError::new(
                    line_no,
                    AsmErrorKind::BadLabel(name.to_string()),
                ));
            }
            if labels.insert(name.to_string(), instructions.len()).is_some() {
                return Err(AssemblerError::new(
                    line_no,
                    AsmErrorKind::DuplicateLabel(name.to_string()),
                ));
            }
            line = rest.trim();
        }
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let mnemonic = parts.next().unwrap_or("");
        let op = Op::parse_mnemonic(mnemonic).ok_or_else(|| {
            AssemblerError::new(line_no, AsmErrorKind::UnknownOpcode(mnemonic.to_string()))
        })?;
        let operand = parts.next().map(str::to_string);
        if parts.next().is_some() {
            return Err(AssemblerError::new(line_no, AsmErrorKind::ExtraTokens));
        }
        match (op.arity(), &operand) {
            (1, None) => {
                return Err(AssemblerError::new(
                    line_no,
                    AsmErrorKind::MissingOperand(op.mnemonic()),
                ));
            }
            (0, Some(_)) => {
                return Err(AssemblerError::new(
                    line_no,
                    AsmErrorKind::UnexpectedOperand(op.mnemonic()),
                ));
            }
            _ => {}
        }
        instructions.push(Pending {
            op,
            operand,
            line: line_no,
        });
    }

    let mut chunks = Vec::with_capacity(instructions.len());
    for (index, pending) in instructions.iter().enumerate() {
        let operand = match &pending.operand {
            None => BigInt::from(0),
            Some(token) => resolve_operand(token, index, &labels, pending.line)?,
        };
        let chunk = chunk::encode(pending.op, &operand).map_err(|err| {
            AssemblerError::new(pending.line, AsmErrorKind::BadOperand(err.to_string()))
        })?;
        chunks.push(chunk);
    }
    Ok(chunks)
}

/// Literal operands parse as signed decimal big integers; identifier
/// operands resolve against the label table to the relative offset measured
/// from the position after the instruction.
fn resolve_operand(
    token: &str,
    index: usize,
    labels: &HashMap<String, usize>,
    line: usize,
) -> Result<BigInt, AssemblerError> {
    if let Some(value) = parse_int(token) {
        return Ok(value);
    }
    if is_identifier(token) {
        let target = labels.get(token).ok_or_else(|| {
            AssemblerError::new(line, AsmErrorKind::UnknownSymbol(token.to_string()))
        })?;
        return Ok(BigInt::from(*target as i64 - (index as i64 + 1)));
    }
    Err(AssemblerError::new(
        line,
        AsmErrorKind::BadOperand(token.to_string()),
    ))
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// `label: rest` at the start of a line, if present.
fn split_label(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let head = &line[..colon];
    if head.is_empty() || head.contains(char::is_whitespace) {
        return None;
    }
    Some((head, &line[colon + 1..]))
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn parse_int(token: &str) -> Option<BigInt> {
    let (negative, digits) = match token.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, token.strip_prefix('+').unwrap_or(token)),
    };
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let magnitude = BigInt::parse_bytes(digits.as_bytes(), 10)?;
    Some(if negative { -magnitude } else { magnitude })
}
